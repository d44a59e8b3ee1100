//! Typed views over the hash entries written by the traffic-control engine.

use std::{fmt, str::FromStr};

use crate::Fields;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("missing field `{0}`")]
    Missing(&'static str),
    #[error("invalid value {value:?} for field `{field}`")]
    Invalid { field: &'static str, value: String },
    #[error("unsupported service type {0:?}")]
    ServiceType(String),
}

type Result<T> = std::result::Result<T, RecordError>;

fn required<'a>(fields: &'a Fields, field: &'static str) -> Result<&'a str> {
    match fields.get(field).map(|v| v.trim()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(RecordError::Missing(field)),
    }
}

fn optional<'a>(fields: &'a Fields, field: &'static str) -> Option<&'a str> {
    fields.get(field).map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// Parses a numeric field; a missing field reads as zero.
fn number<T: FromStr + Default>(fields: &Fields, field: &'static str) -> Result<T> {
    match optional(fields, field) {
        None => Ok(T::default()),
        Some(v) => {
            v.parse().map_err(|_| RecordError::Invalid { field, value: v.to_string() })
        }
    }
}

/// Identifiers end up in interface names and tc priorities, so they must be plain numbers.
fn identifier(fields: &Fields, field: &'static str) -> Result<String> {
    let value = required(fields, field)?;
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RecordError::Invalid { field, value: value.to_string() });
    }
    Ok(value.to_string())
}

/// Desired impairment applied to one shaping target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapingRecord {
    pub ifb_id: String,
    pub delay_ms: u64,
    pub delay_variation_ms: u64,
    pub delay_correlation_pct: u32,
    /// Loss percentage in hundredths, e.g. `"550"` is 5.50%.
    pub packet_loss: String,
    pub data_rate_bits: u64,
}

impl ShapingRecord {
    pub const IFB_ID: &'static str = "ifb_uniqueId";
    pub const DELAY: &'static str = "delay";
    pub const DELAY_VARIATION: &'static str = "delayVariation";
    pub const DELAY_CORRELATION: &'static str = "delayCorrelation";
    pub const PACKET_LOSS: &'static str = "packetLoss";
    pub const DATA_RATE: &'static str = "dataRate";

    pub fn from_fields(fields: &Fields) -> Result<Self> {
        let packet_loss = optional(fields, Self::PACKET_LOSS).unwrap_or_default();
        if !packet_loss.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RecordError::Invalid {
                field: Self::PACKET_LOSS,
                value: packet_loss.to_string(),
            });
        }

        Ok(Self {
            ifb_id: identifier(fields, Self::IFB_ID)?,
            delay_ms: number(fields, Self::DELAY)?,
            delay_variation_ms: number(fields, Self::DELAY_VARIATION)?,
            delay_correlation_pct: number(fields, Self::DELAY_CORRELATION)?,
            packet_loss: packet_loss.to_string(),
            data_rate_bits: number(fields, Self::DATA_RATE)?,
        })
    }
}

/// Desired classifier redirecting traffic from a source into a shaping target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRecord {
    pub filter_id: String,
    pub ifb_id: String,
    pub source_ip: String,
    pub source_service_ip: Option<String>,
    /// Name of the emulated endpoint the traffic comes from.
    pub source_name: String,
}

impl FilterRecord {
    pub const FILTER_ID: &'static str = "filter_uniqueId";
    pub const IFB_ID: &'static str = "ifb_uniqueId";
    pub const SOURCE_IP: &'static str = "srcIp";
    pub const SOURCE_SERVICE_IP: &'static str = "srcSvcIp";
    pub const SOURCE_NAME: &'static str = "srcName";

    pub fn from_fields(fields: &Fields) -> Result<Self> {
        let ifb_id = identifier(fields, Self::IFB_ID)?;
        // Older engines only stamp the ifb id; both ids are allocated from the same counter.
        let filter_id = match optional(fields, Self::FILTER_ID) {
            Some(_) => identifier(fields, Self::FILTER_ID)?,
            None => ifb_id.clone(),
        };
        let source_ip = required(fields, Self::SOURCE_IP)?.to_string();

        Ok(Self {
            filter_id,
            ifb_id,
            source_name: optional(fields, Self::SOURCE_NAME).unwrap_or(&source_ip).to_string(),
            source_ip,
            source_service_ip: optional(fields, Self::SOURCE_SERVICE_IP).map(str::to_string),
        })
    }
}

/// The class of a load-balanced service, deciding which top-level chain it hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    MeshInternal,
    Ingress,
    Egress,
}

impl ServiceType {
    pub const ALL: [Self; 3] = [Self::MeshInternal, Self::Ingress, Self::Egress];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MeshInternal => "ME-SVC",
            Self::Ingress => "INGRESS-SVC",
            Self::Egress => "EGRESS-SVC",
        }
    }
}

impl FromStr for ServiceType {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ME-SVC" => Ok(Self::MeshInternal),
            "INGRESS-SVC" => Ok(Self::Ingress),
            "EGRESS-SVC" => Ok(Self::Egress),
            other => Err(RecordError::ServiceType(other.to_string())),
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired DNAT redirect of a service port to a target instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LbRecord {
    pub service_type: ServiceType,
    pub service_name: String,
    pub service_ip: String,
    pub protocol: String,
    pub port: u16,
    pub target_ip: String,
    pub target_port: u16,
}

impl LbRecord {
    pub const SERVICE_TYPE: &'static str = "svc-type";
    pub const SERVICE_NAME: &'static str = "svc-name";
    pub const SERVICE_IP: &'static str = "svc-ip";
    pub const PROTOCOL: &'static str = "svc-protocol";
    pub const PORT: &'static str = "svc-port";
    pub const TARGET_IP: &'static str = "lb-svc-ip";
    pub const TARGET_PORT: &'static str = "lb-svc-port";

    pub fn from_fields(fields: &Fields) -> Result<Self> {
        let port = |field: &'static str| -> Result<u16> {
            let value = required(fields, field)?;
            value.parse().map_err(|_| RecordError::Invalid { field, value: value.to_string() })
        };

        Ok(Self {
            service_type: required(fields, Self::SERVICE_TYPE)?.parse()?,
            service_name: required(fields, Self::SERVICE_NAME)?.to_string(),
            service_ip: required(fields, Self::SERVICE_IP)?.to_string(),
            protocol: required(fields, Self::PROTOCOL)?.to_lowercase(),
            port: port(Self::PORT)?,
            target_ip: required(fields, Self::TARGET_IP)?.to_string(),
            target_port: port(Self::TARGET_PORT)?,
        })
    }

    /// Identity of the service: `type:name:port`.
    pub fn service_key(&self) -> String {
        format!("{}:{}:{}", self.service_type, self.service_name, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn shaping_record_parses_engine_fields() {
        let record = ShapingRecord::from_fields(&fields(&[
            ("ifb_uniqueId", "7"),
            ("delay", "100"),
            ("delayVariation", "10"),
            ("delayCorrelation", "50"),
            ("packetLoss", "550"),
            ("dataRate", "1000000"),
        ]))
        .unwrap();

        assert_eq!(record.ifb_id, "7");
        assert_eq!(record.delay_ms, 100);
        assert_eq!(record.delay_variation_ms, 10);
        assert_eq!(record.delay_correlation_pct, 50);
        assert_eq!(record.packet_loss, "550");
        assert_eq!(record.data_rate_bits, 1_000_000);
    }

    #[test]
    fn shaping_record_defaults_missing_numbers() {
        let record = ShapingRecord::from_fields(&fields(&[("ifb_uniqueId", "1")])).unwrap();
        assert_eq!(record.delay_ms, 0);
        assert_eq!(record.packet_loss, "");
    }

    #[test]
    fn shaping_record_rejects_garbage() {
        let err =
            ShapingRecord::from_fields(&fields(&[("ifb_uniqueId", "1; rm -rf")])).unwrap_err();
        assert!(matches!(err, RecordError::Invalid { field: "ifb_uniqueId", .. }));

        let err = ShapingRecord::from_fields(&fields(&[("ifb_uniqueId", "1"), ("delay", "x")]))
            .unwrap_err();
        assert!(matches!(err, RecordError::Invalid { field: "delay", .. }));

        let err = ShapingRecord::from_fields(&fields(&[("delay", "1")])).unwrap_err();
        assert_eq!(err, RecordError::Missing("ifb_uniqueId"));
    }

    #[test]
    fn filter_record_falls_back_to_ifb_id() {
        let record = FilterRecord::from_fields(&fields(&[
            ("ifb_uniqueId", "4"),
            ("srcIp", "10.0.0.4"),
            ("srcSvcIp", ""),
            ("srcName", "pod-b"),
        ]))
        .unwrap();

        assert_eq!(record.filter_id, "4");
        assert_eq!(record.source_service_ip, None);
        assert_eq!(record.source_name, "pod-b");
    }

    #[test]
    fn lb_record_builds_service_key() {
        let record = LbRecord::from_fields(&fields(&[
            ("svc-type", "ME-SVC"),
            ("svc-name", "svc"),
            ("svc-ip", "10.96.0.10"),
            ("svc-protocol", "TCP"),
            ("svc-port", "80"),
            ("lb-svc-ip", "10.96.0.11"),
            ("lb-svc-port", "8080"),
        ]))
        .unwrap();

        assert_eq!(record.service_key(), "ME-SVC:svc:80");
        assert_eq!(record.protocol, "tcp");
        assert_eq!(record.target_port, 8080);
    }

    #[test]
    fn lb_record_rejects_unknown_type() {
        let err = LbRecord::from_fields(&fields(&[("svc-type", "FOO")])).unwrap_err();
        assert_eq!(err, RecordError::ServiceType("FOO".into()));
    }
}

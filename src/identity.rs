//! Printer identity and per-device connection configuration.
//!
//! [`Identity`] is produced by [`crate::discovery`] and is immutable for the
//! lifetime of the owning client. [`ConnectionConfig`] is the mutable,
//! user-editable counterpart persisted by [`crate::config`].

use std::collections::BTreeSet;
use std::net::IpAddr;

/// Which wire protocol a discovered printer speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    WebsocketSdcp,
    MqttCc2,
    MqttLegacy,
}

/// Coarse printer family, used only to pick default capability hints; the
/// session's own attribute fetch remains authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterFamily {
    Resin,
    Fdm,
}

/// Model-name prefixes used to infer [`PrinterFamily`] when a discovery
/// reply doesn't say outright. Unknown prefixes default to `Fdm` per §4.2.
const RESIN_MODEL_PREFIXES: &[&str] = &[
    "Saturn", "Mars", "Jupiter", "Mercury", "Neptune",
];

pub fn infer_family(model: &str) -> PrinterFamily {
    if RESIN_MODEL_PREFIXES
        .iter()
        .any(|prefix| model.starts_with(prefix))
    {
        PrinterFamily::Resin
    } else {
        PrinterFamily::Fdm
    }
}

/// A capability tag surfaced by discovery or attribute fetch.
pub type Capability = String;

pub const CAP_VIDEO: &str = "video";
pub const CAP_AMS: &str = "ams";
pub const CAP_THUMBNAIL: &str = "thumbnail";
pub const CAP_CLOUD_ONLY: &str = "cloud-only";
/// Set when a CC2 printer's discovery reply reported `token_status==1`:
/// the access code must be used as the MQTT password instead of the
/// default `elegoo`/`123456` pair (§4.3).
pub const CAP_REQUIRES_ACCESS_CODE: &str = "requires-access-code";

/// Immutable identity of a discovered printer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Identity {
    pub name: String,
    pub model: String,
    pub serial: String,
    pub ip_address: IpAddr,
    pub firmware: String,
    pub protocol_version: String,
    pub protocol_kind: ProtocolKind,
    pub printer_family: PrinterFamily,
    pub capabilities: BTreeSet<Capability>,
    /// Host port the embedded broker bound to and redirected this printer
    /// to via `M66666` during discovery; only set for `MqttLegacy` (§4.1,
    /// §9 open question (b)). `None` for every other dialect.
    #[serde(default)]
    pub legacy_broker_port: Option<u16>,
}

impl Identity {
    pub fn is_cloud_only(&self) -> bool {
        self.capabilities.iter().any(|c| c == CAP_CLOUD_ONLY)
    }

    pub fn requires_access_code(&self) -> bool {
        self.capabilities.iter().any(|c| c == CAP_REQUIRES_ACCESS_CODE)
    }
}

/// Mutable, user-editable configuration bound to one configured device.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConnectionConfig {
    pub identity: Identity,
    #[serde(default)]
    pub proxy_enabled: bool,
    #[serde(default = "default_proxy_ws_port")]
    pub proxy_ws_port: u16,
    #[serde(default = "default_proxy_video_port")]
    pub proxy_video_port: u16,
    #[serde(default)]
    pub access_code: Option<String>,
}

fn default_proxy_ws_port() -> u16 {
    3030
}

fn default_proxy_video_port() -> u16 {
    3031
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resin_prefixes_are_detected() {
        assert_eq!(infer_family("Saturn 4 Ultra"), PrinterFamily::Resin);
        assert_eq!(infer_family("Mars 5"), PrinterFamily::Resin);
    }

    #[test]
    fn unknown_prefixes_default_to_fdm() {
        assert_eq!(infer_family("Centauri Carbon 2"), PrinterFamily::Fdm);
        assert_eq!(infer_family(""), PrinterFamily::Fdm);
    }

    #[test]
    fn cloud_only_capability_is_detected() {
        let identity = Identity {
            name: "n".into(),
            model: "Centauri Carbon 2".into(),
            serial: "CC2XYZ".into(),
            ip_address: "192.168.1.50".parse().unwrap(),
            firmware: "1.0.0".into(),
            protocol_version: "1".into(),
            protocol_kind: ProtocolKind::MqttCc2,
            printer_family: PrinterFamily::Fdm,
            capabilities: [CAP_CLOUD_ONLY.to_string()].into_iter().collect(),
            legacy_broker_port: None,
        };
        assert!(identity.is_cloud_only());
    }
}

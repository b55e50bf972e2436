use serde::{Deserialize, Serialize};

/// Conventional payload written by a registered server.
///
/// Only `ip` and `port` are required; unknown fields are ignored so that
/// module-specific payloads still decode into this shape.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub ip: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_port: Option<u16>,
}

impl ServerInfo {
    #[must_use]
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            ..Self::default()
        }
    }

    /// `scheme://ip:port`, with `http` when no scheme is registered.
    #[must_use]
    pub fn address(&self) -> String {
        let scheme = self.scheme.as_deref().unwrap_or("http");
        format!("{scheme}://{}:{}", self.ip, self.port)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn decodes_minimal_and_ignores_unknown_fields() {
        let info: ServerInfo =
            serde_json::from_str(r#"{"ip":"10.0.0.1","port":8080,"zone":"a"}"#).unwrap();
        assert_eq!(info, ServerInfo::new("10.0.0.1", 8080));
        assert_eq!(info.address(), "http://10.0.0.1:8080");

        assert!(serde_json::from_str::<ServerInfo>(r#"{"port":8080}"#).is_err());
    }

    #[test]
    fn optional_fields_are_omitted_when_encoding() {
        let mut info = ServerInfo::new("10.0.0.2", 443);
        info.scheme = Some("https".to_owned());
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "ip": "10.0.0.2", "port": 443, "scheme": "https" })
        );
    }
}

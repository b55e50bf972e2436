//! Per-module payload decoders.
//!
//! Modules register their wire shape once, at construction. Modules without a
//! dedicated decoder fall back to JSON deserialization into `T`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Decode function for one module's payloads.
pub type DecodeFn<T> = Arc<dyn Fn(&str) -> Result<T> + Send + Sync>;

/// Mapping from module name to payload decoder.
pub struct CodecRegistry<T> {
    codecs: HashMap<String, DecodeFn<T>>,
    fallback: DecodeFn<T>,
}

impl<T> Clone for CodecRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            codecs: self.codecs.clone(),
            fallback: Arc::clone(&self.fallback),
        }
    }
}

impl<T> fmt::Debug for CodecRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut modules: Vec<&String> = self.codecs.keys().collect();
        modules.sort();
        f.debug_struct("CodecRegistry")
            .field("modules", &modules)
            .finish_non_exhaustive()
    }
}

impl<T: DeserializeOwned + 'static> Default for CodecRegistry<T> {
    fn default() -> Self {
        Self::json()
    }
}

impl<T: DeserializeOwned + 'static> CodecRegistry<T> {
    /// Registry decoding every module as JSON into `T`.
    #[must_use]
    pub fn json() -> Self {
        Self::with_fallback(json_decoder::<T>())
    }
}

impl<T> CodecRegistry<T> {
    #[must_use]
    pub fn with_fallback(fallback: DecodeFn<T>) -> Self {
        Self {
            codecs: HashMap::new(),
            fallback,
        }
    }

    /// Register a decoder for `module`, replacing any previous one.
    #[must_use]
    pub fn with_codec<F>(mut self, module: impl Into<String>, decode: F) -> Self
    where
        F: Fn(&str) -> Result<T> + Send + Sync + 'static,
    {
        self.codecs.insert(module.into(), Arc::new(decode));
        self
    }

    /// Decoder for a cache key (`module` or `module/cluster`).
    ///
    /// The first key segment selects the module.
    #[must_use]
    pub fn resolve(&self, key: &str) -> &DecodeFn<T> {
        let module = key.split('/').next().unwrap_or(key);
        self.codecs.get(module).unwrap_or(&self.fallback)
    }

    /// Decode every payload of `key`, dropping and logging malformed ones.
    pub fn decode_all(&self, key: &str, payloads: &[String]) -> Vec<T> {
        let decode = self.resolve(key);
        payloads
            .iter()
            .filter_map(|raw| match decode(raw.as_str()) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(module = %key, error = %e, "dropping malformed server payload");
                    None
                }
            })
            .collect()
    }
}

/// JSON decoder into `T`, reporting failures as [`Error::Decode`].
#[must_use]
pub fn json_decoder<T: DeserializeOwned + 'static>() -> DecodeFn<T> {
    Arc::new(|raw: &str| {
        serde_json::from_str(raw).map_err(|e| Error::Decode {
            module: std::any::type_name::<T>().to_owned(),
            message: e.to_string(),
        })
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::types::ServerInfo;

    #[test]
    fn decode_keeps_only_well_formed_payloads() {
        let codecs = CodecRegistry::<ServerInfo>::json();
        let payloads = vec![
            r#"{"ip":"10.0.0.1","port":1}"#.to_owned(),
            "not json".to_owned(),
            r#"{"ip":"10.0.0.2"}"#.to_owned(),
            r#"{"ip":"10.0.0.3","port":3,"extra":true}"#.to_owned(),
            String::new(),
        ];
        let decoded = codecs.decode_all("scheduler", &payloads);
        let ips: Vec<&str> = decoded.iter().map(|s| s.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.3"]);
    }

    #[test]
    fn module_codec_overrides_fallback_for_cluster_keys() {
        let codecs = CodecRegistry::<ServerInfo>::json().with_codec("mesosdriver", |raw| {
            let (ip, port) = raw.split_once(':').ok_or_else(|| Error::Decode {
                module: "mesosdriver".to_owned(),
                message: "expected ip:port".to_owned(),
            })?;
            let port = port.parse().map_err(|_| Error::Decode {
                module: "mesosdriver".to_owned(),
                message: format!("bad port {port}"),
            })?;
            Ok(ServerInfo::new(ip, port))
        });

        let decoded = codecs.decode_all(
            "mesosdriver/BCS-K8S-001",
            &["10.1.1.1:31000".to_owned(), "garbage".to_owned()],
        );
        assert_eq!(decoded, vec![ServerInfo::new("10.1.1.1", 31000)]);

        // other modules still use JSON
        assert!(codecs.decode_all("storage", &["10.1.1.1:1".to_owned()]).is_empty());
    }
}

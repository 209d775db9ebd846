//! Inventory source adapters.
//!
//! A datastore turns one source-specific configuration into a list of
//! [`TargetSpec`]s. The contract is deliberately small: adapters either
//! produce specs, fail with `SourceUnavailable` when the source cannot be
//! reached, or skip individual malformed entries. An empty result is not an
//! error; having no devices to manage is a valid inventory.

pub mod api;
pub mod file;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ConnectionDefaults;
use crate::error::Result;
use crate::registry::TargetSpec;

pub use api::ApiDatastore;
pub use file::FileDatastore;

/// Source description, immutable once loaded. Each variant carries only what
/// its adapter needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatasourceConfig {
    /// Bulk static list from a CSV file
    File { path: PathBuf },
    /// Remote inventory system (Netbox-shaped device API)
    Api {
        url: String,
        token: Option<String>,
        /// Query parameters forwarded to the device endpoint
        #[serde(default)]
        device_filter: BTreeMap<String, String>,
        /// Require a primary IPv6 address on each device; entries without
        /// one are skipped as malformed
        #[serde(default)]
        prefer_ipv6: bool,
    },
}

/// Capability interface every inventory source implements.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Human-readable identity for log correlation.
    fn describe(&self) -> String;

    async fn load_targets(&self) -> Result<Vec<TargetSpec>>;
}

/// Build the adapter for a source description.
pub fn build(config: &DatasourceConfig, defaults: &ConnectionDefaults) -> Box<dyn Datastore> {
    match config {
        DatasourceConfig::File { path } => {
            Box::new(FileDatastore::new(path.clone(), defaults.clone()))
        }
        DatasourceConfig::Api {
            url,
            token,
            device_filter,
            prefer_ipv6,
        } => Box::new(ApiDatastore::new(
            url.clone(),
            token.clone(),
            device_filter.clone(),
            *prefer_ipv6,
            defaults.clone(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datasource_config_round_trips_with_type_tag() {
        let json = r#"{"type":"file","path":"devices.csv"}"#;
        let cfg: DatasourceConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(cfg, DatasourceConfig::File { .. }));

        let json = r#"{"type":"api","url":"https://netbox.example.com","token":null}"#;
        let cfg: DatasourceConfig = serde_json::from_str(json).unwrap();
        match cfg {
            DatasourceConfig::Api {
                url,
                token,
                device_filter,
                prefer_ipv6,
            } => {
                assert_eq!(url, "https://netbox.example.com");
                assert!(token.is_none());
                assert!(device_filter.is_empty());
                assert!(!prefer_ipv6);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}

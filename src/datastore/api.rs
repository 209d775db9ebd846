use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ConnectionDefaults;
use crate::datastore::Datastore;
use crate::error::{NetherdError, Result};
use crate::registry::TargetSpec;

/// Builds targets from a remote inventory system exposing a Netbox-shaped
/// device API (`GET {url}/api/dcim/devices/` with query-parameter filters).
///
/// Every device entry must carry a usable primary address. An entry missing
/// the preferred address family is rejected as malformed and skipped; one
/// badly-inventoried device must never abort collection for the rest of the
/// batch.
pub struct ApiDatastore {
    url: String,
    token: Option<String>,
    device_filter: BTreeMap<String, String>,
    prefer_ipv6: bool,
    defaults: ConnectionDefaults,
    client: reqwest::Client,
}

impl ApiDatastore {
    pub fn new(
        url: String,
        token: Option<String>,
        device_filter: BTreeMap<String, String>,
        prefer_ipv6: bool,
        defaults: ConnectionDefaults,
    ) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            token,
            device_filter,
            prefer_ipv6,
            defaults,
            client: reqwest::Client::new(),
        }
    }

    /// Extract one target from a device entry. Pure so it is testable
    /// without a live endpoint.
    fn parse_device(&self, device: &Value) -> Result<TargetSpec> {
        let name = device
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>");

        if device.get("primary_ip").map_or(true, Value::is_null) {
            return Err(NetherdError::SourceMalformed(format!(
                "device {name} has no primary IP"
            )));
        }

        let family_key = if self.prefer_ipv6 {
            "primary_ip6"
        } else {
            "primary_ip4"
        };
        let address = device
            .get(family_key)
            .and_then(|ip| ip.get("address"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                NetherdError::SourceMalformed(format!(
                    "device {name} has no {family_key} address"
                ))
            })?;

        // Addresses come back in CIDR notation
        let host = address.split('/').next().unwrap_or(address).to_string();
        if host.is_empty() {
            return Err(NetherdError::SourceMalformed(format!(
                "device {name} has an empty {family_key} address"
            )));
        }

        let mut spec = TargetSpec::new(host);
        spec.port = self.defaults.port;
        spec.username = self.defaults.username.clone();
        spec.password = self.defaults.password.clone();
        spec.mode = self.defaults.mode;
        spec.meta
            .insert("name".to_string(), Value::String(name.to_string()));
        if let Some(role) = device.pointer("/role/slug").and_then(Value::as_str) {
            spec.meta
                .insert("role".to_string(), Value::String(role.to_string()));
        }
        Ok(spec)
    }
}

#[async_trait]
impl Datastore for ApiDatastore {
    fn describe(&self) -> String {
        format!("api:{}", self.url)
    }

    async fn load_targets(&self) -> Result<Vec<TargetSpec>> {
        let endpoint = format!("{}/api/dcim/devices/", self.url);
        let mut request = self.client.get(&endpoint).query(&self.device_filter);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Token {token}"));
        }

        let response = request.send().await.map_err(|err| {
            NetherdError::SourceUnavailable(format!("unable to contact {}: {err}", self.url))
        })?;
        if !response.status().is_success() {
            return Err(NetherdError::SourceUnavailable(format!(
                "{} answered {}",
                self.url,
                response.status()
            )));
        }

        let body: Value = response.json().await.map_err(|err| {
            NetherdError::SourceUnavailable(format!("bad response from {}: {err}", self.url))
        })?;
        let devices = body
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut specs = Vec::new();
        for device in &devices {
            match self.parse_device(device) {
                Ok(spec) => specs.push(spec),
                Err(err) => {
                    tracing::warn!(
                        source = %self.describe(),
                        error = %err,
                        "Skipping device entry"
                    );
                }
            }
        }

        tracing::info!(
            source = %self.describe(),
            devices = devices.len(),
            targets = specs.len(),
            "Loaded API inventory"
        );
        Ok(specs)
    }
}

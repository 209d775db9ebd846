//! Inventory aggregation: run every configured datastore, bound each load,
//! and fold the results into one deduplicated target set for the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::config::{ConnectionDefaults, ControllerConfig};
use crate::datastore::{self, Datastore, DatasourceConfig};
use crate::registry::TargetSpec;

pub struct Aggregator {
    datastores: Vec<Arc<dyn Datastore>>,
    load_timeout: Duration,
}

impl Aggregator {
    pub fn new(
        datasources: &[DatasourceConfig],
        defaults: &ConnectionDefaults,
        controller: &ControllerConfig,
    ) -> Self {
        let datastores = datasources
            .iter()
            .map(|cfg| Arc::from(datastore::build(cfg, defaults)))
            .collect();
        Self {
            datastores,
            load_timeout: controller.load_timeout,
        }
    }

    /// Build an aggregator over pre-constructed adapters. The config-driven
    /// [`Aggregator::new`] is the usual entry point; this one exists for
    /// custom [`Datastore`] implementations.
    pub fn from_datastores(datastores: Vec<Arc<dyn Datastore>>, load_timeout: Duration) -> Self {
        Self {
            datastores,
            load_timeout,
        }
    }

    /// Run one aggregation pass.
    ///
    /// Datastores load concurrently, each bounded by the configured timeout
    /// so one unreachable source can never stall the pass. A failed or
    /// timed-out source is logged and skipped; the others' targets still go
    /// through. Results keep datasource order so host dedup is
    /// last-write-wins across sources.
    pub async fn collect(&self) -> Vec<TargetSpec> {
        let mut tasks = JoinSet::new();
        for (index, ds) in self.datastores.iter().enumerate() {
            let ds = Arc::clone(ds);
            let load_timeout = self.load_timeout;
            tasks.spawn(async move {
                let name = ds.describe();
                let result = tokio::time::timeout(load_timeout, ds.load_targets()).await;
                (index, name, result)
            });
        }

        let mut per_source: Vec<Vec<TargetSpec>> = vec![Vec::new(); self.datastores.len()];
        while let Some(joined) = tasks.join_next().await {
            let Ok((index, name, result)) = joined else {
                continue;
            };
            match result {
                Ok(Ok(specs)) => {
                    per_source[index] = specs;
                }
                Ok(Err(err)) => {
                    tracing::warn!(source = %name, error = %err, "Datastore load failed, skipping this pass");
                }
                Err(_) => {
                    tracing::warn!(
                        source = %name,
                        timeout_secs = self.load_timeout.as_secs(),
                        "Datastore load timed out, skipping this pass"
                    );
                }
            }
        }

        dedupe_by_host(per_source.into_iter().flatten())
    }
}

/// Deduplicate by host, last-write-wins; every dropped duplicate is logged.
fn dedupe_by_host(specs: impl IntoIterator<Item = TargetSpec>) -> Vec<TargetSpec> {
    let mut order: Vec<String> = Vec::new();
    let mut by_host: HashMap<String, TargetSpec> = HashMap::new();

    for spec in specs {
        let host = spec.host.clone();
        if by_host.insert(host.clone(), spec).is_some() {
            tracing::warn!(host = %host, "Duplicate inventory address, keeping latest entry");
        } else {
            order.push(host);
        }
    }

    // Preserve first-seen order of hosts
    order
        .into_iter()
        .filter_map(|host| by_host.remove(&host))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::error::{NetherdError, Result};

    struct StubStore {
        name: &'static str,
        outcome: Result<Vec<&'static str>>,
        delay: Duration,
    }

    impl StubStore {
        fn ok(name: &'static str, hosts: &[&'static str]) -> Arc<dyn Datastore> {
            Arc::new(Self {
                name,
                outcome: Ok(hosts.to_vec()),
                delay: Duration::ZERO,
            })
        }

        fn unavailable(name: &'static str) -> Arc<dyn Datastore> {
            Arc::new(Self {
                name,
                outcome: Err(NetherdError::SourceUnavailable("stub down".into())),
                delay: Duration::ZERO,
            })
        }

        fn slow(name: &'static str, delay: Duration) -> Arc<dyn Datastore> {
            Arc::new(Self {
                name,
                outcome: Ok(vec!["10.9.9.9"]),
                delay,
            })
        }
    }

    #[async_trait]
    impl Datastore for StubStore {
        fn describe(&self) -> String {
            self.name.to_string()
        }

        async fn load_targets(&self) -> Result<Vec<TargetSpec>> {
            tokio::time::sleep(self.delay).await;
            match &self.outcome {
                Ok(hosts) => Ok(hosts.iter().map(|h| TargetSpec::new(*h)).collect()),
                Err(_) => Err(NetherdError::SourceUnavailable("stub down".into())),
            }
        }
    }

    #[tokio::test]
    async fn aggregation_dedupes_across_sources() {
        // File yields [.1, .2], API yields [.2, .3] → exactly three targets
        let agg = Aggregator::from_datastores(
            vec![
                StubStore::ok("file", &["10.0.0.1", "10.0.0.2"]),
                StubStore::ok("api", &["10.0.0.2", "10.0.0.3"]),
            ],
            Duration::from_secs(1),
        );

        let specs = agg.collect().await;
        let hosts: Vec<&str> = specs.iter().map(|s| s.host.as_str()).collect();
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[tokio::test]
    async fn unavailable_source_does_not_block_others() {
        let agg = Aggregator::from_datastores(
            vec![
                StubStore::unavailable("api"),
                StubStore::ok("file", &["10.0.0.1"]),
            ],
            Duration::from_secs(1),
        );

        let specs = agg.collect().await;
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].host, "10.0.0.1");
    }

    #[tokio::test(start_paused = true)]
    async fn hung_source_is_bounded_by_the_load_timeout() {
        let agg = Aggregator::from_datastores(
            vec![
                StubStore::slow("stuck", Duration::from_secs(3600)),
                StubStore::ok("file", &["10.0.0.1"]),
            ],
            Duration::from_secs(5),
        );

        let specs = agg.collect().await;
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].host, "10.0.0.1");
    }

    #[tokio::test]
    async fn empty_everything_is_not_an_error() {
        let agg = Aggregator::from_datastores(vec![StubStore::ok("file", &[])], Duration::from_secs(1));
        assert!(agg.collect().await.is_empty());
    }
}

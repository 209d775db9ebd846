use std::time::Duration;

use crate::datastore::DatasourceConfig;
use crate::registry::target::SessionMode;

/// Connection parameters applied to any target whose datasource left them
/// unset. Credentials here are the fallback; per-row credentials from a
/// datasource always win.
#[derive(Debug, Clone)]
pub struct ConnectionDefaults {
    /// Default NETCONF port
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub mode: SessionMode,
    /// Bound on session establishment
    pub connect_timeout: Duration,
}

impl Default for ConnectionDefaults {
    fn default() -> Self {
        Self {
            port: 830,
            username: None,
            password: None,
            mode: SessionMode::Default,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Controller-side timing knobs.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How often the reconcile pass runs (claims, expiry, dead sweep)
    pub reconcile_interval: Duration,
    /// How long an unacked claim stays pending before returning to the pool
    pub claim_timeout: Duration,
    /// Expected worker check-in cadence
    pub checkin_interval: Duration,
    /// A worker is declared dead after this many missed check-in windows
    pub dead_after_missed: u32,
    /// How long a revoked session may take to release before it counts as a
    /// health strike against the worker
    pub revoke_grace: Duration,
    /// Bound on a single datastore load during aggregation
    pub load_timeout: Duration,
    /// Re-run inventory aggregation at this cadence (None = startup only)
    pub refresh_interval: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_millis(500),
            claim_timeout: Duration::from_secs(5),
            checkin_interval: Duration::from_secs(300),
            dead_after_missed: 3,
            revoke_grace: Duration::from_secs(10),
            load_timeout: Duration::from_secs(30),
            refresh_interval: None,
        }
    }
}

impl ControllerConfig {
    /// The liveness window: a worker silent for longer than this is dead.
    pub fn dead_after(&self) -> Duration {
        self.checkin_interval * self.dead_after_missed
    }
}

/// Worker-side knobs.
///
/// A worker runs one control task plus up to `capacity` session tasks, so
/// `capacity` is the number of concurrent device sessions it will accept.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent sessions
    pub capacity: usize,
    /// Report statistics to the controller at this cadence
    pub checkin_interval: Duration,
    /// Check in early once this many session events have accumulated, so the
    /// controller can notice an overworked worker before the next interval
    pub max_events_before_checkin: u64,
    /// Session reconnect backoff bounds
    pub retry_backoff_min: Duration,
    pub retry_backoff_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            capacity: 15,
            checkin_interval: Duration::from_secs(300),
            max_events_before_checkin: 1200,
            retry_backoff_min: Duration::from_secs(1),
            retry_backoff_max: Duration::from_secs(60),
        }
    }
}

/// Top-level configuration, constructed once at startup and passed by
/// reference into the aggregator, controller, and workers. There is no
/// ambient global settings object.
#[derive(Debug, Clone, Default)]
pub struct NetherdConfig {
    pub defaults: ConnectionDefaults,
    pub controller: ControllerConfig,
    pub worker: WorkerConfig,
    pub datasources: Vec<DatasourceConfig>,
    /// Coordination broker connection string. The in-process bus ignores it;
    /// an external broker implementation would dial it.
    pub broker_url: String,
}

impl NetherdConfig {
    pub fn with_datasource(mut self, ds: DatasourceConfig) -> Self {
        self.datasources.push(ds);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_defaults() {
        let cfg = ConnectionDefaults::default();
        assert_eq!(cfg.port, 830);
        assert!(cfg.username.is_none());
        assert!(cfg.password.is_none());
        assert_eq!(cfg.mode, SessionMode::Default);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn controller_dead_window_is_a_multiple_of_checkin() {
        let cfg = ControllerConfig {
            checkin_interval: Duration::from_secs(10),
            dead_after_missed: 3,
            ..Default::default()
        };
        assert_eq!(cfg.dead_after(), Duration::from_secs(30));
    }

    #[test]
    fn worker_config_default() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.capacity, 15);
        assert_eq!(cfg.checkin_interval, Duration::from_secs(300));
        assert_eq!(cfg.max_events_before_checkin, 1200);
    }

    #[test]
    fn with_datasource_appends() {
        let cfg = NetherdConfig::default()
            .with_datasource(DatasourceConfig::File {
                path: "devices.csv".into(),
            })
            .with_datasource(DatasourceConfig::File {
                path: "more.csv".into(),
            });
        assert_eq!(cfg.datasources.len(), 2);
    }
}

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::ConnectionDefaults;
use crate::datastore::Datastore;
use crate::error::{NetherdError, Result};
use crate::registry::{SessionMode, TargetSpec};

/// Builds targets from a local CSV file.
///
/// Expected header: `host,port,username,password,filter,mode`. Only `host`
/// is required; empty cells fall back to the configured defaults. A row that
/// fails validation is skipped with a logged defect, never fatal to the load.
pub struct FileDatastore {
    path: PathBuf,
    defaults: ConnectionDefaults,
}

#[derive(Debug, Deserialize)]
struct Row {
    host: String,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    filter: Option<String>,
    mode: Option<String>,
}

impl FileDatastore {
    pub fn new(path: PathBuf, defaults: ConnectionDefaults) -> Self {
        Self { path, defaults }
    }

    fn row_to_spec(&self, row: Row) -> Result<TargetSpec> {
        if row.host.trim().is_empty() {
            return Err(NetherdError::SourceMalformed("row with empty host".into()));
        }
        let mode = match row.mode.as_deref() {
            None | Some("") | Some("default") => self.defaults.mode,
            Some("replay") => SessionMode::Replay,
            Some(other) => {
                return Err(NetherdError::SourceMalformed(format!(
                    "unknown session mode '{other}' for host {}",
                    row.host
                )));
            }
        };
        Ok(TargetSpec {
            host: row.host.trim().to_string(),
            port: row.port.unwrap_or(self.defaults.port),
            username: row.username.or_else(|| self.defaults.username.clone()),
            password: row.password.or_else(|| self.defaults.password.clone()),
            protocol_filter: row.filter,
            mode,
            meta: serde_json::Map::new(),
        })
    }
}

#[async_trait]
impl Datastore for FileDatastore {
    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn load_targets(&self) -> Result<Vec<TargetSpec>> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            NetherdError::SourceUnavailable(format!(
                "unable to read '{}': {err}",
                self.path.display()
            ))
        })?;

        let mut reader = csv::Reader::from_reader(contents.as_bytes());
        let mut specs = Vec::new();
        for (line, record) in reader.deserialize::<Row>().enumerate() {
            let row = match record {
                Ok(row) => row,
                Err(err) => {
                    tracing::warn!(
                        source = %self.describe(),
                        line = line + 2,
                        error = %err,
                        "Skipping unparseable inventory row"
                    );
                    continue;
                }
            };
            match self.row_to_spec(row) {
                Ok(spec) => specs.push(spec),
                Err(err) => {
                    tracing::warn!(
                        source = %self.describe(),
                        line = line + 2,
                        error = %err,
                        "Skipping invalid inventory row"
                    );
                }
            }
        }

        tracing::info!(source = %self.describe(), targets = specs.len(), "Loaded file inventory");
        Ok(specs)
    }
}

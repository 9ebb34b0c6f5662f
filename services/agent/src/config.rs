//! Configuration for the agent.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::warn;

use crate::allocation::SystemPaths;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this agent.
    pub agent_id: String,

    /// Exec line injected into pod wrapper units as `${system.pod_exec}`.
    pub pod_exec: String,

    /// Init-system unit directories.
    pub system_paths: SystemPaths,

    /// Static node metadata published under the `meta` source.
    pub meta: BTreeMap<String, String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let agent_id = std::env::var("LOAM_AGENT_ID").unwrap_or_else(|_| "localhost".to_string());

        let pod_exec = std::env::var("LOAM_POD_EXEC")
            .unwrap_or_else(|_| "ExecStart=/usr/bin/sleep inf".to_string());

        let mut system_paths = SystemPaths::default();
        if let Ok(dir) = std::env::var("LOAM_LOCAL_DIR") {
            system_paths.local = dir.into();
        }
        if let Ok(dir) = std::env::var("LOAM_RUNTIME_DIR") {
            system_paths.runtime = dir.into();
        }

        let mut meta = BTreeMap::new();
        if let Ok(raw) = std::env::var("LOAM_META") {
            for pair in raw.split(',').filter(|pair| !pair.is_empty()) {
                match pair.split_once('=') {
                    Some((key, value)) => {
                        meta.insert(key.trim().to_string(), value.trim().to_string());
                    }
                    None => warn!(pair, "bad LOAM_META entry, expected key=value"),
                }
            }
        }

        Ok(Self {
            agent_id,
            pod_exec,
            system_paths,
            meta,
        })
    }
}

//! Graph configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// Default one-shot read wait.
pub const DEFAULT_WAIT_MS: u64 = 5000;

/// Tunables for a [`Graph`](crate::Graph).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// How long a one-shot read waits for data before timing out
    pub wait_ms: u64,

    /// Local writes register interest in their path, so remote updates to
    /// data this replica wrote are accepted by `merge`
    pub listen_on_write: bool,

    /// Materialization emits a demand signal for pointer targets that are
    /// absent locally
    pub demand_on_dangling_ref: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            wait_ms: DEFAULT_WAIT_MS,
            listen_on_write: true,
            demand_on_dangling_ref: true,
        }
    }
}

impl GraphConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| GraphError::Serialization(e.to_string()))
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait_ms = millis(wait);
        self
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

/// Whole milliseconds in `wait`, saturating at `u64::MAX`.
pub(crate) fn millis(wait: Duration) -> u64 {
    u64::try_from(wait.as_millis()).unwrap_or(u64::MAX)
}

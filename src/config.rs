//! Engine and store configuration.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the lifecycle engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Compatibility flag: when set, a transition for an opportunity with no
    /// open record treats the from-state as DISCOVERED instead of failing
    /// with `UnknownOpportunity`. Off by default; prefer an explicit
    /// `initialize()` call so lost records cannot masquerade as new
    /// opportunities.
    pub implicit_bootstrap: bool,
    /// Upper bound on the persistence portion of one `transition()` call.
    pub transition_timeout: Duration,
    /// Capacity of the in-process introspection ring buffer. Zero disables
    /// the ring entirely.
    pub history_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            implicit_bootstrap: false,
            transition_timeout: Duration::from_secs(10),
            history_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let implicit_bootstrap = match env::var("OPPSTATE_IMPLICIT_BOOTSTRAP") {
            Ok(value) => value
                .parse::<bool>()
                .context("OPPSTATE_IMPLICIT_BOOTSTRAP must be true or false")?,
            Err(_) => defaults.implicit_bootstrap,
        };

        let transition_timeout = match env::var("OPPSTATE_TRANSITION_TIMEOUT_MS") {
            Ok(value) => {
                let ms = value
                    .parse::<u64>()
                    .context("OPPSTATE_TRANSITION_TIMEOUT_MS must be a number")?;
                Duration::from_millis(ms)
            }
            Err(_) => defaults.transition_timeout,
        };

        let history_capacity = match env::var("OPPSTATE_HISTORY_CAPACITY") {
            Ok(value) => value
                .parse::<usize>()
                .context("OPPSTATE_HISTORY_CAPACITY must be a number")?,
            Err(_) => defaults.history_capacity,
        };

        Ok(Self {
            implicit_bootstrap,
            transition_timeout,
            history_capacity,
        })
    }
}

/// Location of the durable store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory for the SQLite database. Defaults to the current working
    /// directory.
    pub state_dir: PathBuf,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self> {
        let state_dir = env::var("OPPSTATE_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Ok(Self { state_dir })
    }

    /// Full path of the database file.
    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("oppstate.db")
    }
}

//! Built-in runner implementations.
//!
//! Runners are the only code that touches execution backends. Each one keeps
//! its own bookkeeping keyed by instance id and hands the orchestrator an
//! opaque [`ProcessHandle`](crate::ProcessHandle).

pub mod docker;
pub mod process;
pub mod script;

pub use docker::DockerRunner;
pub use process::ProcessRunner;
pub use script::ScriptRunner;

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Decode a runner config blob, naming the runner in the error
pub(crate) fn parse_config<T: DeserializeOwned>(runner: &str, config: &Value) -> Result<T> {
    serde_json::from_value(config.clone())
        .map_err(|e| Error::InvalidConfig(format!("invalid {} runner config: {}", runner, e)))
}

//! Tokio runtime spawner implementation

use crate::{BoxTask, Spawner};

/// Spawner for the Tokio runtime
///
/// Must be used from within a Tokio runtime context.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    fn spawn(&self, future: BoxTask) {
        tokio::spawn(future);
    }
}

//! Runtime-agnostic async utilities for the Hive orchestrator
//!
//! The orchestration core never names an executor directly. It spawns
//! background work through a [`Spawner`] and waits through [`sleep`] and
//! [`timeout`], all of which resolve to the runtime selected by cargo features.
//!
//! # Examples
//!
//! ```no_run
//! use hive_runtime::prelude::*;
//! use std::time::Duration;
//!
//! async fn example(spawner: &dyn Spawner) {
//!     spawner.spawn(Box::pin(async {
//!         sleep(Duration::from_millis(10)).await;
//!     }));
//!
//!     let outcome = timeout(Duration::from_secs(1), async { 42 }).await;
//!     assert_eq!(outcome.ok(), Some(42));
//! }
//! ```

#![warn(missing_docs)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future accepted by every spawner
pub type BoxTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A spawner that can run futures on an async runtime
pub trait Spawner: Send + Sync {
    /// Spawn a future on the runtime
    ///
    /// The future runs to completion in the background; nothing joins it.
    fn spawn(&self, future: BoxTask);
}

#[cfg(feature = "tokio")]
pub mod tokio;

#[cfg(feature = "smol")]
pub mod smol;

pub mod runtime_utils;

pub use runtime_utils::{Elapsed, sleep, timeout};

/// Prelude for common imports
pub mod prelude {
    pub use crate::runtime_utils::{Elapsed, sleep, timeout};
    pub use crate::{BoxTask, Spawner, default_spawner};

    #[cfg(feature = "tokio")]
    pub use crate::tokio::TokioSpawner;

    #[cfg(feature = "smol")]
    pub use crate::smol::SmolSpawner;
}

/// Spawner for the runtime selected at compile time
///
/// `smol` wins when both runtime features are enabled, matching [`sleep`].
pub fn default_spawner() -> Arc<dyn Spawner> {
    #[cfg(feature = "smol")]
    {
        Arc::new(smol::SmolSpawner)
    }

    #[cfg(all(feature = "tokio", not(feature = "smol")))]
    {
        Arc::new(tokio::TokioSpawner)
    }

    #[cfg(not(any(feature = "smol", feature = "tokio")))]
    {
        compile_error!("One of the runtime features must be enabled: smol or tokio")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "smol")]
    #[smol_potat::test]
    async fn test_default_spawner_runs_task() {
        let spawner = default_spawner();
        let (tx, rx) = async_channel::bounded(1);

        spawner.spawn(Box::pin(async move {
            tx.send("done").await.unwrap();
        }));

        assert_eq!(rx.recv().await.unwrap(), "done");
    }
}

//! Runtime-agnostic timers
//!
//! Sleeping and deadlines are the only timing primitives the orchestrator
//! needs, so they are funnelled through here instead of repeating cfg-flag
//! blocks across the codebase.

use futures::future::{Either, select};
use std::future::Future;
use std::time::Duration;

/// Sleep for the specified duration using the current runtime
pub async fn sleep(duration: Duration) {
    #[cfg(feature = "smol")]
    {
        smol::Timer::after(duration).await;
    }

    #[cfg(all(feature = "tokio", not(feature = "smol")))]
    {
        tokio::time::sleep(duration).await;
    }

    #[cfg(not(any(feature = "smol", feature = "tokio")))]
    {
        let _ = duration;
        compile_error!("One of the runtime features must be enabled: smol or tokio");
    }
}

/// Error returned by [`timeout`] when the deadline passes first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed(pub Duration);

impl std::fmt::Display for Elapsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "deadline of {:?} elapsed", self.0)
    }
}

impl std::error::Error for Elapsed {}

/// Run `future` with a deadline
///
/// The future is dropped when the deadline fires, which cancels whatever it
/// was awaiting.
pub async fn timeout<F>(duration: Duration, future: F) -> Result<F::Output, Elapsed>
where
    F: Future,
{
    let future = std::pin::pin!(future);
    let deadline = std::pin::pin!(sleep(duration));

    match select(future, deadline).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(((), _)) => Err(Elapsed(duration)),
    }
}

//! Smol runtime spawner implementation

use crate::{BoxTask, Spawner};

/// Spawner for the Smol runtime
///
/// Tasks land on smol's global executor, so they keep running after the
/// caller's `block_on` returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmolSpawner;

impl Spawner for SmolSpawner {
    fn spawn(&self, future: BoxTask) {
        smol::spawn(future).detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[smol_potat::test]
    async fn test_smol_spawner() {
        let spawner = SmolSpawner;
        let (tx, rx) = async_channel::bounded(1);

        spawner.spawn(Box::pin(async move {
            tx.send(42).await.unwrap();
        }));

        assert_eq!(rx.recv().await.unwrap(), 42);
    }

    #[smol_potat::test]
    async fn test_smol_spawner_many_tasks() {
        let spawner = SmolSpawner;
        let (tx, rx) = async_channel::unbounded();

        for i in 0..8u32 {
            let tx = tx.clone();
            spawner.spawn(Box::pin(async move {
                tx.send(i).await.unwrap();
            }));
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Ok(i) = rx.recv().await {
            seen.push(i);
        }
        seen.sort();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }
}

//! Shutdown flags shared by the long-running tasks.
//!
//! Every task that can be stopped holds a `watch::Receiver<bool>` that flips
//! to `true` once. [`signalled`] waits for that flip and returns nothing, so
//! it can sit in a `tokio::select!` branch of a spawned task without holding
//! a `watch::Ref` (and its read guard) across the other branches.

use tokio::sync::watch;

/// Resolves once the flag is `true` or its sender is gone.
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_resolves_on_flip_and_on_drop() {
        let (tx, mut rx) = watch::channel(false);
        let wait = signalled(&mut rx);
        assert_send(&wait);
        drop(wait);

        let mut early = rx.clone();
        let pending = tokio::time::timeout(Duration::from_millis(20), signalled(&mut early)).await;
        assert!(pending.is_err());

        tx.send_replace(true);
        signalled(&mut rx).await;

        let (tx, mut orphan) = watch::channel(false);
        drop(tx);
        signalled(&mut orphan).await;
    }

    #[tokio::test]
    async fn test_select_branch_is_send_in_spawned_task() {
        let (tx, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticks = 0u32;
            loop {
                tokio::select! {
                    _ = signalled(&mut rx) => break,
                    _ = tokio::time::sleep(Duration::from_millis(5)) => ticks += 1,
                }
            }
            ticks
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send_replace(true);
        assert!(task.await.unwrap() > 0);
    }
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Waiting on watch channels without hanging a failing test forever.

use std::sync::Arc;
use strand_view::ViewSnapshot;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::link::SCRIPT_TIMEOUT;

/// Wait until the snapshot behind `rx` satisfies `pred` and return it.
/// `None` on timeout or when the publisher went away first.
pub async fn wait_for<F>(
    rx: &mut watch::Receiver<Arc<ViewSnapshot>>,
    mut pred: F,
) -> Option<Arc<ViewSnapshot>>
where
    F: FnMut(&ViewSnapshot) -> bool,
{
    let found = timeout(SCRIPT_TIMEOUT, rx.wait_for(|snap| pred(snap)))
        .await
        .ok()?
        .ok()?;
    Some(Arc::clone(&found))
}

/// Wait until `rx` reports `want`.
pub async fn wait_for_state<T>(rx: &mut watch::Receiver<T>, want: &T) -> bool
where
    T: PartialEq,
{
    matches!(
        timeout(SCRIPT_TIMEOUT, rx.wait_for(|v| v == want)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn times_out_when_nothing_matches() {
        let (_tx, mut rx) = watch::channel(Arc::new(ViewSnapshot::default()));
        assert!(wait_for(&mut rx, |s| s.synced).await.is_none());
    }

    #[tokio::test]
    async fn sees_a_later_value() {
        let (tx, mut rx) = watch::channel(0u8);
        tokio::spawn(async move {
            let _ = tx.send(3);
        });
        assert!(wait_for_state(&mut rx, &3).await);
    }
}

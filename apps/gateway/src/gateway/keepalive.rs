//! Keep-alive handling for all tracked WebSockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::socket::{OutboundHandle, WsFrame};

/// Read-deadline for every tracked socket; the PING period derives from it.
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(15);

/// Tracks open WebSockets and drives the periodic PING sweep.
///
/// Sockets join on open and leave on close. A PING that cannot be queued
/// means the socket's writer task is gone, so the entry is evicted.
pub struct ClientMgr {
    clients: Mutex<HashMap<u64, OutboundHandle>>,
    next_id: AtomicU64,
    period: Duration,
}

impl ClientMgr {
    pub fn new(keepalive: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            period: keepalive.saturating_sub(Duration::from_secs(2)),
        }
    }

    /// Track a socket; returns the id to pass to [`ClientMgr::remove`].
    pub fn add(&self, handle: OutboundHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.lock().insert(id, handle);
        id
    }

    pub fn remove(&self, id: u64) {
        self.clients.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the PING sweep until the context is cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(),
                _ = cancel.cancelled() => return,
            }
        }
    }

    fn sweep(&self) {
        let mut clients = self.clients.lock();
        clients.retain(|id, handle| {
            let alive = handle.send(WsFrame::Ping).is_ok();
            if !alive {
                tracing::debug!(socket = id, "keepalive: dropping socket after failed ping");
            }
            alive
        });
        tracing::trace!(pinged = clients.len(), "keepalive sweep");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn sweep_pings_tracked_sockets() {
        let mgr = ClientMgr::new(Duration::from_secs(15));
        let (tx, mut rx) = mpsc::unbounded_channel();
        mgr.add(tx);

        mgr.sweep();
        assert!(matches!(rx.recv().await, Some(WsFrame::Ping)));
    }

    #[tokio::test]
    async fn sweep_evicts_dead_sockets() {
        let mgr = ClientMgr::new(Duration::from_secs(15));
        let (tx, rx) = mpsc::unbounded_channel();
        mgr.add(tx);
        drop(rx);

        mgr.sweep();
        assert!(mgr.is_empty());
    }

    #[tokio::test]
    async fn removed_sockets_are_not_pinged() {
        let mgr = ClientMgr::new(Duration::from_secs(15));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = mgr.add(tx);
        mgr.remove(id);

        mgr.sweep();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let mgr = ClientMgr::new(Duration::from_secs(3));
        let cancel = CancellationToken::new();
        cancel.cancel();
        // Returns immediately instead of ticking forever.
        mgr.run(cancel).await;
    }
}

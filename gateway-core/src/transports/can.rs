//! Passive CAN bus transport: a background task drains frames off the bus
//! into a timestamped cache that the poll loop reads from, since CAN is
//! broadcast and asynchronous rather than request/response like Modbus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use socketcan::tokio::CanSocket;
use socketcan::{CanFrame, Frame};
use tokio::sync::Mutex;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone)]
struct CachedFrame {
    data: Vec<u8>,
    seen_at: Instant,
}

/// Shared, mutex-guarded cache of the most recent frame per arbitration
/// id. Cloning a handle is cheap; the background reader and the poll loop
/// each hold one.
#[derive(Clone)]
pub struct CanCache {
    inner: Arc<Mutex<HashMap<u32, CachedFrame>>>,
    timeout: Duration,
}

impl CanCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    async fn insert(&self, id: u32, data: Vec<u8>) {
        self.inner.lock().await.insert(
            id,
            CachedFrame {
                data,
                seen_at: Instant::now(),
            },
        );
    }

    /// Drop entries older than `timeout` so a dead or unplugged node's
    /// last-seen value doesn't linger forever as if it were still live.
    pub async fn clean(&self) {
        let mut guard = self.inner.lock().await;
        guard.retain(|_, f| f.seen_at.elapsed() < self.timeout);
    }

    pub async fn get(&self, id: u32) -> Option<Vec<u8>> {
        self.inner.lock().await.get(&id).map(|f| f.data.clone())
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Reads the CAN interface named by `ifname` (e.g. `can0`) into `cache`
/// until the socket errors out. The caller is expected to treat a return
/// from this function as the transport having died and needing a
/// reconnect.
pub async fn run_reader(ifname: &str, cache: CanCache) -> Result<()> {
    let socket = CanSocket::open(ifname)
        .map_err(|e| GatewayError::Unrecoverable(format!("opening CAN interface {ifname}: {e}")))?;
    loop {
        let frame = socket
            .read_frame()
            .await
            .map_err(|e| GatewayError::TransientIo(std::io::Error::other(e)))?;
        if let CanFrame::Data(data_frame) = frame {
            cache
                .insert(data_frame.raw_id(), data_frame.data().to_vec())
                .await;
        }
    }
}

/// Watchdog: if the cache has been empty for `max_idle`, this transport is
/// considered dead (e.g. the bus went down or the interface dropped) and
/// the process should exit so an external supervisor restarts it with a
/// fresh `ip link` bring-up.
pub async fn watch_for_silence(cache: CanCache, max_idle: Duration) {
    let mut idle_since: Option<Instant> = None;
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cache.clean().await;
        if cache.is_empty().await {
            let since = *idle_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= max_idle {
                tracing::error!(max_idle_secs = max_idle.as_secs(), "CAN bus has been silent too long, exiting");
                std::process::exit(1);
            }
        } else {
            idle_since = None;
        }
    }
}

/// Bring up a SocketCAN interface with the given bitrate. This shells out
/// to `ip link`, matching how the reference tooling provisions the
/// interface before opening it; it is not something a CAN-frame library
/// itself is responsible for.
pub async fn setup_socketcan(ifname: &str, bitrate: u32) -> Result<()> {
    let status = tokio::process::Command::new("ip")
        .args(["link", "set", ifname, "type", "can", "bitrate", &bitrate.to_string()])
        .status()
        .await?;
    if !status.success() {
        return Err(GatewayError::Unrecoverable(format!(
            "failed to configure {ifname} bitrate via ip link"
        )));
    }
    let status = tokio::process::Command::new("ip")
        .args(["link", "set", "up", ifname])
        .status()
        .await?;
    if !status.success() {
        return Err(GatewayError::Unrecoverable(format!("failed to bring up {ifname}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_evicts_stale_entries() {
        let cache = CanCache::new(Duration::from_millis(10));
        cache.insert(1, vec![1, 2, 3]).await;
        assert!(!cache.is_empty().await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.clean().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn cache_get_returns_last_frame() {
        let cache = CanCache::new(Duration::from_secs(5));
        cache.insert(42, vec![9, 9]).await;
        assert_eq!(cache.get(42).await, Some(vec![9, 9]));
        assert_eq!(cache.get(99).await, None);
    }
}

//! Fleet-wide exclusive leases for monitored collections.
//!
//! A lease is a key holding a random token with a TTL of three refresh
//! intervals. The holder refreshes it in the background; every mutation is
//! token-checked so a holder can never extend or delete someone else's lease.
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{RelayError, Result};

const TTL_REFRESH_MULTIPLIER: u32 = 3;

const REFRESH_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Storage primitive behind the lock service.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Set `name` to `token` if nobody holds it. Returns whether it was set.
    async fn try_set(&self, name: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Extend the TTL if `token` still holds `name`.
    async fn refresh(&self, name: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Delete `name` if `token` still holds it.
    async fn release(&self, name: &str, token: &str) -> Result<bool>;
}

pub struct RedisLockBackend {
    conn: ConnectionManager,
    refresh_script: Script,
    release_script: Script,
}

impl RedisLockBackend {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            refresh_script: Script::new(REFRESH_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }
}

fn ttl_millis(ttl: Duration) -> usize {
    usize::try_from(ttl.as_millis()).unwrap_or(usize::MAX).max(1)
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_set(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        // SET name token NX PX ttl; nil reply means someone else holds it
        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!(lock = %name, "Failed to acquire lock: {}", e);
                RelayError::Lease(format!("acquire {}: {}", name, e))
            })?;
        Ok(reply.is_some())
    }

    async fn refresh(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .refresh_script
            .key(name)
            .arg(token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RelayError::Lease(format!("refresh {}: {}", name, e)))?;
        Ok(extended == 1)
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(name)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RelayError::Lease(format!("release {}: {}", name, e)))?;
        Ok(deleted == 1)
    }
}

/// In-process backend for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryLockBackend {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a lease as if its TTL had lapsed.
    pub async fn expire(&self, name: &str) {
        self.entries.lock().await.remove(name);
    }

    pub async fn holder(&self, name: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        entries
            .get(name)
            .filter(|(_, expiry)| *expiry > Instant::now())
            .map(|(token, _)| token.clone())
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_set(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if let Some((_, expiry)) = entries.get(name) {
            if *expiry > now {
                return Ok(false);
            }
        }
        entries.insert(name.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn refresh(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get_mut(name) {
            Some((holder, expiry)) if holder == token && *expiry > now => {
                *expiry = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get(name) {
            Some((holder, _)) if holder == token => {
                entries.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Clone)]
pub struct DistributedLockService {
    backend: Arc<dyn LockBackend>,
}

impl DistributedLockService {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }

    /// Try to take `name` for as long as the returned lease is refreshed.
    ///
    /// Returns `Ok(None)` when another holder owns it. The lease refreshes
    /// itself every `refresh_interval`; a failed refresh marks it lost.
    pub async fn try_acquire_infinite_lock_with_periodic_refresh(
        &self,
        name: &str,
        refresh_interval: Duration,
    ) -> Result<Option<Lease>> {
        let token = Uuid::new_v4().to_string();
        let ttl = refresh_interval * TTL_REFRESH_MULTIPLIER;

        if !self.backend.try_set(name, &token, ttl).await? {
            debug!(lock = %name, "Lock held by another instance");
            return Ok(None);
        }

        info!(lock = %name, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
        Ok(Some(Lease::start(
            self.backend.clone(),
            name.to_string(),
            token,
            refresh_interval,
            ttl,
        )))
    }
}

/// A held lease. Release it explicitly; dropping it releases best-effort.
pub struct Lease {
    name: String,
    token: String,
    backend: Arc<dyn LockBackend>,
    lost_rx: watch::Receiver<bool>,
    refresher: Option<JoinHandle<()>>,
    released: bool,
}

impl Lease {
    fn start(
        backend: Arc<dyn LockBackend>,
        name: String,
        token: String,
        refresh_interval: Duration,
        ttl: Duration,
    ) -> Self {
        let (lost_tx, lost_rx) = watch::channel(false);
        let refresher = tokio::spawn(refresh_loop(
            backend.clone(),
            name.clone(),
            token.clone(),
            refresh_interval,
            ttl,
            lost_tx,
        ));

        Self {
            name,
            token,
            backend,
            lost_rx,
            refresher: Some(refresher),
            released: false,
        }
    }

    pub fn is_lost(&self) -> bool {
        *self.lost_rx.borrow()
    }

    /// Resolves once the lease can no longer be trusted.
    pub async fn lost(&self) {
        let mut rx = self.lost_rx.clone();
        // A closed channel means the refresher is gone, which is a loss too.
        let _ = rx.wait_for(|lost| *lost).await;
    }

    pub async fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }

        match self.backend.release(&self.name, &self.token).await {
            Ok(true) => {
                info!(lock = %self.name, "Lock released");
                Ok(())
            }
            Ok(false) => {
                warn!(lock = %self.name, "Lock was no longer held at release");
                Ok(())
            }
            Err(e) => {
                error!(lock = %self.name, "Failed to release lock: {}", e);
                Err(e)
            }
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }
        warn!(lock = %self.name, "Lease dropped without release, releasing in background");

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let backend = self.backend.clone();
            let name = std::mem::take(&mut self.name);
            let token = std::mem::take(&mut self.token);
            handle.spawn(async move {
                if let Err(e) = backend.release(&name, &token).await {
                    error!(lock = %name, "Background lock release failed: {}", e);
                }
            });
        }
    }
}

async fn refresh_loop(
    backend: Arc<dyn LockBackend>,
    name: String,
    token: String,
    refresh_interval: Duration,
    ttl: Duration,
    lost_tx: watch::Sender<bool>,
) {
    let mut ticker = tokio::time::interval(refresh_interval);
    // First tick completes immediately; the lease was just set.
    ticker.tick().await;

    // Give up while at least one refresh interval of the TTL remains, so the
    // holder stops before a peer can take the key.
    let give_up_after = ttl.saturating_sub(refresh_interval);
    let mut last_refreshed = Instant::now();

    loop {
        ticker.tick().await;

        if last_refreshed.elapsed() >= give_up_after {
            error!(
                lock = %name,
                since_ms = last_refreshed.elapsed().as_millis() as u64,
                "Lock not refreshed in time"
            );
            let _ = lost_tx.send(true);
            return;
        }

        match tokio::time::timeout(refresh_interval, backend.refresh(&name, &token, ttl)).await {
            Ok(Ok(true)) => {
                last_refreshed = Instant::now();
                debug!(lock = %name, "Lock refreshed");
            }
            Ok(Ok(false)) => {
                error!(lock = %name, "Lock no longer held by this instance");
                let _ = lost_tx.send(true);
                return;
            }
            Ok(Err(e)) => {
                error!(lock = %name, "Lock refresh failed: {}", e);
                let _ = lost_tx.send(true);
                return;
            }
            Err(_) => {
                error!(
                    lock = %name,
                    timeout_ms = refresh_interval.as_millis() as u64,
                    "Lock refresh timed out"
                );
                let _ = lost_tx.send(true);
                return;
            }
        }
    }
}

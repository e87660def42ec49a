//! Cluster-wide named mutexes
//!
//! Several relayer processes may share one message pool, so committing a
//! session has to be serialized across processes, not just tasks. Production
//! uses Postgres session-level advisory locks held on a dedicated pooled
//! connection; [`LocalLock`] covers single-node runs and tests.
//!
//! Always go through [`with_lock`]: it releases on every exit path.

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::RelayerError;

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[async_trait]
pub trait ClusterLock: Send + Sync {
    /// Take the lock if it is free, without waiting
    async fn try_acquire(&self, name: &str) -> Result<Option<Box<dyn HeldLock>>>;
}

#[async_trait]
pub trait HeldLock: Send {
    fn name(&self) -> &str;

    async fn release(self: Box<Self>) -> Result<()>;
}

/// Poll `try_acquire` until the lock is taken or `wait` elapses
pub async fn acquire(lock: &dyn ClusterLock, name: &str, wait: Duration) -> Result<Box<dyn HeldLock>> {
    let deadline = Instant::now() + wait;
    loop {
        if let Some(held) = lock.try_acquire(name).await? {
            return Ok(held);
        }
        if Instant::now() >= deadline {
            return Err(RelayerError::LockTimeout(name.to_string()).into());
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}

/// Run `f` while holding the named lock
pub async fn with_lock<F, Fut, T>(lock: &dyn ClusterLock, name: &str, wait: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let held = acquire(lock, name, wait).await?;
    debug!(lock = %name, "Cluster lock acquired");

    let result = f().await;

    if let Err(e) = held.release().await {
        warn!(lock = %name, error = %e, "Failed to release cluster lock");
    }
    result
}

/// Postgres advisory lock keyed by `hashtext(name)`
pub struct PgAdvisoryLock {
    pool: PgPool,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClusterLock for PgAdvisoryLock {
    async fn try_acquire(&self, name: &str) -> Result<Option<Box<dyn HeldLock>>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .wrap_err("Failed to acquire connection for cluster lock")?;

        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(name)
            .fetch_one(&mut *conn)
            .await
            .wrap_err_with(|| format!("Failed to try advisory lock '{}'", name))?;

        if !locked {
            return Ok(None);
        }
        Ok(Some(Box::new(PgHeldLock {
            name: name.to_string(),
            conn: Some(conn),
        })))
    }
}

struct PgHeldLock {
    name: String,
    conn: Option<PoolConnection<Postgres>>,
}

#[async_trait]
impl HeldLock for PgHeldLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn release(mut self: Box<Self>) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(&self.name)
            .fetch_one(&mut *conn)
            .await;

        match unlocked {
            Ok(true) => Ok(()),
            Ok(false) => {
                // Not held by this session any more; don't hand the
                // connection back in an unknown state
                let _ = conn.close().await;
                Err(eyre::eyre!("advisory lock '{}' was not held at release", self.name))
            }
            Err(e) => {
                let _ = conn.close().await;
                Err(e).wrap_err_with(|| format!("Failed to release advisory lock '{}'", self.name))
            }
        }
    }
}

impl Drop for PgHeldLock {
    fn drop(&mut self) {
        // Dropped without release (task panicked or was aborted). Detaching
        // closes the connection, which ends the session and frees the lock.
        if let Some(conn) = self.conn.take() {
            warn!(lock = %self.name, "Cluster lock dropped without release, closing its connection");
            drop(conn.detach());
        }
    }
}

/// In-process lock table
#[derive(Clone, Default)]
pub struct LocalLock {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(name)
    }
}

#[async_trait]
impl ClusterLock for LocalLock {
    async fn try_acquire(&self, name: &str) -> Result<Option<Box<dyn HeldLock>>> {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !held.insert(name.to_string()) {
            return Ok(None);
        }
        Ok(Some(Box::new(LocalHeldLock {
            name: name.to_string(),
            table: self.held.clone(),
        })))
    }
}

struct LocalHeldLock {
    name: String,
    table: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl HeldLock for LocalHeldLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn release(self: Box<Self>) -> Result<()> {
        // Drop does the work
        Ok(())
    }
}

impl Drop for LocalHeldLock {
    fn drop(&mut self) {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.name);
    }
}

//! Bounded pool of simulated physical connections
//!
//! Idle connections are reused last-in first-out, so a connection released by
//! one transaction is the one the next checkout receives. Session-level
//! settings live on the physical connection and survive that reuse.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tenantry_core::{Error, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::PoolConfig;

/// One simulated server connection
#[derive(Debug)]
pub(crate) struct PhysicalConnection {
    pub(crate) id: u64,
    /// Session-level settings; persist until the connection is closed
    pub(crate) settings: HashMap<String, String>,
}

/// A connection checked out of the pool together with its slot
#[derive(Debug)]
pub(crate) struct Checkout {
    pub(crate) conn: PhysicalConnection,
    pub(crate) permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub(crate) struct ConnectionPool {
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<PhysicalConnection>>,
    acquire_timeout: Duration,
    statement_timeout: String,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub(crate) fn new(config: &PoolConfig) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(config.max_connections as usize)),
            idle: Mutex::new(Vec::new()),
            acquire_timeout: config.acquire_timeout(),
            statement_timeout: format!("{}ms", config.statement_timeout_ms),
            next_id: AtomicU64::new(0),
        }
    }

    /// Wait for a free slot, then reuse the most recently released connection
    pub(crate) async fn checkout(&self) -> Result<Checkout> {
        if self.slots.is_closed() {
            return Err(Error::PoolClosed);
        }
        let permit = tokio::time::timeout(self.acquire_timeout, self.slots.clone().acquire_owned())
            .await
            .map_err(|_| Error::PoolExhausted)?
            .map_err(|_| Error::PoolClosed)?;

        let reused = self.idle.lock().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => self.open(),
        };
        Ok(Checkout { conn, permit })
    }

    fn open(&self) -> PhysicalConnection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut settings = HashMap::new();
        settings.insert("statement_timeout".to_string(), self.statement_timeout.clone());
        debug!(target: "tenantry::pool", connection = id, "Opened connection");
        PhysicalConnection { id, settings }
    }

    /// Return a connection; it is discarded if the pool has been closed
    pub(crate) fn release(&self, conn: PhysicalConnection) {
        if !self.slots.is_closed() {
            self.idle.lock().push(conn);
        }
    }

    pub(crate) fn close(&self) {
        self.slots.close();
        self.idle.lock().clear();
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub(crate) fn opened_count(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }
}

//! Durable "was connected" flag
//!
//! The only state that outlives the process: whether signaling was up when
//! the process last ran, so a restart can re-register on its own.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::error::{RealtimeError, RealtimeResult};

/// Storage for the registration flag
#[async_trait]
pub trait SessionFlagStore: Send + Sync {
    /// Whether signaling was connected when last recorded
    async fn load(&self) -> RealtimeResult<bool>;

    /// Record the flag
    async fn store(&self, connected: bool) -> RealtimeResult<()>;
}

/// Flag kept in memory; lost on restart
#[derive(Debug, Default)]
pub struct MemoryFlagStore {
    connected: AtomicBool,
}

impl MemoryFlagStore {
    /// Store starting with the given value
    pub fn with_value(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
        }
    }

    /// Current value without going through the async trait
    pub fn get(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFlagStore for MemoryFlagStore {
    async fn load(&self) -> RealtimeResult<bool> {
        Ok(self.get())
    }

    async fn store(&self, connected: bool) -> RealtimeResult<()> {
        self.connected.store(connected, Ordering::SeqCst);
        Ok(())
    }
}

/// Flag kept as a marker file; the file exists only while set
#[derive(Debug, Clone)]
pub struct FileFlagStore {
    path: PathBuf,
}

impl FileFlagStore {
    /// Store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SessionFlagStore for FileFlagStore {
    async fn load(&self) -> RealtimeResult<bool> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents.trim() == "true"),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(RealtimeError::persistence(format!(
                "reading {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn store(&self, connected: bool) -> RealtimeResult<()> {
        let result = if connected {
            tokio::fs::write(&self.path, "true").await
        } else {
            match tokio::fs::remove_file(&self.path).await {
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                other => other,
            }
        };
        result.map_err(|e| {
            RealtimeError::persistence(format!("writing {}: {}", self.path.display(), e))
        })
    }
}

use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for the write-retention buffer.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// How long writes to a row are held and coalesced before the merged
    /// result is sent to the backing store. Must be greater than zero.
    pub write_retention: Duration,
    /// Maximum number of flushes sent to the backing store concurrently
    /// while the buffer is running. Flushes during shutdown are sent one
    /// at a time.
    pub flush_concurrency: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            write_retention: Duration::from_millis(100),
            flush_concurrency: 16,
        }
    }
}

impl RetentionConfig {
    pub fn new(write_retention: Duration) -> Self {
        Self {
            write_retention,
            ..Default::default()
        }
    }

    pub fn with_flush_concurrency(mut self, flush_concurrency: usize) -> Self {
        self.flush_concurrency = flush_concurrency;
        self
    }

    /// Checks that the configuration can be used to build a buffer.
    pub fn validate(&self) -> Result<()> {
        if self.write_retention.is_zero() {
            return Err(Error::InvalidConfig(
                "write_retention must be greater than zero".to_string(),
            ));
        }
        if self.flush_concurrency == 0 {
            return Err(Error::InvalidConfig(
                "flush_concurrency must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

//! Process capability supplied by the host environment
//!
//! The engine never touches OS process APIs directly; whoever launches real
//! browser processes provides an implementation of [`ProcessControl`].

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait ProcessControl: Send + Sync {
    fn has_exited(&self, process_id: u32) -> bool;

    fn kill(&self, process_id: u32) -> Result<()>;

    /// Waits for the process to exit; false when `timeout` elapsed first
    async fn wait_for_exit(&self, process_id: u32, timeout: Duration) -> bool;

    /// Resolves the process owning a top-level window with this title
    fn find_by_window_title(&self, title: &str) -> Option<u32>;
}

/// Process control for browsers that have no OS process of their own.
///
/// Logical instances are always considered exited once quit, so killing and
/// waiting are no-ops.
#[derive(Debug, Default, Clone)]
pub struct DetachedProcesses;

#[async_trait]
impl ProcessControl for DetachedProcesses {
    fn has_exited(&self, _process_id: u32) -> bool {
        true
    }

    fn kill(&self, _process_id: u32) -> Result<()> {
        Ok(())
    }

    async fn wait_for_exit(&self, _process_id: u32, _timeout: Duration) -> bool {
        true
    }

    fn find_by_window_title(&self, _title: &str) -> Option<u32> {
        None
    }
}

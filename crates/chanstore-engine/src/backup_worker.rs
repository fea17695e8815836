use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use chanstore_backup::{BackupHandler, BackupItemQueue};

use crate::controller::OperationController;
use crate::error::{EngineError, EngineResult};

const THREAD_NAME: &str = "chanstore-backup";

/// The thread applying queued backup items.
///
/// It keeps running while channel processing is enabled. A stop request is
/// honored only once the queue is drained; a failing item is registered as
/// a disruption and ends the thread.
#[derive(Debug)]
pub struct BackupWorker {
    shutdown: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl BackupWorker {
    pub fn spawn(
        queue: Arc<BackupItemQueue>,
        mut handler: Box<dyn BackupHandler + Send>,
        controller: Arc<OperationController>,
        poll_timeout: Duration,
    ) -> EngineResult<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);

        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                info!("backup thread started");
                let is_running =
                    || !(thread_shutdown.load(Ordering::Acquire) && queue.is_empty());
                while is_running() && controller.is_channel_processing_enabled() {
                    if let Err(e) = queue.process_next_item(handler.as_mut(), poll_timeout) {
                        controller.register_disruption(None, EngineError::from(e).into_problem());
                        break;
                    }
                }
                if !queue.is_empty() {
                    warn!(pending = queue.len(), "backup thread stopped with pending items");
                }
                info!("backup thread stopped");
            })
            .map_err(|source| EngineError::Spawn {
                name: THREAD_NAME.to_string(),
                source,
            })?;

        Ok(Self { shutdown, thread })
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Let the thread drain the queue, then wait for it to end.
    pub fn stop(self) -> EngineResult<()> {
        self.shutdown.store(true, Ordering::Release);
        self.thread
            .join()
            .map_err(|_| EngineError::ThreadPanicked(THREAD_NAME.to_string()))
    }
}

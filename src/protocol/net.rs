//! Dedicated network threads.
//!
//! Each transport runs its socket loop on its own OS thread driving a
//! current-thread tokio runtime, so blocking callers (the core, the send
//! stage) never need a runtime of their own.

use crate::error::ProtocolError;
use std::future::Future;
use std::thread::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A running network loop. Dropping it cancels and joins the thread.
pub(crate) struct NetTask {
    name: String,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl NetTask {
    /// Spawn `body` on a new thread named `name`.
    pub(crate) fn spawn<F, Fut>(name: &str, body: F) -> Result<Self, ProtocolError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()>,
    {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let thread_name = name.to_owned();
        let thread = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("{thread_name}: cannot build runtime: {e}");
                        return;
                    }
                };
                rt.block_on(body(task_cancel));
                debug!("{thread_name} exited");
            })
            .map_err(|e| ProtocolError::Connect(format!("cannot spawn {name}: {e}")))?;

        Ok(Self {
            name: name.to_owned(),
            cancel,
            thread: Some(thread),
        })
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancel the loop and wait for the thread, unless called from it.
    pub(crate) fn stop(&mut self) {
        self.cancel.cancel();
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            // Closing from a callback on this very thread; it exits on return.
            return;
        }
        if thread.join().is_err() {
            error!("{} panicked", self.name);
        }
    }
}

impl Drop for NetTask {
    fn drop(&mut self) {
        self.stop();
    }
}

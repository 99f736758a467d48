//! Single owning execution context for a runtime.
//!
//! The engine is single-threaded and non-reentrant, so every call from
//! other threads (including OS notification callbacks) is funneled through
//! one named thread that owns the [`Runtime`]. Jobs arrive over a
//! single-consumer queue and run strictly one after another.

use crate::config::RuntimeConfig;
use crate::error::{BridgeError, Result, panic_message};
use crate::runtime::Runtime;
use crossbeam::channel::{self, Receiver, Sender};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{self, JoinHandle, ThreadId};

type Job = Box<dyn FnOnce(&Runtime) + Send + 'static>;

enum Message {
    Run(Job),
    Shutdown,
}

/// Owns the executor thread. Dropping it shuts the runtime down.
pub struct Executor {
    handle: ExecutorHandle,
    thread: Option<JoinHandle<()>>,
}

/// Clonable submission side of an [`Executor`].
#[derive(Clone)]
pub struct ExecutorHandle {
    sender: Sender<Message>,
    owner: ThreadId,
}

impl Executor {
    /// Start the executor thread, open a runtime on it and run `setup`
    /// before any submitted job. Open and setup failures are returned here.
    pub fn spawn<F>(config: RuntimeConfig, setup: F) -> Result<Self>
    where
        F: FnOnce(&Runtime) -> Result<()> + Send + 'static,
    {
        let (sender, receiver) = channel::unbounded::<Message>();
        let (ready_tx, ready_rx) = channel::bounded::<Result<()>>(1);

        let thread = thread::Builder::new()
            .name("luabridge-runtime".to_string())
            .spawn(move || {
                let runtime = match Runtime::with_config(config) {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                if let Err(err) = setup(&runtime) {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                run_loop(runtime, &receiver);
            })
            .map_err(|e| BridgeError::runtime(format!("failed to spawn executor thread: {e}")))?;

        let owner = thread.thread().id();
        let ready = ready_rx.recv().unwrap_or(Err(BridgeError::Closed));
        if let Err(err) = ready {
            let _ = thread.join();
            return Err(err);
        }

        Ok(Self {
            handle: ExecutorHandle { sender, owner },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ExecutorHandle {
        self.handle.clone()
    }

    /// Close the runtime on its own thread and wait for the thread to exit.
    /// Jobs queued before the call still run.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        if self.handle.is_owner_thread() {
            return Err(BridgeError::Reentrant);
        }
        let _ = self.handle.sender.send(Message::Shutdown);
        thread
            .join()
            .map_err(|_| BridgeError::runtime("executor thread panicked"))
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!(error = %err, "executor did not shut down cleanly");
        }
    }
}

fn run_loop(mut runtime: Runtime, receiver: &Receiver<Message>) {
    tracing::debug!("executor started");
    for message in receiver {
        match message {
            Message::Run(job) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| job(&runtime))) {
                    tracing::error!(panic = %panic_message(payload.as_ref()), "executor job panicked");
                }
            }
            Message::Shutdown => break,
        }
    }
    if let Err(err) = runtime.close() {
        tracing::warn!(error = %err, "closing runtime on executor shutdown");
    }
    tracing::debug!("executor stopped");
}

impl ExecutorHandle {
    /// Queue `job` without waiting for it.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&Runtime) + Send + 'static,
    {
        self.sender
            .send(Message::Run(Box::new(job)))
            .map_err(|_| BridgeError::Closed)
    }

    /// Run `job` on the executor and wait for its result.
    ///
    /// Calling this from a job (on the executor thread itself) would wait on
    /// itself forever and returns [`BridgeError::Reentrant`] instead.
    pub fn run<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce(&Runtime) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        if self.is_owner_thread() {
            return Err(BridgeError::Reentrant);
        }
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.submit(move |runtime| {
            let _ = reply_tx.send(job(runtime));
        })?;
        reply_rx
            .recv()
            .map_err(|_| BridgeError::runtime("executor job did not complete"))?
    }

    /// Whether the caller is running on the executor thread.
    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }
}

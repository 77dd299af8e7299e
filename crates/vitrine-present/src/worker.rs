//! Background worker for asynchronous post-buffer completion.

use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};

/// Work request sent to the post-buffer worker thread.
enum WorkerTask {
    /// Run a queued completion step.
    Run(Box<dyn FnOnce() + Send>),
    /// Signal the worker thread to shut down.
    Shutdown,
}

/// Handle to the worker thread that completes asynchronous post-buffer
/// operations.
///
/// Tasks run strictly one at a time in submission order. A present chain
/// owns exactly one handle; on swapchain recreation the handle moves to the
/// successor chain so the thread outlives any individual swapchain.
pub(crate) struct PostBufferWorker {
    /// Channel to send tasks to the worker.
    task_tx: Sender<WorkerTask>,
    /// Worker thread handle for joining on shutdown.
    thread: Option<JoinHandle<()>>,
}

impl PostBufferWorker {
    /// Spawn the worker thread.
    pub(crate) fn spawn() -> Self {
        let (task_tx, task_rx) = channel::unbounded::<WorkerTask>();

        let thread = thread::Builder::new()
            .name("post-buffer".to_string())
            .spawn(move || loop {
                match task_rx.recv() {
                    Ok(WorkerTask::Run(task)) => task(),
                    Ok(WorkerTask::Shutdown) | Err(_) => {
                        // Shutdown requested or channel disconnected
                        return;
                    }
                }
            })
            .expect("Failed to spawn post-buffer worker thread");

        Self {
            task_tx,
            thread: Some(thread),
        }
    }

    /// Queue a task behind every previously queued task.
    pub(crate) fn post(&self, task: impl FnOnce() + Send + 'static) {
        // The worker only exits when this handle shuts it down, so the
        // channel cannot be disconnected here.
        let _ = self.task_tx.send(WorkerTask::Run(Box::new(task)));
    }

    /// Shutdown the worker thread and wait for it to finish.
    fn shutdown(&mut self) {
        // Send shutdown signal (ignore errors - channel might be closed)
        let _ = self.task_tx.send(WorkerTask::Shutdown);

        // Wait for thread to finish
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PostBufferWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Background loading with retry on transient memory exhaustion.
//!
//! Tasks run one at a time on a dedicated thread. A task that cannot finish
//! this frame, typically because the transient arena is full, returns
//! [`TaskOutcome::Retry`] and is resumed once the next frame has ended.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::manager::GrManager;

/// What a task wants after running once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    /// Run again after the next frame ends.
    Retry,
}

/// A unit of loading work. It may run several times until it reports [`TaskOutcome::Done`].
pub trait AsyncLoaderTask: Send {
    fn name(&self) -> &str {
        "task"
    }

    fn run(&mut self, gr: &GrManager) -> Result<TaskOutcome>;
}

impl<F> AsyncLoaderTask for F
where
    F: FnMut(&GrManager) -> Result<TaskOutcome> + Send,
{
    fn run(&mut self, gr: &GrManager) -> Result<TaskOutcome> {
        self(gr)
    }
}

/// The number of the last ended frame, observable from other threads.
#[derive(Default)]
pub struct FrameSignal {
    frame: Mutex<u64>,
    condvar: Condvar,
}

impl FrameSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame `frame` is now the current one.
    pub fn notify(&self, frame: u64) {
        *self.frame.lock() = frame;
        self.condvar.notify_all();
    }

    pub fn current(&self) -> u64 {
        *self.frame.lock()
    }

    /// Block until the current frame is past `frame` or `stop()` returns true.
    pub fn wait_past(&self, frame: u64, stop: impl Fn() -> bool) {
        let mut current = self.frame.lock();
        while *current <= frame && !stop() {
            self.condvar
                .wait_for(&mut current, std::time::Duration::from_millis(10));
        }
    }
}

enum Message {
    Task(Box<dyn AsyncLoaderTask>),
    Shutdown,
}

#[derive(Default)]
struct LoaderStats {
    completed: usize,
    failed: usize,
    retries: usize,
}

/// Runs [`AsyncLoaderTask`]s on a background thread.
pub struct AsyncLoader {
    sender: Sender<Message>,
    shared: Arc<LoaderShared>,
    thread: Option<JoinHandle<()>>,
}

struct LoaderShared {
    stats: Mutex<LoaderStats>,
    pending: Mutex<usize>,
    idle: Condvar,
    stopping: std::sync::atomic::AtomicBool,
}

impl LoaderShared {
    fn finish_task(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(std::sync::atomic::Ordering::Acquire)
    }
}

impl AsyncLoader {
    pub fn new(gr: Arc<GrManager>) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let shared = Arc::new(LoaderShared {
            stats: Mutex::new(LoaderStats::default()),
            pending: Mutex::new(0),
            idle: Condvar::new(),
            stopping: std::sync::atomic::AtomicBool::new(false),
        });

        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("strata-loader".to_string())
                .spawn(move || run_loader(&gr, &receiver, &shared))
                .map_err(|e| {
                    crate::error::GpuError::InvalidState(format!("Failed to spawn loader: {e}"))
                })?
        };

        tracing::info!("Async loader started");
        Ok(Self {
            sender,
            shared,
            thread: Some(thread),
        })
    }

    /// Queue a task. Tasks start in submission order.
    pub fn submit(&self, task: impl AsyncLoaderTask + 'static) {
        *self.shared.pending.lock() += 1;
        if self.sender.send(Message::Task(Box::new(task))).is_err() {
            tracing::warn!("Async loader is gone, dropping task");
            self.shared.finish_task();
        }
    }

    /// Tasks queued or running.
    pub fn pending(&self) -> usize {
        *self.shared.pending.lock()
    }

    pub fn completed(&self) -> usize {
        self.shared.stats.lock().completed
    }

    pub fn failed(&self) -> usize {
        self.shared.stats.lock().failed
    }

    /// Times any task asked to be resumed next frame.
    pub fn retries(&self) -> usize {
        self.shared.stats.lock().retries
    }

    /// Block until every queued task has completed or failed. Someone else
    /// must keep ending frames for retried tasks to make progress.
    pub fn wait_idle(&self) {
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            self.shared.idle.wait(&mut pending);
        }
    }
}

impl Drop for AsyncLoader {
    fn drop(&mut self) {
        self.shared
            .stopping
            .store(true, std::sync::atomic::Ordering::Release);
        let _ = self.sender.send(Message::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Async loader thread panicked");
            }
        }
    }
}

fn run_loader(gr: &GrManager, receiver: &Receiver<Message>, shared: &LoaderShared) {
    while let Ok(Message::Task(mut task)) = receiver.recv() {
        loop {
            let scope = gr.frame_scope();
            let frame = gr.frame();
            let outcome = task.run(gr);
            drop(scope);

            match outcome {
                Ok(TaskOutcome::Done) => {
                    shared.stats.lock().completed += 1;
                    break;
                }
                Ok(TaskOutcome::Retry) => {
                    shared.stats.lock().retries += 1;
                    tracing::trace!("Loader task '{}' retries after frame {frame}", task.name());
                    gr.frame_signal().wait_past(frame, || shared.is_stopping());
                    if shared.is_stopping() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Loader task '{}' failed: {e}", task.name());
                    shared.stats.lock().failed += 1;
                    break;
                }
            }
        }
        shared.finish_task();
        if shared.is_stopping() {
            break;
        }
    }

    // Release anyone blocked in wait_idle on tasks that will never run.
    for message in receiver.try_iter() {
        if let Message::Task(task) = message {
            tracing::debug!("Dropping unstarted loader task '{}'", task.name());
            shared.finish_task();
        }
    }
    tracing::debug!("Async loader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn wait_past_returns_after_notify() {
        let signal = Arc::new(FrameSignal::new());
        let woke = Arc::new(AtomicBool::new(false));

        let waiter = {
            let signal = signal.clone();
            let woke = woke.clone();
            std::thread::spawn(move || {
                signal.wait_past(0, || false);
                woke.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(30));
        assert!(!woke.load(Ordering::SeqCst));
        signal.notify(1);
        waiter.join().unwrap();
        assert!(woke.load(Ordering::SeqCst));
        assert_eq!(signal.current(), 1);
    }

    #[test]
    fn wait_past_honors_stop() {
        let signal = FrameSignal::new();
        signal.wait_past(5, || true);
        assert_eq!(signal.current(), 0);
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Serial task runners.
//!
//! All decoder state lives on exactly one runner; the surface pool owns a
//! second one for blocking producer calls. A runner is a worker thread
//! consuming posted closures in order, with support for delayed posts
//! (used by the pool's fetch backoff) and one-shot wait events (used by the
//! component's blocking entry points).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use log::warn;

type Task = Box<dyn FnOnce() + Send>;

struct TimedTask {
    due: Instant,
    seq: u64,
    task: Task,
}

// BinaryHeap is a max-heap; earlier deadlines must compare greater. Ties
// break on submission order so same-deadline tasks stay FIFO.
impl Ord for TimedTask {
    fn cmp(&self, other: &TimedTask) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &TimedTask) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimedTask {
    fn eq(&self, other: &TimedTask) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimedTask {}

enum Command {
    Run(TimedTask),
    Exit,
}

/// Cheap clonable handle for posting tasks onto a runner.
#[derive(Clone)]
pub struct TaskRunnerHandle {
    tx: mpsc::Sender<Command>,
    seq: Arc<Mutex<u64>>,
}

impl TaskRunnerHandle {
    /// Posts `task` to run after everything already queued.
    pub fn post<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.post_delayed(task, Duration::ZERO)
    }

    /// Posts `task` to run no earlier than `delay` from now.
    pub fn post_delayed<F: FnOnce() + Send + 'static>(&self, task: F, delay: Duration) {
        let seq = {
            let mut seq = self.seq.lock().unwrap();
            *seq += 1;
            *seq
        };
        let timed = TimedTask {
            due: Instant::now() + delay,
            seq,
            task: Box::new(task),
        };
        // A send failure means the runner has shut down; the task is
        // intentionally dropped, like any task pending at shutdown.
        let _ = self.tx.send(Command::Run(timed));
    }

    /// Posts `task` and blocks the calling thread until it has run.
    ///
    /// Must not be called from the runner's own thread.
    pub fn post_and_wait<R: Send + 'static, F: FnOnce() -> R + Send + 'static>(
        &self,
        task: F,
    ) -> Option<R> {
        let event = WaitEvent::new();
        let signal = event.clone();
        self.post(move || signal.signal(task()));
        event.wait_timeout(Duration::from_secs(10))
    }
}

/// A worker thread executing posted closures in order.
pub struct TaskRunner {
    handle: TaskRunnerHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl TaskRunner {
    pub fn new(name: &str) -> TaskRunner {
        let (tx, rx) = mpsc::channel();
        let thread_name = name.to_string();
        let thread = thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_loop(rx))
            .expect("failed to spawn task runner thread");
        TaskRunner {
            handle: TaskRunnerHandle {
                tx,
                seq: Arc::new(Mutex::new(0)),
            },
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> TaskRunnerHandle {
        self.handle.clone()
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(Command::Exit);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("task runner thread panicked");
            }
        }
    }
}

fn run_loop(rx: mpsc::Receiver<Command>) {
    let mut pending: BinaryHeap<TimedTask> = BinaryHeap::new();
    loop {
        let now = Instant::now();
        while pending.peek().map_or(false, |t| t.due <= now) {
            let timed = pending.pop().unwrap();
            (timed.task)();
        }

        let command = match pending.peek() {
            Some(next) => match rx.recv_timeout(next.due.saturating_duration_since(now)) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            },
            None => match rx.recv() {
                Ok(command) => command,
                Err(_) => return,
            },
        };

        match command {
            Command::Run(timed) => pending.push(timed),
            Command::Exit => return,
        }
    }
}

/// One-shot event for blocking a caller until a posted task completes.
pub struct WaitEvent<T> {
    inner: Arc<(Mutex<Option<T>>, Condvar)>,
}

impl<T> Clone for WaitEvent<T> {
    fn clone(&self) -> WaitEvent<T> {
        WaitEvent {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> WaitEvent<T> {
    pub fn new() -> WaitEvent<T> {
        WaitEvent {
            inner: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    pub fn signal(&self, value: T) {
        let (slot, cond) = &*self.inner;
        *slot.lock().unwrap() = Some(value);
        cond.notify_all();
    }

    /// Waits for the value, giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let (slot, cond) = &*self.inner;
        let mut guard = slot.lock().unwrap();
        let deadline = Instant::now() + timeout;
        while guard.is_none() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (next, result) = cond.wait_timeout(guard, remaining).unwrap();
            guard = next;
            if result.timed_out() && guard.is_none() {
                return None;
            }
        }
        guard.take()
    }
}

impl<T> Default for WaitEvent<T> {
    fn default() -> WaitEvent<T> {
        WaitEvent::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering as AtomicOrdering;

    use super::*;

    #[test]
    fn tasks_run_in_post_order() {
        let runner = TaskRunner::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let order = Arc::clone(&order);
            runner.handle().post(move || order.lock().unwrap().push(i));
        }
        let done = runner.handle().post_and_wait(|| ()).unwrap();
        drop(done);
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn delayed_task_runs_after_immediate() {
        let runner = TaskRunner::new("test");
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        runner.handle().post_delayed(
            move || {
                // The immediate task must already have run.
                assert_eq!(c.fetch_add(1, AtomicOrdering::SeqCst), 1);
            },
            Duration::from_millis(20),
        );
        let c = Arc::clone(&counter);
        runner
            .handle()
            .post(move || assert_eq!(c.fetch_add(1, AtomicOrdering::SeqCst), 0));

        std::thread::sleep(Duration::from_millis(60));
        runner.handle().post_and_wait(|| ()).unwrap();
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 2);
    }

    #[test]
    fn post_and_wait_returns_value() {
        let runner = TaskRunner::new("test");
        assert_eq!(runner.handle().post_and_wait(|| 7), Some(7));
    }

    #[test]
    fn posts_after_shutdown_are_dropped() {
        let runner = TaskRunner::new("test");
        let handle = runner.handle();
        drop(runner);
        // Must not panic or block.
        handle.post(|| ());
    }
}

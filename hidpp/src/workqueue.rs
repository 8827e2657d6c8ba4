//! A bounded pool of worker threads for deferred work.
//!
//! Event handlers run on the reader thread of a channel and must never wait
//! for a transaction on that channel. Everything that needs to talk to a
//! device in reaction to an event is handed to the pool instead.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use flume::{Receiver, Sender};
use tracing::{error, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Delayed {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    // Reversed, so that the max-heap pops the earliest task first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Timers {
    queue: BinaryHeap<Delayed>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    sender: Mutex<Option<Sender<Task>>>,
    timers: Mutex<Timers>,
    timers_cond: Condvar,
}

impl Shared {
    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, task: Task) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            warn!("worker pool is shut down, dropping task");
            return;
        };

        if sender.send(task).is_err() {
            warn!("all workers are gone, dropping task");
        }
    }
}

/// Runs tasks on a fixed amount of threads, immediately or after a delay.
pub struct WorkerPool {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` worker threads (at least one) and a timer thread.
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let (sender, receiver) = flume::unbounded::<Task>();
        let shared = Arc::new(Shared {
            sender: Mutex::new(Some(sender)),
            timers: Mutex::new(Timers::default()),
            timers_cond: Condvar::new(),
        });

        let mut threads = Vec::with_capacity(workers.max(1) + 1);
        for i in 0..workers.max(1) {
            let receiver = receiver.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("hidpp-worker-{i}"))
                    .spawn(move || work(receiver))?,
            );
        }

        threads.push(thread::Builder::new().name("hidpp-timer".to_string()).spawn({
            let shared = Arc::clone(&shared);
            move || run_timers(&shared)
        })?);

        Ok(Self { shared, threads })
    }

    /// Runs a task on the next free worker.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.submit(Box::new(task));
    }

    /// Runs a task on the next free worker once `delay` elapsed.
    pub fn execute_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let mut timers = self.shared.timers();
        if timers.shutdown {
            return;
        }

        let seq = timers.next_seq;
        timers.next_seq += 1;
        timers.queue.push(Delayed {
            due: Instant::now() + delay,
            seq,
            task: Box::new(task),
        });
        drop(timers);

        self.shared.timers_cond.notify_all();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.timers().shutdown = true;
        self.shared.timers_cond.notify_all();
        self.shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let current = thread::current().id();
        for handle in self.threads.drain(..) {
            // The pool may be dropped by one of its own tasks.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

fn work(receiver: Receiver<Task>) {
    while let Ok(task) = receiver.recv() {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("task panicked");
        }
    }
}

fn run_timers(shared: &Shared) {
    let mut timers = shared.timers();

    loop {
        if timers.shutdown {
            return;
        }

        let now = Instant::now();
        timers = match timers.queue.peek().map(|next| next.due) {
            Some(due) if due <= now => {
                let next = timers.queue.pop();
                drop(timers);
                if let Some(next) = next {
                    shared.submit(next.task);
                }
                shared.timers()
            },
            Some(due) => {
                shared
                    .timers_cond
                    .wait_timeout(timers, due - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            },
            None => shared
                .timers_cond
                .wait(timers)
                .unwrap_or_else(PoisonError::into_inner),
        };
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn executes_tasks() {
        let pool = WorkerPool::new(2).unwrap();
        let (sender, receiver) = mpsc::channel();

        for i in 0..8 {
            let sender = sender.clone();
            pool.execute(move || sender.send(i).unwrap());
        }

        let mut results: Vec<_> = (0..8)
            .map(|_| receiver.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        results.sort_unstable();
        assert_eq!(results, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn delayed_tasks_run_in_due_order() {
        let pool = WorkerPool::new(1).unwrap();
        let (sender, receiver) = mpsc::channel();
        let started = Instant::now();

        for (delay, tag) in [(60, "late"), (20, "early")] {
            let sender = sender.clone();
            pool.execute_after(Duration::from_millis(delay), move || {
                sender.send((tag, started.elapsed())).unwrap();
            });
        }

        let (first, first_at) = receiver.recv_timeout(Duration::from_secs(1)).unwrap();
        let (second, second_at) = receiver.recv_timeout(Duration::from_secs(1)).unwrap();

        assert_eq!((first, second), ("early", "late"));
        assert!(first_at >= Duration::from_millis(20));
        assert!(second_at >= Duration::from_millis(60));
    }

    #[test]
    fn survives_panicking_tasks() {
        let pool = WorkerPool::new(1).unwrap();
        let (sender, receiver) = mpsc::channel();

        pool.execute(|| panic!("boom"));
        pool.execute(move || sender.send(()).unwrap());

        assert!(receiver.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn drops_pending_delayed_tasks_on_shutdown() {
        let pool = WorkerPool::new(1).unwrap();
        let (sender, receiver) = mpsc::channel::<()>();

        pool.execute_after(Duration::from_secs(60), move || sender.send(()).unwrap());
        drop(pool);

        assert!(receiver.recv_timeout(Duration::from_millis(50)).is_err());
    }
}

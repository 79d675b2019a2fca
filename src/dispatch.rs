//! The notification dispatcher.
//!
//! Kernel invalidations must not be issued while a folder's node-map lock
//! is held (a concurrent Forget storm also takes that lock), and observer
//! callbacks must not block the operations layer's workers. Both
//! constraints are met by funneling all invalidation work through one
//! queue drained by a dedicated thread; a wait-group tracks outstanding
//! work so unmount and tests can drain it.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use parking_lot::Condvar;
use parking_lot::Mutex;

type Work = Box<dyn FnOnce() + Send + 'static>;

/// Counts outstanding units of work; `wait` blocks until zero.
#[derive(Debug, Default)]
pub(crate) struct WaitGroup {
    count: Mutex<usize>,
    cond: Condvar,
}

impl WaitGroup {
    pub(crate) fn add(&self, n: usize) {
        *self.count.lock() += n;
    }

    pub(crate) fn done(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    pub(crate) fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }
}

/// Single-threaded FIFO work queue.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    queue: Mutex<Option<mpsc::Sender<Work>>>,
    pending: Arc<WaitGroup>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Dispatcher {
    pub(crate) fn new() -> Dispatcher {
        let (tx, rx) = mpsc::channel::<Work>();
        let worker = thread::Builder::new()
            .name("kbfs-notify".to_string())
            .spawn(move || {
                for work in rx {
                    work();
                }
            })
            .expect("failed to spawn notification dispatcher");
        Dispatcher {
            queue: Mutex::new(Some(tx)),
            pending: Arc::new(WaitGroup::default()),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Submit work; runs on the dispatcher thread in submission order.
    /// Work submitted after shutdown is dropped.
    pub(crate) fn queue(&self, work: impl FnOnce() + Send + 'static) {
        self.pending.add(1);
        let pending = Arc::clone(&self.pending);
        let job: Work = Box::new(move || {
            work();
            pending.done();
        });
        let sent = match self.queue.lock().as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        };
        if !sent {
            self.pending.done();
        }
    }

    /// Block until all submitted work has run.
    pub(crate) fn wait(&self) {
        self.pending.wait();
    }

    /// Stop accepting work and join the worker after it drains.
    pub(crate) fn shutdown(&self) {
        self.queue.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// Bounded worker pool for CPU-bound frame work (decode, grayscale, scoring, encode).
//
// A fixed set of named threads pulls boxed tasks off a shared channel. Each task
// reports back through its own one-shot channel; panics are caught so a bad
// frame never takes a worker down.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::{FramewiseError, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

/// Pending result of a task submitted to the pool.
pub struct TaskHandle<T> {
    receiver: Receiver<std::thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes.
    pub fn join(self) -> Result<T> {
        match self.receiver.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic)) => Err(FramewiseError::Worker(panic_message(&panic))),
            Err(_) => Err(FramewiseError::Worker("worker pool shut down".to_string())),
        }
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let receiver = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("frame-worker-{}", i))
                .spawn(move || worker_loop(receiver))?;
            workers.push(handle);
        }

        log::debug!("Started worker pool with {} threads", size);

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Queue a task. The returned handle yields its result.
    pub fn submit<F, T>(&self, f: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let task: Task = Box::new(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
            let _ = tx.send(result);
        });

        if let Some(sender) = &self.sender {
            // A send failure drops the task (and its tx), so join() reports shutdown
            let _ = sender.send(task);
        }

        TaskHandle { receiver: rx }
    }

    /// Run `f` over every item on the pool and collect results in input order.
    pub fn map<I, F, T>(&self, items: Vec<I>, f: F) -> Result<Vec<T>>
    where
        I: Send + 'static,
        F: Fn(I) -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<TaskHandle<Result<T>>> = items
            .into_iter()
            .map(|item| {
                let f = Arc::clone(&f);
                self.submit(move || f(item))
            })
            .collect();

        // Join everything before reporting so no task outlives the call
        let results: Vec<Result<T>> = handles
            .into_iter()
            .map(|h| h.join().and_then(|r| r))
            .collect();

        results.into_iter().collect()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel ends every worker loop
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("Worker thread panicked during shutdown");
            }
        }
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Task>>>) {
    loop {
        // Hold the lock only while receiving
        let task = {
            let guard = match receiver.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.recv()
        };

        match task {
            Ok(task) => task(),
            Err(_) => return,
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("task panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("task panicked: {}", s)
    } else {
        "task panicked".to_string()
    }
}

// Background work: the shared frame worker pool and the snapshot sweeper.

pub mod pool;
pub mod sweeper;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

// Granularity of cancellable sleeps
const PAUSE_SLICE: Duration = Duration::from_millis(50);

/// Check if a cancel flag has been raised.
pub fn is_cancelled(flag: &AtomicBool) -> bool {
    flag.load(Ordering::Relaxed)
}

/// Sleep for `duration` unless `flag` is raised first.
/// Returns false when cancelled.
pub fn pause(duration: Duration, flag: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if is_cancelled(flag) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        std::thread::sleep(remaining.min(PAUSE_SLICE));
    }
}

/// Outcome of waiting on a channel with `recv_until`.
#[derive(Debug, PartialEq, Eq)]
pub enum Received<T> {
    Item(T),
    Deadline,
    Cancelled,
    /// Every sender is gone
    Closed,
}

/// Receive one item, giving up at `deadline` or when `flag` is raised.
/// With no deadline it waits until an item arrives, the channel closes or the flag is raised.
pub fn recv_until<T>(rx: &Receiver<T>, deadline: Option<Instant>, flag: &AtomicBool) -> Received<T> {
    loop {
        if is_cancelled(flag) {
            return Received::Cancelled;
        }
        let slice = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Received::Deadline;
                }
                remaining.min(PAUSE_SLICE)
            }
            None => PAUSE_SLICE,
        };
        match rx.recv_timeout(slice) {
            Ok(item) => return Received::Item(item),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Received::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_pause_completes() {
        let flag = AtomicBool::new(false);
        let started = Instant::now();
        assert!(pause(Duration::from_millis(120), &flag));
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn test_pause_wakes_on_cancel() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = Arc::clone(&flag);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            setter.store(true, Ordering::Relaxed);
        });

        let started = Instant::now();
        assert!(!pause(Duration::from_secs(30), &flag));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_recv_until_outcomes() {
        let flag = AtomicBool::new(false);
        let (tx, rx) = std::sync::mpsc::channel::<u32>();

        tx.send(7).unwrap();
        assert_eq!(recv_until(&rx, None, &flag), Received::Item(7));

        let started = Instant::now();
        let deadline = Some(started + Duration::from_millis(120));
        assert_eq!(recv_until(&rx, deadline, &flag), Received::Deadline);
        assert!(started.elapsed() >= Duration::from_millis(120));

        drop(tx);
        assert_eq!(recv_until(&rx, None, &flag), Received::Closed);
    }

    #[test]
    fn test_recv_until_wakes_on_cancel() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = Arc::clone(&flag);
        let (_tx, rx) = std::sync::mpsc::channel::<u32>();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            setter.store(true, Ordering::Relaxed);
        });

        let started = Instant::now();
        assert_eq!(recv_until(&rx, None, &flag), Received::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}

//! Cooperative cancellation shared by the engine, the controllers and the
//! Ctrl-C handler.

use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// Longest uninterrupted wait; cancellation is noticed within this bound
const SLICE: Duration = Duration::from_millis(50);

/// Shared cancellation flag (set from a signal handler, polled by waiters)
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear a previous cancellation
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Sleep in short slices; false if cancelled before `duration` elapsed
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(SLICE));
        }
    }

    /// Run a blocking job on a worker thread and wait for it unless cancelled
    ///
    /// Returns `None` as soon as cancellation is observed. The worker is then
    /// detached and its result dropped when it eventually finishes, so the job
    /// must not touch state the caller tears down afterwards. A panic in the
    /// job is propagated to the caller.
    pub fn run<T, F>(&self, job: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_cancelled() {
            return None;
        }
        let (tx, rx) = mpsc::channel();
        let worker = thread::spawn(move || {
            // Receiver is gone when the caller was cancelled
            let _ = tx.send(job());
        });

        loop {
            match rx.recv_timeout(SLICE) {
                Ok(value) => return Some(value),
                Err(RecvTimeoutError::Timeout) => {
                    if self.is_cancelled() {
                        return None;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return match worker.join() {
                        Err(payload) => panic::resume_unwind(payload),
                        Ok(()) => None,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_sleep() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(10)));

        let remote = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        let started = Instant::now();
        assert!(!token.sleep(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(2));
        canceller.join().unwrap();

        token.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_run_returns_job_result() {
        let token = CancelToken::new();
        assert_eq!(token.run(|| 6 * 7), Some(42));
    }

    #[test]
    fn test_run_gives_up_on_cancel() {
        let token = CancelToken::new();
        let remote = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });

        let started = Instant::now();
        let result = token.run(|| {
            thread::sleep(Duration::from_secs(3));
            "late"
        });
        canceller.join().unwrap();

        assert_eq!(result, None);
        assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
    }

    #[test]
    fn test_run_after_cancel_skips_job() {
        let token = CancelToken::new();
        token.cancel();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        assert_eq!(token.run(move || flag.store(true, Ordering::SeqCst)), None);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "oracle exploded")]
    fn test_run_propagates_panics() {
        CancelToken::new().run(|| -> u8 { panic!("oracle exploded") });
    }
}

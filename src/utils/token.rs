use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long a cancellable wait blocks before re-checking its token.
/// Bounds shutdown latency without interrupting the underlying wait.
pub(crate) const CANCEL_POLL_SLICE: Duration = Duration::from_millis(100);

/// Shared cancellation signal.
///
/// Set once, observed at every suspension point (completion-channel and
/// event-channel waits). Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Idempotent.
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = StopToken::new();
        let other = token.clone();
        assert!(!other.is_stopped());
        token.stop();
        assert!(other.is_stopped());
    }

    #[test]
    fn stop_is_idempotent() {
        let token = StopToken::new();
        token.stop();
        token.stop();
        assert!(token.is_stopped());
    }

    #[test]
    fn observed_across_threads() {
        let token = StopToken::new();
        let observer = {
            let token = token.clone();
            std::thread::spawn(move || {
                while !token.is_stopped() {
                    std::thread::yield_now();
                }
            })
        };
        token.stop();
        observer.join().unwrap();
    }
}

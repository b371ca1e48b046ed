//! Timeout-bounded execution of blocking link operations.
//!
//! A crate that stops echoing its terminator leaves a raw socket read blocked
//! with no point at which it could observe a cancellation. [`run_bounded`]
//! therefore runs the operation on its own OS thread and waits for the result
//! with a deadline. On expiry the result channel is dropped, the operation's
//! [`Tripwire`] is pulled (shutting down any socket or child process it armed)
//! and the caller gets an empty result. The abandoned thread is never joined.
//!
//! ```no_run
//! use sepd_sc::executor::run_bounded;
//! use std::time::Duration;
//!
//! # async fn demo() {
//! let readings: Vec<f64> = run_bounded("north-temperature", Duration::from_secs(1), |_wire| {
//!     vec![21.5, 22.0]
//! })
//! .await;
//! # }
//! ```

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

type Abort = Box<dyn FnOnce() + Send>;

/// Cancellation hooks registered by a bounded operation.
///
/// Armed hooks run when the deadline expires; hooks armed after that run
/// immediately so a late-opened socket does not outlive its deadline.
#[derive(Clone, Default)]
pub struct Tripwire {
    inner: Arc<TripwireInner>,
}

#[derive(Default)]
struct TripwireInner {
    tripped: AtomicBool,
    hooks: Mutex<Vec<Abort>>,
}

impl Tripwire {
    /// Register a hook to run when the deadline expires.
    pub fn on_trip<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut hooks = self
            .inner
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.inner.tripped.load(Ordering::SeqCst) {
            drop(hooks);
            hook();
        } else {
            hooks.push(Box::new(hook));
        }
    }

    /// Shut `stream` down when the deadline expires, unblocking pending reads.
    pub fn arm_stream(&self, stream: &TcpStream) -> std::io::Result<()> {
        let clone = stream.try_clone()?;
        self.on_trip(move || {
            let _ = clone.shutdown(Shutdown::Both);
        });
        Ok(())
    }

    pub fn is_tripped(&self) -> bool {
        self.inner.tripped.load(Ordering::SeqCst)
    }

    fn trip(&self) {
        let hooks = {
            let mut hooks = self
                .inner
                .hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.inner.tripped.store(true, Ordering::SeqCst);
            std::mem::take(&mut *hooks)
        };
        for hook in hooks {
            hook();
        }
    }
}

/// Run `op` on an isolated thread, returning `T::default()` if it does not
/// finish within `deadline`, panics, or cannot be started.
pub async fn run_bounded<T, F>(label: &str, deadline: Duration, op: F) -> T
where
    T: Default + Send + 'static,
    F: FnOnce(&Tripwire) -> T + Send + 'static,
{
    let tripwire = Tripwire::default();
    let worker_wire = tripwire.clone();
    let (tx, rx) = oneshot::channel();

    let spawned = thread::Builder::new()
        .name(format!("bounded-{label}"))
        .spawn(move || {
            let result = op(&worker_wire);
            // The receiver is gone once the deadline has expired.
            let _ = tx.send(result);
        });
    if let Err(e) = spawned {
        error!(operation = label, error = %e, "Failed to start bounded worker");
        return T::default();
    }

    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(result)) => {
            debug!(operation = label, "Bounded operation completed");
            result
        }
        Ok(Err(_)) => {
            error!(operation = label, "Bounded operation ended without a result");
            T::default()
        }
        Err(_) => {
            warn!(
                operation = label,
                ?deadline,
                "Deadline expired, abandoning operation"
            );
            tripwire.trip();
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::Instant;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn returns_result_within_deadline() {
        let out: Vec<u32> = run_bounded("quick", Duration::from_secs(1), |_| vec![1, 2, 3]).await;
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[tokio::test]
    #[traced_test]
    async fn abandons_operation_that_never_returns() {
        let deadline = Duration::from_millis(100);
        let started = Instant::now();
        let out: Vec<f64> = run_bounded("stuck", deadline, |_| {
            thread::sleep(Duration::from_secs(5));
            vec![1.0]
        })
        .await;

        assert!(out.is_empty());
        assert!(started.elapsed() < deadline + Duration::from_millis(500));
        assert!(logs_contain("Deadline expired"));
    }

    #[tokio::test]
    async fn panicking_operation_yields_empty_result() {
        let out: Option<u8> = run_bounded("panics", Duration::from_secs(1), |_| {
            panic!("link exploded");
        })
        .await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn expiry_unblocks_armed_socket_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept but never answer.
        let _server = thread::spawn(move || listener.accept().map(|(s, _)| s));

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let out: Option<usize> = run_bounded("silent", Duration::from_millis(100), move |wire| {
            let mut stream = TcpStream::connect(addr).ok()?;
            wire.arm_stream(&stream).ok()?;
            let mut buf = [0u8; 8];
            let n = stream.read(&mut buf);
            let _ = done_tx.send(n.is_ok());
            Some(0)
        })
        .await;

        assert!(out.is_none());
        // The blocked read returns once the socket is shut down.
        assert!(done_rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn hooks_armed_after_trip_run_immediately() {
        let wire = Tripwire::default();
        wire.trip();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        wire.on_trip(move || flag.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
        assert!(wire.is_tripped());
    }
}

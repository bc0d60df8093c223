//! Integration-style tests over the public surface.
//!
//! Every test runs on a paused runtime clock, so delay and backoff
//! assertions are deterministic and fast. Timing comparisons allow the
//! same 3 s slack a loaded scheduler needs in real time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::QueueOptions;
use crate::error::Error;
use crate::handler::{handler_fn, Args, Handler};

mod batcher;
mod memqueue;

/// `elapsed` matches `expected` if it is not early and less than 3 s late.
fn dur_equal(elapsed: Duration, expected: Duration) -> bool {
    elapsed >= expected && elapsed - expected < Duration::from_secs(3)
}

/// Options tuned for tests: small pool, fast polls, no surprises from
/// host parallelism.
fn test_options(name: &str) -> QueueOptions {
    QueueOptions {
        name: name.to_string(),
        worker_count: 2,
        wait_timeout: Duration::from_millis(200),
        reservation_timeout: Duration::from_secs(60),
        ..QueueOptions::default()
    }
}

/// Handler that records each invocation instant on a channel.
fn tick_handler() -> (Arc<dyn Handler>, mpsc::UnboundedReceiver<Instant>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |_args: Args| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(Instant::now());
            Ok(())
        }
    });
    (handler, rx)
}

/// Handler that always fails, recording invocation instants.
fn failing_handler(
    msg: &'static str,
) -> (Arc<dyn Handler>, mpsc::UnboundedReceiver<Instant>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |_args: Args| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(Instant::now());
            Err(Error::handler(msg))
        }
    });
    (handler, rx)
}

/// Counter shared with a handler.
fn counting_handler() -> (Arc<dyn Handler>, Arc<AtomicU64>) {
    let count = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&count);
    let handler = handler_fn(move |_args: Args| {
        let seen = Arc::clone(&seen);
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    (handler, count)
}

/// Drain the next invocation instant, failing the test after `secs` of
/// (mock) waiting.
async fn recv_within(rx: &mut mpsc::UnboundedReceiver<Instant>, secs: u64) -> Instant {
    tokio::time::timeout(Duration::from_secs(secs), rx.recv())
        .await
        .expect("handler was not invoked in time")
        .expect("handler channel closed")
}

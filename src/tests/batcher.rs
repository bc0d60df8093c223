//! Batcher tests: flush conditions, splitter, sync mode, error fan-out.

use super::*;

use parking_lot::Mutex;

use crate::batcher::{batch_fn, Batcher, BatcherOptions};
use crate::message::Message;

/// Batcher whose handler records the size of every flush.
fn recording_batcher(
    max_size: usize,
    max_timeout: Duration,
    hold_below: Option<usize>,
) -> (Arc<Batcher>, Arc<Mutex<Vec<usize>>>) {
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&sizes);

    let mut opt = BatcherOptions::new(batch_fn(move |msgs: Vec<Message>| {
        let record = Arc::clone(&record);
        async move {
            record.lock().push(msgs.len());
            Ok(())
        }
    }));
    opt.max_size = max_size;
    opt.max_timeout = max_timeout;
    if let Some(threshold) = hold_below {
        opt.splitter = Some(Arc::new(move |msgs: Vec<Message>| {
            if msgs.len() >= threshold {
                (msgs, Vec::new())
            } else {
                (Vec::new(), msgs)
            }
        }));
    }

    (Batcher::new(opt), sizes)
}

fn spawn_adds(batcher: &Arc<Batcher>, n: usize) -> Vec<tokio::task::JoinHandle<Result<(), Error>>> {
    (0..n)
        .map(|_| {
            let b = Arc::clone(batcher);
            tokio::spawn(async move { b.add(Message::new()).await })
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn flushes_at_max_size() {
    let (batcher, sizes) = recording_batcher(3, Duration::from_secs(60), None);

    for join in spawn_adds(&batcher, 3) {
        join.await.unwrap().unwrap();
    }

    assert_eq!(*sizes.lock(), vec![3]);
    assert_eq!(batcher.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn flushes_stragglers_on_timeout() {
    let (batcher, sizes) = recording_batcher(10, Duration::from_secs(1), None);

    let start = Instant::now();
    let joins = spawn_adds(&batcher, 2);
    for join in joins {
        join.await.unwrap().unwrap();
    }

    assert!(start.elapsed() >= Duration::from_secs(1), "flushed before the window");
    assert_eq!(*sizes.lock(), vec![2]);
}

#[tokio::test(start_paused = true)]
async fn splitter_holds_back_subthreshold_tail() {
    let (batcher, sizes) = recording_batcher(10, Duration::from_secs(3), Some(10));

    let joins = spawn_adds(&batcher, 15);
    for join in joins {
        join.await.unwrap().unwrap();
    }

    // One full batch at the cap, the tail on the timer.
    assert_eq!(*sizes.lock(), vec![10, 5]);
}

#[tokio::test(start_paused = true)]
async fn sync_mode_flushes_every_add() {
    let (batcher, sizes) = recording_batcher(10, Duration::from_secs(60), None);
    batcher.set_sync(true).await;

    for _ in 0..3 {
        batcher.add(Message::new()).await.unwrap();
    }

    assert_eq!(*sizes.lock(), vec![1, 1, 1]);
}

#[tokio::test(start_paused = true)]
async fn set_sync_flushes_pending_tail() {
    let (batcher, sizes) = recording_batcher(10, Duration::from_secs(60), None);

    let joins = spawn_adds(&batcher, 4);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(batcher.pending(), 4);

    batcher.set_sync(true).await;
    for join in joins {
        join.await.unwrap().unwrap();
    }
    assert_eq!(*sizes.lock(), vec![4]);
}

#[tokio::test(start_paused = true)]
async fn flush_error_fails_every_waiter() {
    let mut opt = BatcherOptions::new(batch_fn(|_msgs: Vec<Message>| async move {
        Err(Error::handler("bulk call failed"))
    }));
    opt.max_size = 2;
    let batcher = Batcher::new(opt);

    for join in spawn_adds(&batcher, 2) {
        let err = join.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Handler(_)));
    }
}

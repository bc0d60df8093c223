//! Memory queue tests: ordering, delay, backpressure, reservations.

use super::*;

use crate::memqueue::MemoryQueue;
use crate::message::Message;
use crate::queuer::Queuer;

fn queue_options(name: &str) -> QueueOptions {
    QueueOptions {
        wait_timeout: Duration::from_millis(200),
        ..test_options(name)
    }
}

const RESERVE: Duration = Duration::from_secs(60);
const WAIT: Duration = Duration::from_millis(100);

#[tokio::test(start_paused = true)]
async fn ready_messages_keep_fifo_order() {
    let queue = MemoryQueue::new(queue_options("fifo"));
    for i in 0..3i64 {
        queue.add(Message::new().arg(i)).await.unwrap();
    }

    let msgs = queue.reserve_n(3, RESERVE, WAIT).await.unwrap();
    assert_eq!(msgs.len(), 3);
    for (i, msg) in msgs.iter().enumerate() {
        assert_eq!(msg.args[0], crate::codec::ArgValue::Int(i as i64));
        assert_eq!(msg.reserved_count, 1);
        assert!(!msg.reservation_id.is_empty());
        assert!(!msg.id.is_empty());
    }
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn delayed_message_is_invisible_until_due() {
    let queue = MemoryQueue::new(queue_options("delayed"));
    queue
        .add(Message::new().delay(Duration::from_secs(1)))
        .await
        .unwrap();

    let early = queue.reserve_n(1, RESERVE, WAIT).await.unwrap();
    assert!(early.is_empty(), "delayed message visible early");

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let due = queue.reserve_n(1, RESERVE, WAIT).await.unwrap();
    assert_eq!(due.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn release_redelivers_after_delay() {
    let queue = MemoryQueue::new(queue_options("release"));
    queue.add(Message::new()).await.unwrap();

    let msg = queue.reserve_n(1, RESERVE, WAIT).await.unwrap().remove(0);
    queue.release(&msg, Duration::from_secs(1)).await.unwrap();

    assert!(queue.reserve_n(1, RESERVE, WAIT).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let again = queue.reserve_n(1, RESERVE, WAIT).await.unwrap().remove(0);
    assert_eq!(again.id, msg.id);
    assert_eq!(again.reserved_count, 2);
}

#[tokio::test(start_paused = true)]
async fn delete_acknowledges_for_good() {
    let queue = MemoryQueue::new(queue_options("delete"));
    queue.add(Message::new()).await.unwrap();

    let msg = queue
        .reserve_n(1, Duration::from_secs(1), WAIT)
        .await
        .unwrap()
        .remove(0);
    queue.delete(&msg).await.unwrap();

    // Past the reservation timeout: a deleted message must not reappear.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(queue.reserve_n(1, RESERVE, WAIT).await.unwrap().is_empty());
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn expired_reservation_is_redelivered() {
    let queue = MemoryQueue::new(queue_options("expiry"));
    queue.add(Message::new()).await.unwrap();

    let msg = queue
        .reserve_n(1, Duration::from_secs(1), WAIT)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(msg.reserved_count, 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let again = queue.reserve_n(1, RESERVE, WAIT).await.unwrap().remove(0);
    assert_eq!(again.id, msg.id);
    assert_eq!(again.reserved_count, 2);

    // The stale lease must no longer acknowledge the message.
    queue.delete(&msg).await.unwrap();
    queue.release(&again, Duration::ZERO).await.unwrap();
    assert_eq!(queue.len().await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn full_buffer_blocks_then_fails() {
    let mut opt = queue_options("full");
    opt.buffer_size = 1;
    opt.wait_timeout = Duration::from_millis(100);
    let queue = MemoryQueue::new(opt);

    queue.add(Message::new()).await.unwrap();

    let start = Instant::now();
    let err = queue.add(Message::new()).await.unwrap_err();
    assert!(matches!(err, Error::BufferFull));
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn consumer_unblocks_a_waiting_producer() {
    let mut opt = queue_options("backpressure");
    opt.buffer_size = 1;
    opt.wait_timeout = Duration::from_secs(5);
    let queue = MemoryQueue::new(opt);

    queue.add(Message::new().arg(1i64)).await.unwrap();

    let producer = {
        let q = Arc::clone(&queue);
        tokio::spawn(async move { q.add(Message::new().arg(2i64)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let msg = queue.reserve_n(1, RESERVE, WAIT).await.unwrap().remove(0);
    producer.await.unwrap().unwrap();
    queue.delete(&msg).await.unwrap();

    let second = queue.reserve_n(1, RESERVE, WAIT).await.unwrap().remove(0);
    assert_eq!(second.args[0], crate::codec::ArgValue::Int(2));
}

#[tokio::test(start_paused = true)]
async fn duplicate_name_is_rejected_at_add() {
    let queue = MemoryQueue::new(queue_options("dup"));
    queue.add(Message::new().name("n")).await.unwrap();

    let err = queue.add(Message::new().name("n")).await.unwrap_err();
    assert!(matches!(err, Error::Duplicate));
    assert_eq!(queue.len().await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn purge_empties_everything() {
    let queue = MemoryQueue::new(queue_options("purge"));
    queue.add(Message::new()).await.unwrap();
    queue
        .add(Message::new().delay(Duration::from_secs(5)))
        .await
        .unwrap();
    let _reserved = queue.reserve_n(1, RESERVE, WAIT).await.unwrap();

    queue.purge().await.unwrap();
    assert_eq!(queue.len().await.unwrap(), 0);
    assert!(queue.reserve_n(1, RESERVE, WAIT).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn closed_queue_rejects_operations() {
    let queue = MemoryQueue::new(queue_options("closed"));
    queue.close().await.unwrap();

    assert!(matches!(
        queue.add(Message::new()).await,
        Err(Error::Closed)
    ));
    assert!(matches!(
        queue.reserve_n(1, RESERVE, WAIT).await,
        Err(Error::Closed)
    ));
}

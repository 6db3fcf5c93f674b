//! End-to-end delayed queue scenarios against the in-memory backend.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use coffer::kv::mem::MemKv;
use coffer::{
    CONN_VERSION_MOCK, Clock, Config, Conn, Error, Fabric, MockClock, Queue, Record, Result,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TASK_TYPE: u16 = 0x0002;
const QUEUE_TYPE: u16 = 0x0200;

#[derive(Debug, Clone, Default)]
struct Task {
    id: Vec<u8>,
    payload: Vec<u8>,
}

impl Task {
    fn new(id: &[u8], payload: &[u8]) -> Self {
        Self {
            id: id.to_vec(),
            payload: payload.to_vec(),
        }
    }

    fn fabric() -> Fabric {
        Arc::new(|id: &[u8]| {
            Ok(Box::new(Task {
                id: id.to_vec(),
                ..Task::default()
            }) as Box<dyn Record>)
        })
    }
}

impl Record for Task {
    fn id(&self) -> Bytes {
        Bytes::copy_from_slice(&self.id)
    }

    fn collection(&self) -> u16 {
        TASK_TYPE
    }

    fn marshal(&self) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(&self.payload))
    }

    fn unmarshal(&mut self, buf: &[u8]) -> Result<()> {
        self.payload = buf.to_vec();
        Ok(())
    }
}

/// Connection over a pinned clock, so due-ness is test-controlled.
fn mock_conn() -> (Conn, Arc<MockClock>) {
    let clock = Arc::new(MockClock::with_time(
        UNIX_EPOCH + Duration::from_secs(1_700_000_000),
    ));
    let conn = Conn::with_kv(
        1,
        Config::default(),
        Arc::new(MemKv::new()),
        clock.clone(),
    )
    .unwrap();
    (conn, clock)
}

async fn save_and_publish(conn: &Conn, queue: &Queue, task: &Task, when: Option<SystemTime>) {
    let queue = queue.clone();
    let task = task.clone();
    conn.tx(move |db| {
        let queue = queue.clone();
        let task = task.clone();
        async move {
            db.save(&[&task]).await?;
            queue.publish(&db, &task, when)
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn should_deliver_task_once_due() {
    // given - a task published 100ms into the future
    let (conn, clock) = mock_conn();
    let queue = conn.queue(QUEUE_TYPE, Task::fabric());
    let due = clock.now() + Duration::from_millis(100);
    save_and_publish(&conn, &queue, &Task::new(b"t1", b"work"), Some(due)).await;

    // then - not due yet: the next-task distance is the remaining delay,
    // not the punch interval, and nothing is in flight
    let distance = queue.next_task_distance().await.unwrap();
    assert!(distance <= Duration::from_millis(101));
    assert!(queue.get_lost(10).await.unwrap().is_empty());

    // when - time passes
    clock.advance(Duration::from_millis(150));
    let token = CancellationToken::new();
    let task = timeout(Duration::from_secs(5), queue.sub_one(&token))
        .await
        .unwrap()
        .unwrap();

    // then - delivered with its stored payload
    assert_eq!(task.id(), Bytes::from_static(b"t1"));
    let lost = queue.get_lost(10).await.unwrap();
    assert_eq!(lost.len(), 1);
}

#[tokio::test]
async fn should_move_claimed_task_to_lost_until_acked() {
    // given - a due task, claimed
    let (conn, clock) = mock_conn();
    let queue = conn.queue(QUEUE_TYPE, Task::fabric());
    save_and_publish(&conn, &queue, &Task::new(b"t1", b"work"), None).await;
    clock.advance(Duration::from_millis(1));

    let token = CancellationToken::new();
    let task = queue.sub_one(&token).await.unwrap();

    // then - pending is empty (distance falls back to punch), lost holds it
    let distance = queue.next_task_distance().await.unwrap();
    assert_eq!(distance, conn.config().punch_size);
    let lost = queue.get_lost(10).await.unwrap();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].id(), Bytes::from_static(b"t1"));

    // when - acknowledged
    let queue2 = queue.clone();
    conn.tx(move |db| {
        let queue = queue2.clone();
        let id = task.id();
        async move {
            let task = Task::new(&id, b"");
            queue.ack(&db, &task)
        }
    })
    .await
    .unwrap();

    // then
    assert!(queue.get_lost(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn should_treat_ack_of_unclaimed_task_as_noop() {
    // given
    let (conn, _clock) = mock_conn();
    let queue = conn.queue(QUEUE_TYPE, Task::fabric());

    // when - acking something that was never claimed, twice
    for _ in 0..2 {
        let queue = queue.clone();
        conn.tx(move |db| {
            let queue = queue.clone();
            async move { queue.ack(&db, &Task::new(b"ghost", b"")) }
        })
        .await
        .unwrap();
    }

    // then
    assert!(queue.get_lost(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn should_store_single_entry_for_duplicate_publish() {
    // given - the same (time, id) published twice
    let (conn, clock) = mock_conn();
    let queue = conn.queue(QUEUE_TYPE, Task::fabric());
    let task = Task::new(b"t1", b"work");
    let due = clock.now();
    save_and_publish(&conn, &queue, &task, Some(due)).await;
    save_and_publish(&conn, &queue, &task, Some(due)).await;
    clock.advance(Duration::from_millis(1));

    // when
    let token = CancellationToken::new();
    let delivered = queue.sub_list(&token, 1).await.unwrap();

    // then - exactly one entry existed
    assert_eq!(delivered.len(), 1);
    assert_eq!(
        queue.next_task_distance().await.unwrap(),
        conn.config().punch_size
    );
}

#[tokio::test]
async fn should_claim_batch_in_firing_order() {
    // given - three tasks due at staggered times
    let (conn, clock) = mock_conn();
    let queue = conn.queue(QUEUE_TYPE, Task::fabric());
    for (id, offset) in [(&b"t3"[..], 30u64), (b"t1", 10), (b"t2", 20)] {
        let due = clock.now() + Duration::from_millis(offset);
        save_and_publish(&conn, &queue, &Task::new(id, b"w"), Some(due)).await;
    }
    clock.advance(Duration::from_millis(100));

    // when
    let token = CancellationToken::new();
    let tasks = queue.sub_list(&token, 3).await.unwrap();

    // then - firing-time order, not publish order
    let ids: Vec<Bytes> = tasks.iter().map(|t| t.id()).collect();
    assert_eq!(
        ids,
        vec![
            Bytes::from_static(b"t1"),
            Bytes::from_static(b"t2"),
            Bytes::from_static(b"t3"),
        ]
    );
}

#[tokio::test]
async fn should_wake_blocked_subscriber_on_publish() {
    // given - a subscriber blocked on an empty queue (real clock; the watch
    // fires on publish, well before the punch interval)
    let conn = Conn::new(1, CONN_VERSION_MOCK).unwrap();
    let queue = conn.queue(QUEUE_TYPE, Task::fabric());
    let token = CancellationToken::new();

    let subscriber = {
        let queue = queue.clone();
        let token = token.clone();
        tokio::spawn(async move { queue.sub_one(&token).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // when
    save_and_publish(&conn, &queue, &Task::new(b"t1", b"wake"), None).await;

    // then - the subscriber returns promptly instead of punching out
    let task = timeout(Duration::from_secs(5), subscriber)
        .await
        .expect("subscriber should wake on publish")
        .unwrap()
        .unwrap();
    assert_eq!(task.id(), Bytes::from_static(b"t1"));
}

#[tokio::test]
async fn should_cancel_blocked_subscriber() {
    // given
    let (conn, _clock) = mock_conn();
    let queue = conn.queue(QUEUE_TYPE, Task::fabric());
    let token = CancellationToken::new();

    let subscriber = {
        let queue = queue.clone();
        let token = token.clone();
        tokio::spawn(async move { queue.sub_one(&token).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // when
    token.cancel();

    // then
    let result = timeout(Duration::from_secs(5), subscriber)
        .await
        .expect("cancellation should unblock the subscriber")
        .unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[tokio::test]
async fn should_stream_records_through_sub_channels() {
    // given - two due tasks and a channel subscription
    let conn = Conn::new(1, CONN_VERSION_MOCK).unwrap();
    let queue = conn.queue(QUEUE_TYPE, Task::fabric());
    save_and_publish(&conn, &queue, &Task::new(b"t1", b"a"), None).await;
    save_and_publish(&conn, &queue, &Task::new(b"t2", b"b"), None).await;

    let token = CancellationToken::new();
    let (mut records, mut errors) = queue.sub(token.clone());

    // when - both records arrive, then the subscription is cancelled
    let first = timeout(Duration::from_secs(5), records.recv())
        .await
        .unwrap()
        .unwrap();
    let second = timeout(Duration::from_secs(5), records.recv())
        .await
        .unwrap()
        .unwrap();
    token.cancel();

    // then - the terminal error lands on the error channel and both
    // channels close
    let mut ids = vec![first.id(), second.id()];
    ids.sort();
    assert_eq!(ids, vec![Bytes::from_static(b"t1"), Bytes::from_static(b"t2")]);

    let err = timeout(Duration::from_secs(5), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(err, Error::Cancelled));
    assert!(timeout(Duration::from_secs(5), records.recv())
        .await
        .unwrap()
        .is_none());
    assert!(timeout(Duration::from_secs(5), errors.recv())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn should_hydrate_claimed_records_from_their_collection() {
    // given - the published record carries a payload in its collection
    let (conn, clock) = mock_conn();
    let queue = conn.queue(QUEUE_TYPE, Task::fabric());
    save_and_publish(&conn, &queue, &Task::new(b"t1", b"payload-bytes"), None).await;
    clock.advance(Duration::from_millis(1));

    // when
    let token = CancellationToken::new();
    let task = queue.sub_one(&token).await.unwrap();

    // then - the fabric shell was filled by a load in a fresh transaction
    let digest = conn
        .read_tx(|db| async move { db.get(TASK_TYPE, b"t1").await })
        .await
        .unwrap();
    assert!(digest.is_some());
    assert_eq!(task.id(), Bytes::from_static(b"t1"));
    assert_eq!(task.marshal().unwrap(), Bytes::from_static(b"payload-bytes"));
}

#[tokio::test]
async fn should_report_punch_distance_for_empty_queue() {
    // given
    let (conn, _clock) = mock_conn();
    let queue = conn.queue(QUEUE_TYPE, Task::fabric());

    // when/then
    assert_eq!(
        queue.next_task_distance().await.unwrap(),
        conn.config().punch_size
    );
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reliable_bus::bus::InMemoryBroker;
use reliable_bus::consumer::{ConsumerGroup, HandlerRegistry};
use tokio::sync::Semaphore;

use crate::support::{eventually, fast_config, publish, Transfer, TOPIC};

/// Handlers that count starts and then wait for a permit from `gate`.
fn gated(
    started: &Arc<AtomicUsize>,
    finished: &Arc<AtomicUsize>,
    gate: &Arc<Semaphore>,
) -> HandlerRegistry {
    let (started, finished, gate) = (started.clone(), finished.clone(), gate.clone());
    HandlerRegistry::new().on::<Transfer, _, _>(move |_, _| {
        let (started, finished, gate) = (started.clone(), finished.clone(), gate.clone());
        async move {
            started.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pulling_pauses_at_full_load_threshold() {
    let broker = InMemoryBroker::new("test").with_topic(TOPIC, 1);
    for n in 0..15 {
        publish(&broker, &Transfer::new(&format!("acct-{n}"), 1)).await;
    }

    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Semaphore::new(0));

    let mut config = fast_config();
    config.full_load_threshold = 10;
    config.mailbox_concurrency = 16;
    let handle = ConsumerGroup::new(
        "ledger",
        TOPIC,
        Arc::new(broker.clone()),
        gated(&started, &finished, &gate),
    )
    .with_config(config)
    .start()
    .await
    .unwrap();

    // Pulls ten, then stops.
    eventually(|| started.load(Ordering::SeqCst) == 10).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(started.load(Ordering::SeqCst), 10);
    assert_eq!(handle.mailbox().in_flight(), 10);

    // One slot frees up, one more message is pulled.
    gate.add_permits(1);
    eventually(|| started.load(Ordering::SeqCst) == 11).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(handle.mailbox().in_flight(), 10);

    gate.add_permits(100);
    eventually(|| finished.load(Ordering::SeqCst) == 15).await;
    let stats = handle.stop().await;

    assert_eq!(stats.received, 15);
    assert_eq!(stats.handled, 15);
    assert_eq!(broker.committed_offset("ledger", TOPIC, 0), Some(15));
}

#[tokio::test]
async fn stop_waits_for_in_flight_handlers_before_committing() {
    let broker = InMemoryBroker::new("test").with_topic(TOPIC, 1);
    for n in 0..3 {
        publish(&broker, &Transfer::new("A1", n)).await;
    }

    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Semaphore::new(0));
    let handle = ConsumerGroup::new(
        "ledger",
        TOPIC,
        Arc::new(broker.clone()),
        gated(&started, &finished, &gate),
    )
    .with_config(fast_config())
    .start()
    .await
    .unwrap();

    eventually(|| started.load(Ordering::SeqCst) == 1).await;
    handle.signal_stop();
    gate.add_permits(3);
    let stats = handle.join().await;

    assert_eq!(finished.load(Ordering::SeqCst), 3);
    assert_eq!(stats.handled, 3);
    assert_eq!(broker.committed_offset("ledger", TOPIC, 0), Some(3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_sharing_a_mailbox_stay_under_the_threshold() {
    let broker = InMemoryBroker::new("test").with_topic(TOPIC, 8);
    for n in 0..40 {
        publish(&broker, &Transfer::new(&format!("acct-{n}"), 1)).await;
    }

    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Semaphore::new(0));

    let mut config = fast_config();
    config.full_load_threshold = 10;
    config.mailbox_concurrency = 64;
    let handle = ConsumerGroup::new(
        "ledger",
        TOPIC,
        Arc::new(broker.clone()),
        gated(&started, &finished, &gate),
    )
    .with_config(config)
    .with_readers(8)
    .start()
    .await
    .unwrap();

    let mailbox = handle.mailbox().clone();
    let peak = Arc::new(AtomicUsize::new(0));
    let sampler = {
        let peak = peak.clone();
        tokio::spawn(async move {
            loop {
                peak.fetch_max(mailbox.in_flight(), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    eventually(|| started.load(Ordering::SeqCst) == 10).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(started.load(Ordering::SeqCst), 10);

    gate.add_permits(100);
    eventually(|| finished.load(Ordering::SeqCst) == 40).await;
    sampler.abort();
    let stats = handle.stop().await;

    assert!(peak.load(Ordering::SeqCst) <= 10);
    assert_eq!(stats.received, 40);
    assert_eq!(stats.handled, 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn offsets_are_committed_while_the_reader_idles() {
    let broker = InMemoryBroker::new("test").with_topic(TOPIC, 1);
    publish(&broker, &Transfer::new("A1", 1)).await;

    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Semaphore::new(0));

    // Once the topic runs dry the reader sleeps far longer than the test.
    let mut config = fast_config();
    config.wait_interval = Duration::from_secs(30);
    config.max_wait = Duration::from_secs(30);
    let handle = ConsumerGroup::new(
        "ledger",
        TOPIC,
        Arc::new(broker.clone()),
        gated(&started, &finished, &gate),
    )
    .with_config(config)
    .start()
    .await
    .unwrap();

    eventually(|| started.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    gate.add_permits(1);

    eventually(|| broker.committed_offset("ledger", TOPIC, 0) == Some(1)).await;
    let stats = handle.stop().await;
    assert_eq!(stats.handled, 1);
}

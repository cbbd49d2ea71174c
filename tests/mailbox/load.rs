use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::support::{eventually, mailbox};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_caps_simultaneous_keys() {
    let mailbox = mailbox(3, 10, 1000);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut completions = Vec::new();
    for key in 0..12 {
        let (running, peak) = (running.clone(), peak.clone());
        completions.push(
            mailbox
                .enqueue(format!("key-{key}"), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap(),
        );
    }
    for completion in completions {
        completion.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fullness_is_reported_but_work_is_never_dropped() {
    let mailbox = mailbox(16, 10, 4);
    let gate = Arc::new(Semaphore::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let mut completions = Vec::new();
    for n in 0..6 {
        let (gate, done) = (gate.clone(), done.clone());
        completions.push(
            mailbox
                .enqueue(format!("key-{n}"), async move {
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap(),
        );
    }

    assert_eq!(mailbox.in_flight(), 6);
    assert!(mailbox.is_full());
    assert_eq!(mailbox.capacity(), 0);

    gate.add_permits(3);
    eventually(|| done.load(Ordering::SeqCst) == 3).await;
    mailbox.wait_for_capacity().await;
    assert!(!mailbox.is_full());
    assert_eq!(mailbox.in_flight(), 3);

    gate.add_permits(10);
    for completion in completions {
        completion.await.unwrap();
    }
    mailbox.wait_idle().await;
    assert_eq!(done.load(Ordering::SeqCst), 6);
    assert_eq!(mailbox.in_flight(), 0);
}

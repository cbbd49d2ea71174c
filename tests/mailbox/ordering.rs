use std::time::Duration;

use futures::future::join_all;
use tokio::sync::oneshot;

use crate::support::{mailbox, Trace};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_runs_fifo_even_when_earlier_entry_is_slow() {
    let mailbox = mailbox(8, 2, 100);
    let trace = Trace::default();

    let mut completions = Vec::new();
    for n in 0..10u64 {
        let trace = trace.clone();
        // Earlier entries sleep longer; FIFO must still hold.
        completions.push(
            mailbox
                .enqueue("A1", async move {
                    tokio::time::sleep(Duration::from_millis(10 - n)).await;
                    trace.push("A1", &n.to_string());
                })
                .unwrap(),
        );
    }
    for result in join_all(completions).await {
        result.unwrap();
    }

    let expected: Vec<String> = (0..10).map(|n: u64| n.to_string()).collect();
    assert_eq!(trace.labels_for("A1"), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a1_a1_b2_lets_b2_finish_first() {
    let mailbox = mailbox(4, 10, 100);
    let trace = Trace::default();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let first = {
        let trace = trace.clone();
        mailbox
            .enqueue("A1", async move {
                let _ = release_rx.await;
                trace.push("A1", "A1#1");
            })
            .unwrap()
    };
    let second = {
        let trace = trace.clone();
        mailbox
            .enqueue("A1", async move { trace.push("A1", "A1#2") })
            .unwrap()
    };
    let other = {
        let trace = trace.clone();
        mailbox
            .enqueue("B2", async move { trace.push("B2", "B2#1") })
            .unwrap()
    };

    other.await.unwrap();
    assert_eq!(trace.labels(), vec!["B2#1"]);

    release_tx.send(()).unwrap();
    first.await.unwrap();
    second.await.unwrap();
    assert_eq!(trace.labels(), vec!["B2#1", "A1#1", "A1#2"]);
}

#[tokio::test]
async fn key_is_reusable_after_retirement() {
    let mailbox = mailbox(2, 1, 100);
    let trace = Trace::default();

    for round in 0..3 {
        let trace = trace.clone();
        mailbox
            .enqueue("A1", async move { trace.push("A1", &format!("round-{round}")) })
            .unwrap()
            .await
            .unwrap();
        mailbox.wait_idle().await;
    }

    assert_eq!(trace.labels_for("A1"), vec!["round-0", "round-1", "round-2"]);
}

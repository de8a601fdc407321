use courier::scheduler::{SchedulerSettings, TaskRegistry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn registry() -> Arc<TaskRegistry> {
    Arc::new(TaskRegistry::new(SchedulerSettings {
        task_delay: Duration::from_millis(20),
        max_task_duration: Duration::from_secs(60),
        shutdown_grace: Duration::from_secs(2),
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_never_exceeds_capacity() {
    let registry = registry();
    registry.register("pacs.Send", 2);

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    for _ in 0..6 {
        let running = running.clone();
        let peak = peak.clone();
        let finished = finished.clone();
        let started = registry
            .start(
                registry.new_task_id(),
                "pacs.Send",
                "upload",
                false,
                move |_token| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await;
        assert!(started);
        assert!(registry.in_use("pacs.Send") <= 2);
    }

    tokio::time::timeout(Duration::from_secs(2), async {
        while finished.load(Ordering::SeqCst) < 6 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("jobs did not finish");

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert!(registry.stop_all(true).await);
    assert!(registry.is_cancelled());
}

#[tokio::test]
async fn test_shutdown_refuses_new_tasks() {
    let registry = registry();
    assert!(registry.stop_all(true).await);

    let started = registry
        .start(registry.new_task_id(), "pacs.Send", "late", false, |_token| async {
            Ok(())
        })
        .await;
    assert!(!started);
}

//! Ordering and lifecycle tests for the priority executors.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use kv_cache_offload::executor::{AsyncPqExecutor, AsyncPqThreadPoolExecutor, JobError};

#[tokio::test]
async fn test_async_executor_priority_order() {
    let exec = AsyncPqExecutor::new(1);
    let order = Arc::new(Mutex::new(Vec::new()));

    // Occupy the only worker until every job below is queued.
    let (release, gate) = oneshot::channel::<()>();
    let gate_job = exec.submit(
        async move {
            let _ = gate.await;
            Ok(())
        },
        -1,
    );

    let mut handles = Vec::new();
    for (label, priority) in [("2", 2), ("1a", 1), ("1b", 1), ("0", 0)] {
        let order = order.clone();
        handles.push(exec.submit(
            async move {
                order.lock().push(label);
                Ok(())
            },
            priority,
        ));
    }
    assert_eq!(exec.pending(), 5);

    release.send(()).unwrap();
    gate_job.await.unwrap();
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(*order.lock(), vec!["0", "1a", "1b", "2"]);
    exec.shutdown(true).await;
}

#[tokio::test]
async fn test_blocking_executor_priority_order() {
    let exec = AsyncPqThreadPoolExecutor::new(1);
    let order = Arc::new(Mutex::new(Vec::new()));

    let (release, gate) = std::sync::mpsc::channel::<()>();
    let gate_job = exec.submit(
        move || {
            let _ = gate.recv();
            Ok(())
        },
        -1,
    );

    let mut handles = Vec::new();
    for (label, priority) in [("2", 2), ("1a", 1), ("1b", 1), ("0", 0)] {
        let order = order.clone();
        handles.push(exec.submit(
            move || {
                order.lock().push(label);
                Ok(())
            },
            priority,
        ));
    }

    release.send(()).unwrap();
    gate_job.await.unwrap();
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(*order.lock(), vec!["0", "1a", "1b", "2"]);
    exec.shutdown(true).await;
}

#[tokio::test]
async fn test_shutdown_waits_for_queued_jobs() {
    let exec = AsyncPqExecutor::new(2);
    let done = Arc::new(Mutex::new(0));

    for _ in 0..10 {
        let done = done.clone();
        let _ = exec.submit(
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                *done.lock() += 1;
                Ok(())
            },
            0,
        );
    }

    exec.shutdown(true).await;
    assert_eq!(*done.lock(), 10);
    assert_eq!(exec.pending(), 0);
    assert!(matches!(
        exec.submit(async { Ok(()) }, 0).await,
        Err(JobError::Closed)
    ));
}

#[tokio::test]
async fn test_failures_are_isolated() {
    let exec = AsyncPqThreadPoolExecutor::new(2);
    let bad = exec.submit(|| -> anyhow::Result<u32> { anyhow::bail!("write failed") }, 0);
    let good = exec.submit(|| Ok(42u32), 0);

    match bad.await {
        Err(JobError::Failed(e)) => assert_eq!(e.to_string(), "write failed"),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(good.await.unwrap(), 42);
    exec.shutdown(true).await;
}

#[tokio::test]
async fn test_many_workers_run_concurrently() {
    let exec = AsyncPqExecutor::new(4);
    let barrier = Arc::new(tokio::sync::Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let barrier = barrier.clone();
            exec.submit(
                async move {
                    barrier.wait().await;
                    Ok(())
                },
                0,
            )
        })
        .collect();

    let all = futures::future::join_all(handles);
    let results = tokio::time::timeout(Duration::from_secs(5), all)
        .await
        .expect("jobs deadlocked on a single worker");
    assert!(results.iter().all(Result::is_ok));
    exec.shutdown(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_submit_racing_shutdown_never_strands_jobs() {
    let exec = Arc::new(AsyncPqExecutor::new(2));
    let ran = Arc::new(Mutex::new(0usize));

    let submitters: Vec<_> = (0..4)
        .map(|_| {
            let exec = exec.clone();
            let ran = ran.clone();
            tokio::spawn(async move {
                let mut handles = Vec::new();
                for i in 0..200 {
                    let ran = ran.clone();
                    handles.push(exec.submit(
                        async move {
                            *ran.lock() += 1;
                            Ok(())
                        },
                        i % 3,
                    ));
                    if i % 16 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                handles
            })
        })
        .collect();

    tokio::task::yield_now().await;
    tokio::time::timeout(Duration::from_secs(5), exec.shutdown(true))
        .await
        .expect("shutdown hung on a job queued behind the sentinels");

    let mut accepted = 0;
    for submitter in submitters {
        let handles = submitter.await.unwrap();
        let results = tokio::time::timeout(Duration::from_secs(5), futures::future::join_all(handles))
            .await
            .expect("a job handle never resolved");
        for result in results {
            match result {
                Ok(()) => accepted += 1,
                Err(JobError::Closed) => {}
                Err(e) => panic!("unexpected: {e:?}"),
            }
        }
    }
    assert_eq!(*ran.lock(), accepted);
    assert_eq!(exec.pending(), 0);
}

use parpipe::pool::stats::RunStats;
use parpipe::{
    ChunkCodec, Coordinator, ErrorBoard, FetchMode, OrderedStore, PoolConfig, PoolError,
    ResultSink, Task, TaskQueue, Worker, WorkerExit, MAX_WAIT_TIMEOUT,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn config(workers: i64) -> PoolConfig {
    PoolConfig::builder()
        .workers(workers)
        .helper_poll_timeout(Duration::from_millis(5))
        .max_wait_timeout(Duration::from_millis(500))
        .build()
        .unwrap()
}

fn jitter() {
    thread::sleep(Duration::from_micros(fastrand::u64(0..400)));
}

#[test]
fn ordered_results_follow_positions_not_completion() {
    let coordinator = Coordinator::new(config(4)).unwrap();
    let payloads: Vec<String> = (0..300).map(|i| format!("doc-{}", i)).collect();

    let (results, _) = coordinator
        .run_ordered(payloads.clone(), |_: &u64, doc: String| -> anyhow::Result<String> {
            jitter();
            Ok(doc.to_uppercase())
        })
        .unwrap();

    let expected: Vec<String> = payloads.iter().map(|d| d.to_uppercase()).collect();
    assert_eq!(results, expected);
}

#[test]
fn every_task_is_processed_exactly_once() {
    let total = 500;
    let seen: Arc<Vec<AtomicU32>> = Arc::new((0..total).map(|_| AtomicU32::new(0)).collect());
    let counter = Arc::clone(&seen);

    let coordinator = Coordinator::new(config(6)).unwrap();
    let (results, report) = coordinator
        .run_ordered((0..total as u32).collect(), move |position: &u64, x: u32| -> anyhow::Result<u32> {
            counter[*position as usize].fetch_add(1, Ordering::SeqCst);
            if x % 50 == 0 {
                jitter();
            }
            Ok(x)
        })
        .unwrap();

    assert_eq!(results.len(), total);
    assert!(seen.iter().all(|count| count.load(Ordering::SeqCst) == 1));
    assert_eq!(report.processed, total as u64);
    assert_eq!(report.per_worker.values().sum::<u64>(), total as u64);
    assert_eq!(report.participants, 6);
}

#[test]
fn failing_task_aborts_the_run_quickly() {
    let coordinator = Coordinator::new(config(4)).unwrap();
    let start = Instant::now();

    let err = coordinator
        .run_ordered((0..200u32).collect(), |position: &u64, x: u32| -> anyhow::Result<u32> {
            if *position == 37 {
                anyhow::bail!("cannot classify document {}", x);
            }
            thread::sleep(Duration::from_millis(2));
            Ok(x)
        })
        .unwrap_err();

    assert!(start.elapsed() < MAX_WAIT_TIMEOUT);
    match err {
        PoolError::WorkerExecution { task, source, .. } => {
            assert_eq!(task, "37");
            assert_eq!(source.to_string(), "cannot classify document 37");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn panicking_task_aborts_the_run() {
    let coordinator = Coordinator::new(config(3)).unwrap();
    let err = coordinator
        .run_ordered((0..50u32).collect(), |_: &u64, x: u32| -> anyhow::Result<u32> {
            if x == 20 {
                panic!("index out of range");
            }
            Ok(x)
        })
        .unwrap_err();
    assert!(matches!(err, PoolError::WorkerPanicked { .. }));
}

#[test]
fn siblings_observe_the_shared_board() {
    let board = ErrorBoard::new();
    let watched = board.clone();
    let coordinator = Coordinator::new(config(3)).unwrap().with_board(board.clone());
    let start = Instant::now();

    let err = coordinator
        .run_ordered((0..3u32).collect(), move |position: &u64, x: u32| -> anyhow::Result<u32> {
            if *position == 0 {
                thread::sleep(Duration::from_millis(20));
                anyhow::bail!("first task failed");
            }
            // long-running work that gives up once a sibling fails
            while !watched.is_raised() && start.elapsed() < Duration::from_secs(5) {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(x)
        })
        .unwrap_err();

    assert!(board.is_raised());
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(matches!(err, PoolError::WorkerExecution { .. }));
}

#[test]
fn helper_and_workers_never_write_a_key_twice() {
    let coordinator = Coordinator::new(config(4)).unwrap();
    let tasks: Vec<(String, u32)> = (0..200).map(|i| (format!("clf-{}", i), i)).collect();

    let (store, report) = coordinator
        .run_keyed(tasks, |_: &String, x: u32| -> anyhow::Result<u32> {
            jitter();
            Ok(x * 2)
        })
        .unwrap();

    assert_eq!(store.len(), 200);
    assert_eq!(report.processed, 200);
    assert!(report.processed_by("helper") <= 200);
    assert_eq!(store.get(&"clf-42".to_string()).unwrap(), Some(84));
}

#[test]
fn second_write_to_a_key_is_rejected() {
    let coordinator = Coordinator::new(config(2)).unwrap();
    let tasks = vec![("same".to_string(), 1u32), ("same".to_string(), 2u32)];
    let err = coordinator
        .run_keyed(tasks, |_: &String, x: u32| -> anyhow::Result<u32> { Ok(x) })
        .unwrap_err();
    assert!(matches!(err, PoolError::DuplicateEntry { .. }));
}

#[test]
fn oversized_results_travel_in_chunks() {
    let config = PoolConfig::builder()
        .workers(3)
        .max_part_size(256)
        .helper_poll_timeout(Duration::from_millis(5))
        .build()
        .unwrap();
    let coordinator = Coordinator::new(config).unwrap();

    let (results, _) = coordinator
        .run_ordered((0..12u64).collect(), |_: &u64, n: u64| -> anyhow::Result<Vec<u64>> {
            Ok((0..n * 20).collect())
        })
        .unwrap();

    for (n, values) in results.iter().enumerate() {
        assert_eq!(values.len(), n * 20);
    }
}

#[test]
fn fewer_sentinels_than_workers_leaves_one_blocked() {
    let queue: TaskQueue<Task<u64, u32>> = TaskQueue::new();
    let store: OrderedStore<u32> = OrderedStore::new(ChunkCodec::new(1024));
    let board = ErrorBoard::new();
    let stats = Arc::new(RunStats::new(3, 0));

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let sink: Arc<dyn ResultSink<u64, u32>> = Arc::new(store.clone());
            let mut worker = Worker::new(
                format!("parpipe-worker-{}", i),
                queue.clone(),
                sink,
                Arc::new(|_: &u64, x: u32| -> anyhow::Result<u32> { Ok(x) }),
                board.clone(),
                Arc::clone(&stats),
            );
            thread::spawn(move || worker.run(FetchMode::Blocking))
        })
        .collect();

    queue.push_sentinels(2).unwrap();
    thread::sleep(Duration::from_millis(100));
    let finished = handles.iter().filter(|h| h.is_finished()).count();
    assert_eq!(finished, 2);

    queue.push_sentinels(1).unwrap();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), WorkerExit::Stopped);
    }
}

use super::*;
use std::sync::mpsc;

fn config(core: usize, max: usize) -> PoolConfig {
    PoolConfig {
        name: String::from("test"),
        core_threads: core,
        max_threads: max,
        primary_capacity: 4,
        keep_alive_ms: 200,
        backlog_escalate_size: 40,
        backlog_escalate_wait_ms: 1_500,
        backlog_warn_interval_ms: 2_500,
        shutdown_timeout_ms: 2_000,
    }
}

fn wait_for(pool: &QueueingPool, completed: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while pool.stats().completed < completed {
        assert!(Instant::now() < deadline, "pool did not complete {completed} tasks in time");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Occupies one pool thread until the returned sender is used or dropped.
fn block_one_thread(pool: &QueueingPool) -> mpsc::Sender<()> {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    pool.submit("blocker", move || {
        let _ = started_tx.send(());
        let _ = release_rx.recv();
    })
    .expect("submit blocker");
    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("blocker did not start");
    release_tx
}

#[test]
fn test_overload_is_absorbed_in_submission_order() {
    let pool = QueueingPool::new(config(1, 1));
    let release = block_one_thread(&pool);

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..30 {
        let order = order.clone();
        pool.submit(format!("task {i}"), move || order.lock().push(i))
            .expect("a running pool never rejects work");
    }

    let stats = pool.stats();
    assert_eq!(stats.primary_queued, 4);
    assert_eq!(stats.overflow_queued, 26);
    assert_eq!(stats.overflowed, 26);

    drop(release);
    wait_for(&pool, 31);

    let order = order.lock().clone();
    assert_eq!(order, (0..30).collect::<Vec<_>>());
    assert_eq!(pool.stats().overflow_queued, 0);
    pool.shutdown();
}

#[test]
fn test_grows_to_max_before_overflowing() {
    let pool = QueueingPool::new(config(1, 3));
    let mut releases = vec![block_one_thread(&pool)];

    // Fill the primary queue, then the next submissions start new threads.
    let (done_tx, done_rx) = mpsc::channel();
    for _ in 0..4 {
        let done_tx = done_tx.clone();
        pool.submit("queued", move || {
            let _ = done_tx.send(());
        })
        .expect("submit");
    }
    assert_eq!(pool.stats().threads, 1);

    releases.push(block_one_thread(&pool));
    assert_eq!(pool.stats().threads, 2);

    drop(releases);
    for _ in 0..4 {
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("queued task did not run");
    }
    pool.shutdown();
}

#[test]
fn test_thread_ids_are_reused_after_retirement() {
    let pool = QueueingPool::new(config(1, 2));
    let first = block_one_thread(&pool);
    for _ in 0..4 {
        pool.submit("filler", || thread::sleep(Duration::from_millis(20)))
            .expect("submit");
    }
    // Primary is full, so this one starts thread 2.
    let second = block_one_thread(&pool);
    let names: Vec<String> = pool.stats().workers.into_iter().map(|w| w.name).collect();
    assert_eq!(names, vec!["test-1", "test-2"]);

    drop(first);
    drop(second);
    wait_for(&pool, 6);

    // Thread 2 retires after the keep-alive; the next extra thread is 2 again.
    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.stats().threads > 1 {
        assert!(Instant::now() < deadline, "extra thread did not retire");
        thread::sleep(Duration::from_millis(20));
    }

    let a = block_one_thread(&pool);
    for _ in 0..4 {
        pool.submit("filler", || {}).expect("submit");
    }
    let b = block_one_thread(&pool);
    let names: Vec<String> = pool.stats().workers.into_iter().map(|w| w.name).collect();
    assert_eq!(names, vec!["test-1", "test-2"]);

    drop(a);
    drop(b);
    pool.shutdown();
}

#[test]
fn test_backlog_escalates_once() {
    let mut cfg = config(1, 1);
    cfg.backlog_escalate_size = 3;
    cfg.backlog_escalate_wait_ms = 0;
    let pool = QueueingPool::new(cfg);
    let release = block_one_thread(&pool);

    for _ in 0..4 {
        pool.submit("primary", || {}).expect("submit");
    }
    for _ in 0..12 {
        pool.submit("overflow", || {}).expect("submit");
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(pool.stats().escalations, 1);

    drop(release);
    wait_for(&pool, 17);
    assert_eq!(pool.stats().escalations, 1);
    pool.shutdown();
}

#[test]
fn test_panicking_task_does_not_kill_thread() {
    let pool = QueueingPool::new(config(1, 1));
    pool.submit("boom", || panic!("routing handler exploded"))
        .expect("submit");

    let (tx, rx) = mpsc::channel();
    pool.submit("after", move || {
        let _ = tx.send(current_status().map(|s| s.name().to_string()));
    })
    .expect("submit");

    let name = rx.recv_timeout(Duration::from_secs(5)).expect("second task ran");
    assert_eq!(name.as_deref(), Some("test-1"));
    assert_eq!(pool.stats().panicked, 1);
    assert_eq!(pool.stats().threads, 1);
    pool.shutdown();
}

#[test]
fn test_attached_status_sees_running_state() {
    struct StatusCheck {
        status: Option<Arc<WorkerStatus>>,
        tx: mpsc::Sender<bool>,
    }

    impl PoolTask for StatusCheck {
        fn run(self: Box<Self>) {
            let running = self
                .status
                .as_ref()
                .map(|s| s.state() == crate::worker::ExecutionState::Running)
                .unwrap_or(false);
            let _ = self.tx.send(running);
        }

        fn attach_status(&mut self, status: Arc<WorkerStatus>) {
            self.status = Some(status);
        }

        fn describe(&self) -> String {
            String::from("liveness check")
        }
    }

    let pool = QueueingPool::new(config(1, 1));
    let (tx, rx) = mpsc::channel();
    pool.submit_task(Box::new(StatusCheck { status: None, tx }))
        .expect("submit");
    assert!(rx.recv_timeout(Duration::from_secs(5)).expect("check ran"));
    pool.shutdown();
}

#[test]
fn test_shutdown_drains_then_rejects() {
    let pool = QueueingPool::new(config(1, 1));
    let counter = Arc::new(AtomicU64::new(0));
    for _ in 0..10 {
        let counter = counter.clone();
        pool.submit("count", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("submit");
    }
    pool.shutdown();
    assert_eq!(counter.load(Ordering::SeqCst), 10);
    assert!(matches!(pool.submit("late", || {}), Err(PoolError::ShutDown(_))));
}

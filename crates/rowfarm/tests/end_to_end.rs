//! Master and workers talking over real TCP sockets on localhost.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rowfarm::bridge::codec::FrameError;
use rowfarm::{
    ComputeError, Dispatcher, FailureKind, MasterConfig, Matrix, Roster, RowProduct, RowStatus,
    Task, TaskHandler, TaskResult, WorkerAddr, WorkerConfig, WorkerService,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct TestWorker {
    addr: WorkerAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestWorker {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        self.handle.await.unwrap();
    }
}

async fn spawn_worker<H: TaskHandler>(handler: H) -> TestWorker {
    spawn_worker_with(handler, 1).await
}

async fn spawn_worker_with<H: TaskHandler>(handler: H, max_connections: usize) -> TestWorker {
    let config = WorkerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        max_connections,
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
        ..WorkerConfig::default()
    };
    let service = WorkerService::bind_with_handler(config, handler)
        .await
        .unwrap();
    let addr = WorkerAddr::from(service.local_addr().unwrap());
    let (shutdown, rx) = oneshot::channel();
    let handle = tokio::spawn(service.run_until(async {
        let _ = rx.await;
    }));
    TestWorker {
        addr,
        shutdown,
        handle,
    }
}

async fn refusing_addr() -> WorkerAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    WorkerAddr::from(addr)
}

fn master_config() -> MasterConfig {
    MasterConfig {
        connect_timeout: Duration::from_secs(2),
        io_timeout: Duration::from_secs(5),
        ..MasterConfig::default()
    }
}

fn dispatcher(workers: Vec<WorkerAddr>) -> Dispatcher {
    Dispatcher::new(Roster::new(workers).unwrap(), master_config())
}

fn a_2x2() -> Matrix {
    Matrix::from_rows(&[[1.0, 2.0], [3.0, 4.0]]).unwrap()
}

fn b_2x2() -> Matrix {
    Matrix::from_rows(&[[5.0, 6.0], [7.0, 8.0]]).unwrap()
}

/// Echoes an index shifted by one.
struct OffByOne;

impl TaskHandler for OffByOne {
    fn handle(&self, task: Task) -> Result<TaskResult, ComputeError> {
        let result = RowProduct.handle(task)?;
        Ok(TaskResult::new(result.index + 1, result.row))
    }
}

/// Always fails to compute.
struct Broken;

impl TaskHandler for Broken {
    fn handle(&self, task: Task) -> Result<TaskResult, ComputeError> {
        Err(ComputeError::DimensionMismatch {
            left_rows: 1,
            left_cols: task.row.len(),
            right_rows: 0,
            right_cols: 0,
        })
    }
}

/// Computes normally and records which rows it served.
struct Recording(Arc<Mutex<Vec<usize>>>);

impl TaskHandler for Recording {
    fn handle(&self, task: Task) -> Result<TaskResult, ComputeError> {
        self.0.lock().unwrap().push(task.index);
        RowProduct.handle(task)
    }
}

#[tokio::test]
async fn two_by_two_product() {
    let worker = spawn_worker(RowProduct).await;

    let assembly = dispatcher(vec![worker.addr.clone()])
        .run(&a_2x2(), &b_2x2())
        .await
        .unwrap();

    assert_eq!(
        assembly.matrix,
        Matrix::from_rows(&[[19.0, 22.0], [43.0, 50.0]]).unwrap()
    );
    assert!(assembly.report.is_complete());
    assert!(assembly.report.failed_rows().is_empty());
    worker.stop().await;
}

#[tokio::test]
async fn refused_connections_give_zero_matrix() {
    let assembly = dispatcher(vec![refusing_addr().await])
        .run(&a_2x2(), &b_2x2())
        .await
        .unwrap();

    assert_eq!(assembly.matrix, Matrix::new(2, 2));
    assert_eq!(assembly.report.failed_rows(), vec![0, 1]);
}

#[tokio::test]
async fn dead_worker_rows_are_zero_filled() {
    let live = spawn_worker(RowProduct).await;
    let dead = refusing_addr().await;

    let a = Matrix::random(4, 4, &mut StdRng::seed_from_u64(1));
    let b = Matrix::random(4, 4, &mut StdRng::seed_from_u64(2));
    let expected = a.multiply(&b).unwrap();

    let assembly = dispatcher(vec![live.addr.clone(), dead])
        .run(&a, &b)
        .await
        .unwrap();

    assert_eq!(assembly.report.failed_rows(), vec![1, 3]);
    assert_eq!(assembly.matrix.row(0), expected.row(0));
    assert_eq!(assembly.matrix.row(1), Some(&[0.0; 4][..]));
    assert_eq!(assembly.matrix.row(2), expected.row(2));
    assert_eq!(assembly.matrix.row(3), Some(&[0.0; 4][..]));
    live.stop().await;
}

#[tokio::test]
async fn rows_go_round_robin() {
    let logs: Vec<Arc<Mutex<Vec<usize>>>> = (0..3).map(|_| Arc::default()).collect();
    let mut workers = Vec::new();
    for log in &logs {
        workers.push(spawn_worker(Recording(Arc::clone(log))).await);
    }

    let n = 7;
    let a = Matrix::random(n, n, &mut StdRng::seed_from_u64(3));
    let b = Matrix::random(n, n, &mut StdRng::seed_from_u64(4));
    let assembly = dispatcher(workers.iter().map(|w| w.addr.clone()).collect())
        .run(&a, &b)
        .await
        .unwrap();

    assert!(assembly.report.is_complete());
    for (k, log) in logs.iter().enumerate() {
        let served = log.lock().unwrap().clone();
        let expected: Vec<usize> = (0..n).filter(|r| r % 3 == k).collect();
        assert_eq!(served, expected, "worker {k}");
    }
    for worker in workers {
        worker.stop().await;
    }
}

#[tokio::test]
async fn repeated_dispatch_is_deterministic() {
    let worker = spawn_worker_with(RowProduct, 4).await;
    let a = Matrix::random(8, 8, &mut StdRng::seed_from_u64(5));
    let b = Matrix::random(8, 8, &mut StdRng::seed_from_u64(6));
    let d = dispatcher(vec![worker.addr.clone()]);

    let first = d.run(&a, &b).await.unwrap();
    let second = d.run(&a, &b).await.unwrap();

    assert_eq!(first.matrix, second.matrix);
    assert_eq!(first.matrix, a.multiply(&b).unwrap());
    assert_eq!(first.report, second.report);
    worker.stop().await;
}

#[tokio::test]
async fn mismatched_index_is_a_protocol_violation() {
    let worker = spawn_worker(OffByOne).await;

    let table = dispatcher(vec![worker.addr.clone()])
        .dispatch(&a_2x2(), &b_2x2())
        .await
        .unwrap();

    assert_eq!(table.filled(), 0);
    assert!(table.failures().iter().all(|f| matches!(
        f.kind,
        FailureKind::IndexMismatch { sent, returned } if returned == sent + 1
    )));
    worker.stop().await;
}

#[tokio::test]
async fn trusting_master_stores_echoed_index() {
    let worker = spawn_worker(OffByOne).await;
    let d = Dispatcher::new(
        Roster::new(vec![worker.addr.clone()]).unwrap(),
        MasterConfig {
            verify_index: false,
            ..master_config()
        },
    );
    let a = Matrix::from_rows(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]).unwrap();
    let b = Matrix::from_rows(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]]).unwrap();

    let assembly = d.run(&a, &b).await.unwrap();

    // Row 0's result lands in slot 1, row 1's in slot 2; row 2's index 3 is out of range.
    assert_eq!(assembly.matrix.row(0), Some(&[0.0, 0.0, 0.0][..]));
    assert_eq!(assembly.matrix.row(1), Some(&[1.0, 2.0, 3.0][..]));
    assert_eq!(assembly.matrix.row(2), Some(&[4.0, 5.0, 6.0][..]));
    assert_eq!(assembly.report.failed_rows(), vec![0]);

    let rows = &assembly.report.rows;
    let here = Some(worker.addr.to_string());
    assert_eq!(rows[0].status, RowStatus::Failed);
    assert_eq!(rows[0].worker, here);
    assert_eq!(
        rows[0].error.as_deref(),
        Some("worker answered with index 1; result stored in that row")
    );
    assert_eq!(rows[1].source, Some(0));
    assert_eq!(rows[2].source, Some(1));
    assert_eq!(rows[2].worker, here);
    assert_eq!(
        rows[2].error.as_deref(),
        Some("result rejected: result index 3 outside table of 3 rows")
    );
    worker.stop().await;
}

#[tokio::test]
async fn compute_failure_reads_as_closed_connection() {
    let worker = spawn_worker(Broken).await;

    let table = dispatcher(vec![worker.addr.clone()])
        .dispatch(&a_2x2(), &b_2x2())
        .await
        .unwrap();

    assert_eq!(table.filled(), 0);
    for failure in table.failures() {
        assert!(
            matches!(
                failure.kind,
                FailureKind::Receive(FrameError::IncompleteHeader { received: 0 })
            ),
            "{failure}"
        );
    }

    // The service survives per-connection failures.
    let again = dispatcher(vec![worker.addr.clone()])
        .dispatch(&a_2x2(), &b_2x2())
        .await
        .unwrap();
    assert_eq!(again.failures().len(), 2);
    worker.stop().await;
}

//! Worker service - accepts tasks from the master over TCP.
//!
//! Each connection carries exactly one task:
//! accept -> read framed task -> compute -> write framed result -> close.
//!
//! A connection that fails at any step is closed without a response; the
//! master observes that as a receive failure. Only binding the listener can
//! fail the service as a whole.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::bridge::codec::{FrameError, read_frame, write_frame};
use crate::bridge::protocol::{DecodeError, EncodeError, Task, TaskResult};
use crate::config::{ConfigError, WorkerConfig};
use crate::matrix::{ComputeError, row_times_matrix};

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Computes the result for one task. Implementations must be stateless across calls.
pub trait TaskHandler: Send + Sync + 'static {
    fn handle(&self, task: Task) -> Result<TaskResult, ComputeError>;
}

/// Default handler: `row * matrix`, echoing the task index.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowProduct;

impl TaskHandler for RowProduct {
    fn handle(&self, task: Task) -> Result<TaskResult, ComputeError> {
        let row = row_times_matrix(&task.row, &task.matrix)?;
        Ok(TaskResult::new(task.index, row))
    }
}

/// Fatal worker errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("invalid worker configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Per-connection errors. The connection is dropped; the service keeps running.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("timed out reading task")]
    ReadTimeout,

    #[error("failed to read task: {0}")]
    Read(#[source] FrameError),

    #[error("malformed task: {0}")]
    Decode(#[from] DecodeError),

    #[error("compute failed: {0}")]
    Compute(#[from] ComputeError),

    #[error("failed to encode result: {0}")]
    Encode(#[from] EncodeError),

    #[error("timed out writing result")]
    WriteTimeout,

    #[error("failed to write result: {0}")]
    Write(#[source] FrameError),
}

/// TCP listener serving one task per connection.
pub struct WorkerService<H = RowProduct> {
    listener: TcpListener,
    config: Arc<WorkerConfig>,
    handler: Arc<H>,
    limiter: Arc<Semaphore>,
    permits: u32,
}

impl WorkerService<RowProduct> {
    pub async fn bind(config: WorkerConfig) -> Result<Self, WorkerError> {
        Self::bind_with_handler(config, RowProduct).await
    }
}

impl<H: TaskHandler> WorkerService<H> {
    pub async fn bind_with_handler(config: WorkerConfig, handler: H) -> Result<Self, WorkerError> {
        config.validate()?;
        let permits =
            u32::try_from(config.max_connections).map_err(|_| ConfigError::TooManyConnections {
                value: config.max_connections,
                max: crate::config::MAX_CONNECTIONS,
            })?;

        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| WorkerError::Bind {
                addr: addr.clone(),
                source,
            })?;

        let local = listener.local_addr().ok();
        tracing::info!(
            addr = ?local,
            max_connections = config.max_connections,
            version = crate::ROWFARM_VERSION,
            "Worker listening"
        );

        let limiter = Arc::new(Semaphore::new(permits as usize));
        Ok(Self {
            listener,
            config: Arc::new(config),
            handler: Arc::new(handler),
            limiter,
            permits,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the process is terminated.
    pub async fn run(self) {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then wait for in-flight connections.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            // Hold a permit before accepting so in-flight work stays bounded.
            let permit = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                permit = Arc::clone(&self.limiter).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let handler = Arc::clone(&self.handler);
            let config = Arc::clone(&self.config);
            tokio::spawn(async move {
                let _permit = permit;
                tracing::trace!(%peer, "Serving connection");
                match serve_connection(stream, handler.as_ref(), &config).await {
                    Ok(index) => tracing::debug!(%peer, row = index, "Task served"),
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "Dropped connection without response")
                    }
                }
            });
        }

        tracing::info!("Worker shutting down, draining connections");
        let _ = self.limiter.acquire_many(self.permits).await;
        tracing::info!("Worker stopped");
    }
}

/// Serve exactly one task on `stream`, returning the served row index.
///
/// Nothing is written unless a complete result is ready.
pub async fn serve_connection<S, H>(
    mut stream: S,
    handler: &H,
    config: &WorkerConfig,
) -> Result<usize, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: TaskHandler + ?Sized,
{
    let frame = timeout(config.read_timeout, read_frame(&mut stream, config.max_frame_len))
        .await
        .map_err(|_| ConnectionError::ReadTimeout)?
        .map_err(ConnectionError::Read)?;

    let task = Task::decode(&frame)?;
    let index = task.index;
    tracing::trace!(row = index, width = task.row.len(), "Task received");

    let result = handler.handle(task)?;
    let payload = result.encode()?;

    timeout(
        config.write_timeout,
        write_frame(&mut stream, payload, config.max_frame_len),
    )
    .await
    .map_err(|_| ConnectionError::WriteTimeout)?
    .map_err(ConnectionError::Write)?;

    let _ = stream.shutdown().await;
    Ok(index)
}

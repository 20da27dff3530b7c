//! Master-side dispatch loop.
//!
//! Flow, per row in increasing order:
//! 1. Pick the worker with `Roster::assign`
//! 2. Connect, send one framed task, receive one framed result, close
//! 3. Record the result, or record the failure and move on
//!
//! Exactly one request is outstanding at a time. Failed rows are never retried;
//! the assembler later fills them with zeros.

use std::fmt;
use std::io;
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::assembler::{Assembly, RecordError, ResultTable};
use crate::bridge::codec::{FrameError, read_frame, write_frame};
use crate::bridge::protocol::{DecodeError, EncodeError, Task, TaskResult};
use crate::config::MasterConfig;
use crate::matrix::Matrix;
use crate::roster::{Roster, WorkerAddr};

/// Input shapes that cannot be dispatched. Raised before any network I/O.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("matrix B must be square, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },

    #[error("matrix A is {rows}x{cols}, expected {expected}x{expected}")]
    ShapeMismatch {
        rows: usize,
        cols: usize,
        expected: usize,
    },
}

/// Network phase in which a timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Send,
    Receive,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Connect => "connect",
            Stage::Send => "send",
            Stage::Receive => "receive",
        })
    }
}

/// Why a row ended up without a result.
#[derive(Debug, thiserror::Error)]
pub enum FailureKind {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("timed out during {stage}")]
    Timeout { stage: Stage },

    #[error("failed to send task: {0}")]
    Send(#[source] FrameError),

    #[error("failed to receive result: {0}")]
    Receive(#[source] FrameError),

    #[error("failed to encode task: {0}")]
    Encode(#[from] EncodeError),

    #[error("malformed result: {0}")]
    Decode(#[from] DecodeError),

    #[error("worker answered row {sent} with index {returned}")]
    IndexMismatch { sent: usize, returned: usize },

    /// Result accepted under a different index; this row's own slot stays empty.
    #[error("worker answered with index {returned}; result stored in that row")]
    Displaced { returned: usize },

    #[error("result rejected: {0}")]
    Rejected(#[from] RecordError),

    #[error("dispatch cancelled")]
    Cancelled,
}

/// Diagnostic for one failed row.
#[derive(Debug)]
pub struct RowFailure {
    pub row: usize,
    pub worker: WorkerAddr,
    pub kind: FailureKind,
}

impl RowFailure {
    pub fn new(row: usize, worker: WorkerAddr, kind: FailureKind) -> Self {
        Self { row, worker, kind }
    }
}

impl fmt::Display for RowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {} on {}: {}", self.row, self.worker, self.kind)
    }
}

/// Sends each row of A to a worker and collects the results.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    roster: Roster,
    config: MasterConfig,
}

impl Dispatcher {
    pub fn new(roster: Roster, config: MasterConfig) -> Self {
        Self { roster, config }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Dispatch every row, then assemble the output matrix and report.
    pub async fn run(&self, a: &Matrix, b: &Matrix) -> Result<Assembly, DispatchError> {
        Ok(self.dispatch(a, b).await?.assemble())
    }

    pub async fn dispatch(&self, a: &Matrix, b: &Matrix) -> Result<ResultTable, DispatchError> {
        self.dispatch_with_cancel(a, b, &CancellationToken::new())
            .await
    }

    /// Dispatch every row of `a`, stopping early if `cancel` fires.
    ///
    /// On cancellation the in-flight row and all remaining rows are recorded as
    /// failed, so the returned table is always complete.
    pub async fn dispatch_with_cancel(
        &self,
        a: &Matrix,
        b: &Matrix,
        cancel: &CancellationToken,
    ) -> Result<ResultTable, DispatchError> {
        let n = check_shapes(a, b)?;
        let mut table = ResultTable::new(n);
        let started = Instant::now();

        tracing::info!(rows = n, workers = self.roster.len(), "Starting dispatch");

        for (row, values) in a.iter_rows().enumerate() {
            let worker = self.roster.assign(row);

            if cancel.is_cancelled() {
                table.record_failure(RowFailure::new(row, worker.clone(), FailureKind::Cancelled));
                continue;
            }

            let task = Task::new(row, values.to_vec(), b.clone());
            let row_started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(FailureKind::Cancelled),
                result = self.round_trip(worker, &task) => result,
            };

            match outcome.and_then(|result| self.accept(row, result, &mut table)) {
                Ok(slot) if slot == row => {
                    tracing::debug!(
                        row,
                        %worker,
                        elapsed_ms = row_started.elapsed().as_millis() as u64,
                        "Row completed"
                    );
                }
                Ok(slot) => {
                    tracing::warn!(row, %worker, slot, "Result stored under a different row");
                    table.record_failure(RowFailure::new(
                        row,
                        worker.clone(),
                        FailureKind::Displaced { returned: slot },
                    ));
                }
                Err(kind) => {
                    tracing::warn!(row, %worker, error = %kind, "Row failed");
                    table.record_failure(RowFailure::new(row, worker.clone(), kind));
                }
            }
        }

        tracing::info!(
            rows = n,
            completed = table.filled(),
            failed = n - table.filled(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Dispatch finished"
        );
        Ok(table)
    }

    /// Connect, send the framed task, wait for the framed result.
    async fn round_trip(&self, worker: &WorkerAddr, task: &Task) -> Result<TaskResult, FailureKind> {
        let payload = task.encode()?;
        let max = self.config.max_frame_len;

        tracing::trace!(row = task.index, %worker, bytes = payload.len(), "Connecting");
        let mut stream = timeout(self.config.connect_timeout, TcpStream::connect(worker.as_str()))
            .await
            .map_err(|_| FailureKind::Timeout {
                stage: Stage::Connect,
            })?
            .map_err(FailureKind::Connect)?;

        timeout(self.config.io_timeout, write_frame(&mut stream, payload, max))
            .await
            .map_err(|_| FailureKind::Timeout { stage: Stage::Send })?
            .map_err(FailureKind::Send)?;

        let frame = timeout(self.config.io_timeout, read_frame(&mut stream, max))
            .await
            .map_err(|_| FailureKind::Timeout {
                stage: Stage::Receive,
            })?
            .map_err(FailureKind::Receive)?;

        Ok(TaskResult::decode(&frame)?)
    }

    /// Place a result in the table according to the index policy, returning the slot filled.
    fn accept(
        &self,
        sent: usize,
        result: TaskResult,
        table: &mut ResultTable,
    ) -> Result<usize, FailureKind> {
        let slot = result.index;
        if slot != sent && self.config.verify_index {
            return Err(FailureKind::IndexMismatch {
                sent,
                returned: slot,
            });
        }
        table.record_from(sent, result)?;
        Ok(slot)
    }
}

/// A must be N×N with N taken from the square matrix B.
fn check_shapes(a: &Matrix, b: &Matrix) -> Result<usize, DispatchError> {
    if !b.is_square() {
        return Err(DispatchError::NotSquare {
            rows: b.rows(),
            cols: b.cols(),
        });
    }
    let n = b.rows();
    if a.rows() != n || a.cols() != n {
        return Err(DispatchError::ShapeMismatch {
            rows: a.rows(),
            cols: a.cols(),
            expected: n,
        });
    }
    Ok(n)
}

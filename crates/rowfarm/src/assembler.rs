//! Result table and reconstruction of the output matrix.

use serde::Serialize;

use crate::bridge::protocol::TaskResult;
use crate::dispatcher::RowFailure;
use crate::matrix::Matrix;

/// Why a result could not be stored in the table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("result index {index} outside table of {size} rows")]
    OutOfRange { index: usize, size: usize },

    #[error("result for row {index} already recorded")]
    Duplicate { index: usize },

    #[error("result row {index} has {found} values, expected {expected}")]
    WidthMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },
}

/// A filled slot and the row whose task produced it.
#[derive(Debug)]
struct Slot {
    values: Vec<f64>,
    source: usize,
}

/// Master-side table of per-row results.
///
/// Slots start absent and are filled at most once. Failures seen while
/// dispatching are kept alongside for the report, keyed by the row that was sent.
#[derive(Debug)]
pub struct ResultTable {
    slots: Vec<Option<Slot>>,
    width: usize,
    failures: Vec<RowFailure>,
}

impl ResultTable {
    /// Table for an N×N product.
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| None).collect(),
            width: size,
            failures: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn get(&self, index: usize) -> Option<&[f64]> {
        self.slots.get(index)?.as_ref().map(|s| s.values.as_slice())
    }

    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Row whose task filled slot `index`, if it is filled.
    pub fn source(&self, index: usize) -> Option<usize> {
        self.slots.get(index)?.as_ref().map(|s| s.source)
    }

    /// Store a result in the slot named by its own index.
    pub fn record(&mut self, result: TaskResult) -> Result<(), RecordError> {
        let source = result.index;
        self.record_from(source, result)
    }

    /// Store a result produced by the task sent for row `source`.
    ///
    /// The slot is still chosen by the result's own index.
    pub fn record_from(&mut self, source: usize, result: TaskResult) -> Result<(), RecordError> {
        let TaskResult { index, row } = result;
        let size = self.slots.len();
        let width = self.width;
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(RecordError::OutOfRange { index, size })?;
        if slot.is_some() {
            return Err(RecordError::Duplicate { index });
        }
        if row.len() != width {
            return Err(RecordError::WidthMismatch {
                index,
                expected: width,
                found: row.len(),
            });
        }
        *slot = Some(Slot { values: row, source });
        Ok(())
    }

    pub fn record_failure(&mut self, failure: RowFailure) {
        self.failures.push(failure);
    }

    pub fn failures(&self) -> &[RowFailure] {
        &self.failures
    }

    /// Stack rows in index order, substituting zeros for absent slots.
    ///
    /// Each row's report carries the last dispatch failure for that row, even
    /// when its slot was filled by another row's result.
    pub fn assemble(&self) -> Assembly {
        let mut matrix = Matrix::new(self.slots.len(), self.width);
        let mut rows = Vec::with_capacity(self.slots.len());

        for (index, slot) in self.slots.iter().enumerate() {
            let failure = self.failures.iter().rev().find(|f| f.row == index);
            let worker = failure.map(|f| f.worker.to_string());
            let report = match (slot, matrix.row_mut(index)) {
                (Some(slot), Some(out)) => {
                    out.copy_from_slice(&slot.values);
                    RowReport {
                        index,
                        status: RowStatus::Completed,
                        source: (slot.source != index).then_some(slot.source),
                        worker,
                        error: failure.map(|f| f.kind.to_string()),
                    }
                }
                _ => RowReport {
                    index,
                    status: RowStatus::Failed,
                    source: None,
                    worker,
                    error: Some(failure.map_or_else(
                        || "no result recorded".to_string(),
                        |f| f.kind.to_string(),
                    )),
                },
            };
            rows.push(report);
        }

        Assembly {
            matrix,
            report: DispatchReport {
                size: self.slots.len(),
                rows,
            },
        }
    }
}

/// Output matrix plus the per-row report.
#[derive(Debug, Clone)]
pub struct Assembly {
    pub matrix: Matrix,
    pub report: DispatchReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Completed,
    /// Row was filled with zeros.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowReport {
    pub index: usize,
    pub status: RowStatus,
    /// Sent row whose result filled this slot, when it is not this row.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<usize>,
    /// Worker and error of this row's own failed dispatch, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Diagnostic summary of one dispatch run. Not part of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub size: usize,
    pub rows: Vec<RowReport>,
}

impl DispatchReport {
    pub fn failed_rows(&self) -> Vec<usize> {
        self.rows
            .iter()
            .filter(|r| r.status == RowStatus::Failed)
            .map(|r| r.index)
            .collect()
    }

    pub fn completed(&self) -> usize {
        self.rows
            .iter()
            .filter(|r| r.status == RowStatus::Completed)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.completed() == self.size
    }
}

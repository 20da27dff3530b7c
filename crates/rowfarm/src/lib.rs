//! rowfarm: row-partitioned matrix multiplication over TCP workers.

pub mod assembler;
pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod matrix;
pub mod roster;
pub mod worker;

pub use assembler::{Assembly, DispatchReport, ResultTable, RowReport, RowStatus};
pub use bridge::codec::{FrameCodec, FrameError};
pub use bridge::protocol::{DecodeError, Task, TaskResult};
pub use config::{ConfigError, MasterConfig, WorkerConfig};
pub use dispatcher::{DispatchError, Dispatcher, FailureKind, RowFailure};
pub use matrix::{ComputeError, Matrix, row_times_matrix};
pub use roster::{Roster, WorkerAddr};
pub use worker::{RowProduct, TaskHandler, WorkerError, WorkerService};

/// rowfarm version from Cargo.toml
pub const ROWFARM_VERSION: &str = env!("CARGO_PKG_VERSION");

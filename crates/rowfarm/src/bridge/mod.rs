//! Wire layer between master and worker.
//!
//! # Architecture
//!
//! - **codec**: length-prefixed framing over AsyncRead/AsyncWrite
//! - **protocol**: binary Task / TaskResult payloads carried inside frames

pub mod codec;
pub mod protocol;

//! Wire layer for dispatcher-worker communication.
//!
//! Everything that touches bytes lives here; the rest of the crate deals in
//! typed requests and responses.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request/Response, ids, methods)
//! - **codec**: Content-Length framed JSON codec for AsyncRead/AsyncWrite
//! - **channel**: One worker connection with the request/reply discipline

pub mod channel;
pub mod codec;
pub mod protocol;

//! Wire layer for the stdio transport.
//!
//! - **codec**: newline-delimited JSON framing for AsyncRead/AsyncWrite
//! - **protocol**: request/response/notification types

pub mod codec;
pub mod protocol;

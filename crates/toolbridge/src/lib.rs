//! toolbridge: supervised connections to remote tool endpoints.
//!
//! Opens, multiplexes and tears down connections over two transports, a
//! child process speaking newline-delimited JSON and a server-sent event
//! subscription, and exposes both through one `invoke` contract on
//! [`BridgeSupervisor`].

pub mod bridge;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
mod supervisor;
pub mod telemetry;
pub mod transport;

pub use bridge::codec::{CodecError, Frame, FrameBuffer, JsonLinesCodec};
pub use bridge::protocol::{Inbound, RemoteError, RequestId};
pub use config::BridgeConfig;
pub use connection::{
    ConnectSpec, ConnectionId, ConnectionInfo, ConnectionState, EventStreamParams, StdioParams,
};
pub use correlator::{PendingCall, RequestCorrelator};
pub use error::{BridgeError, CallError, ErrorKind};
pub use supervisor::BridgeSupervisor;
pub use telemetry::init_tracing;
pub use transport::{PushMessage, Transport, TransportKind};

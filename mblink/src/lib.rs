//! A [Modbus](http://modbus.org/) link layer built on [Tokio](https://docs.rs/tokio)
//! and Rust's `async/await` syntax.
//!
//! The crate stops at the PDU boundary: it frames, transmits, correlates and
//! validates, while the meaning of each function code is left to the
//! application.
//!
//! # Features
//!
//! * MBAP (TCP/UDP), RTU, ASCII and BIN framings over a single transport type
//! * Transaction engine with a configurable attempt budget and retry delay
//! * Servers for all framings with per-process single-owner endpoint binding
//! * Panic-free parsing
//!
//! # Example
//!
//! A client that reads a handful of coils from unit `0x02`:
//!
//! ```no_run
//! use mblink::{Pdu, TransactionEngine, TransactionOptions, Transport, TransportOptions, UnitId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Transport::tcp("127.0.0.1:502".parse()?, TransportOptions::default());
//!     let mut engine = TransactionEngine::new(transport, TransactionOptions::default());
//!
//!     let request = Pdu::new(0x01, vec![0x00, 0x00, 0x00, 0x05]);
//!     let response = engine.execute(UnitId::new(0x02), request).await?;
//!     println!("{response}");
//!     Ok(())
//! }
//! ```

/// client-side transaction engine
mod client;
/// functionality common to clients and servers
mod common;
/// logging verbosity controls
mod decode;
/// error types
mod error;
/// process-wide endpoint ownership
mod registry;
/// retry delay strategies
mod retry;
/// serial framings and port settings
mod serial;
/// server tasks and request handling
mod server;
/// MBAP framing
mod tcp;
/// the connection-managing transport
mod transport;
/// public protocol types
mod types;

pub use crate::client::{TransactionEngine, TransactionOptions};
pub use crate::common::frame::{FrameHeader, TxId};
pub use crate::decode::{DecodeLevel, FrameDecodeLevel, PhysDecodeLevel};
pub use crate::error::{
    ConfigError, EndpointError, FrameParseError, InternalError, RequestError, TransactionError,
};
pub use crate::registry::{EndpointKind, EndpointRegistry, ListenerRegistration};
pub use crate::retry::{default_retry_strategy, doubling_retry_strategy, RetryStrategy};
pub use crate::serial::{
    DataBits, FlowControl, Parity, SerialEncoding, SerialSettings, StopBits,
};
pub use crate::server::{shared, RequestHandler, ServerConfig, SharedHandler};
pub use crate::transport::{Transport, TransportOptions};
pub use crate::types::{Pdu, UnitId};

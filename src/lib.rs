//! robustsession - RobustIRC client transport library
//!
//! This library presents a conventional, stream-oriented IRC connection
//! to a host chat client while actually speaking the RobustIRC
//! HTTP/JSON session protocol to a set of cooperating backend servers.
//! It hides the fact that the underlying transport is stateless HTTP
//! across a replicated cluster, and survives arbitrary server failures,
//! restarts, and network partitions without the host noticing more than
//! a brief stall.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `network`: per-network target discovery (DNS SRV) and per-target
//!   exponential backoff, shared across sessions
//! - `session`: the per-connection state machine, the host-facing
//!   [`RobustSession`] handle, and the streaming GetMessages decoder
//! - `config`: per-session configuration
//! - `error`: error types and result alias
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use robustsession::{NetworkRegistry, RobustSession, SessionConfig, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(NetworkRegistry::new());
//!     let session = RobustSession::connect(SessionConfig::new("robustirc.net"), registry)?;
//!     let mut events = session.events();
//!     while let Some(event) = events.next().await {
//!         match event {
//!             SessionEvent::ConnectFinished => session.send("NICK nick"),
//!             SessionEvent::Incoming(line) => println!("{line}"),
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
mod http;
pub mod network;
pub mod session;

// Re-export commonly used types
pub use config::{AddressFamily, SessionConfig};
pub use error::{Result, RobustSessionError};
pub use network::NetworkRegistry;
pub use session::decoder::{MessageId, RobustMessage};
pub use session::{RobustSession, SessionEvent, SessionState};

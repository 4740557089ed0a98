//! # khp-obs
//!
//! Client for the obs-websocket 5.x control protocol.
//!
//! Many threads can issue requests over one connection at once; responses
//! are matched to callers by request id. Events are delivered to subscribers
//! in arrival order on the connection's receive thread, and a subscriber may
//! itself send requests without deadlocking.
//!
//! ```no_run
//! use khp_obs::{Endpoint, Session, SessionConfig};
//! use serde_json::json;
//!
//! let session = Session::websocket(SessionConfig::new(Endpoint::new("localhost", 4455)))?;
//! let scenes = session.send("GetSceneList", json!({}))?;
//! # Ok::<(), khp_obs::ObsError>(())
//! ```
//!
//! ## Modules
//!
//! - [`session`]: connection lifecycle, request dispatch, receive loop
//! - [`protocol`]: wire shapes and the [`Frame`] decoder
//! - [`auth`]: handshake and password proof
//! - [`batch`]: request batches
//! - [`transport`]: the duplex channel trait and a WebSocket adapter
//! - [`testutil`]: in-process fake server

#![deny(unsafe_code)]

pub mod auth;
pub mod batch;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
mod table;
pub mod testutil;
pub mod transport;

pub use batch::{BatchItem, BatchMode};
pub use config::{Endpoint, SessionConfig};
pub use error::{ObsError, Result};
pub use events::SubscriptionId;
pub use protocol::{Event, Frame, RequestResponse, RequestStatus};
pub use session::{ConnectionState, Session, WeakSession};
pub use transport::{Connector, Transport, TransportError};

//! Prelude module for convenient imports.
//!
//! # Usage
//!
//! ```rust,no_run
//! use async_conn::prelude::*;
//! ```
//!
//! This imports the connection trait and its three implementations, the
//! session types, and the error handling types.

pub use crate::conn::{
    CompressType, Connection, DatagramConnection, DatagramContext, FramedConnection, Payload,
    StreamConnection,
};
pub use crate::error::{Error, Result};
pub use crate::session::{EndpointRole, Session, SessionRef};

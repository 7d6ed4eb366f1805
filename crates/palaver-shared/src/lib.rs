//! # palaver-shared
//!
//! Identifiers, the canonical message model and the wire protocol shared
//! by every Palaver crate.  Nothing in here performs I/O; the delivery
//! core, the store and the server all build on these types.

pub mod constants;
pub mod ids;
pub mod message;
pub mod wire;

mod error;

pub use error::ProtocolError;

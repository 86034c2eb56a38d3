//! Shared data model, error taxonomy and crypto primitives for the Beacon
//! messaging gateway.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod noise;
pub mod pqc;
pub mod protocol;
pub mod types;

pub use error::{ChannelError, ConnectionError, GatewayError, SendError, StateError};
pub use types::*;

pub mod bridge;
pub mod config;
pub mod correlator;
pub mod dom;
pub mod error;
pub mod handler;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod state;

pub use bridge::Bridge;
pub use error::{BridgeError, ErrorKind};

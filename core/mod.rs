// Core module: message model and wire codec (NO I/O dependencies)
pub mod error;
pub mod protocol;
pub mod types;

pub use error::*;
pub use protocol::*;
pub use types::*;

// Transport module: byte streams and message framing over them
pub mod env;
pub mod error;
pub mod framer;
pub mod tcp;
pub mod traits;
pub mod unix;

pub use env::*;
pub use error::*;
pub use framer::*;
pub use tcp::*;
pub use traits::*;
pub use unix::*;

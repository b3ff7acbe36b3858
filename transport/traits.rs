// Transport abstraction - allows pluggable communication backends
use std::io::Result;

/// A connected, blocking byte stream.
pub trait Transport: Send {
    fn send(&mut self, data: &[u8]) -> Result<usize>;
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn connect(&mut self) -> Result<()>;
    /// Shut the stream down in both directions. Every handle obtained from
    /// [`Transport::try_clone`] observes the shutdown.
    fn disconnect(&mut self) -> Result<()>;
    /// A second handle to the same underlying stream.
    fn try_clone(&self) -> Result<Box<dyn Transport>>;
    /// Human-readable peer address for logs.
    fn peer(&self) -> String;
}

pub trait TransportListener: Send {
    type Connection: Transport + 'static;

    fn bind(&mut self) -> Result<()>;
    fn accept(&mut self) -> Result<Self::Connection>;
    /// Non-blocking listeners return `WouldBlock` from `accept` when idle.
    fn set_nonblocking(&self, nonblocking: bool) -> Result<()>;
    fn local_addr(&self) -> String;
}

pub(crate) fn not_connected() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "Not connected")
}

// TCP transport implementation
use crate::traits::{not_connected, Transport, TransportListener};
use std::io::{Read, Result, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

pub struct TcpTransport {
    address: String,
    stream: Option<TcpStream>,
    connect_timeout: Option<Duration>,
}

impl TcpTransport {
    pub fn new(address: &str) -> Self {
        TcpTransport {
            address: address.to_string(),
            stream: None,
            connect_timeout: None,
        }
    }

    /// Wrap a stream that is already connected (e.g. from `accept`).
    pub fn from_stream(stream: TcpStream) -> Self {
        let address = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        TcpTransport {
            address,
            stream: Some(stream),
            connect_timeout: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    fn open(&self) -> Result<TcpStream> {
        let Some(timeout) = self.connect_timeout else {
            return TcpStream::connect(&self.address);
        };
        let mut last_err = None;
        for addr in self.address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "address resolved to nothing")
        }))
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        match self.stream {
            Some(ref mut stream) => stream.write(data),
            None => Err(not_connected()),
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.stream {
            Some(ref mut stream) => stream.read(buf),
            None => Err(not_connected()),
        }
    }

    fn connect(&mut self) -> Result<()> {
        let stream = self.open()?;
        // Messages are small and latency-sensitive
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            match stream.shutdown(Shutdown::Both) {
                Err(e) if e.kind() != std::io::ErrorKind::NotConnected => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn Transport>> {
        let stream = self.stream.as_ref().ok_or_else(not_connected)?.try_clone()?;
        Ok(Box::new(TcpTransport {
            address: self.address.clone(),
            stream: Some(stream),
            connect_timeout: self.connect_timeout,
        }))
    }

    fn peer(&self) -> String {
        self.address.clone()
    }
}

pub struct TcpTransportListener {
    address: String,
    listener: Option<TcpListener>,
}

impl TcpTransportListener {
    pub fn new(address: &str) -> Self {
        TcpTransportListener {
            address: address.to_string(),
            listener: None,
        }
    }

    /// Bound address; resolves port 0 to the assigned port.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}

impl TransportListener for TcpTransportListener {
    type Connection = TcpTransport;

    fn bind(&mut self) -> Result<()> {
        self.listener = Some(TcpListener::bind(&self.address)?);
        Ok(())
    }

    fn accept(&mut self) -> Result<TcpTransport> {
        let listener = self.listener.as_ref().ok_or_else(not_connected)?;
        let (stream, _) = listener.accept()?;
        // Accepted sockets must block regardless of the listener's mode
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        Ok(TcpTransport::from_stream(stream))
    }

    fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match self.listener {
            Some(ref listener) => listener.set_nonblocking(nonblocking),
            None => Err(not_connected()),
        }
    }

    fn local_addr(&self) -> String {
        self.socket_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| self.address.clone())
    }
}

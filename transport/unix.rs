// Unix socket transport implementation
use crate::traits::{not_connected, Transport, TransportListener};
use nix::sys::socket::{setsockopt, sockopt};
use std::io::{Read, Result, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

// 64KB keeps large eval output from stalling the writer thread
const SEND_BUFFER_SIZE: usize = 65536;

pub struct UnixSocketTransport {
    socket_path: PathBuf,
    stream: Option<UnixStream>,
}

impl UnixSocketTransport {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        UnixSocketTransport {
            socket_path: socket_path.as_ref().to_path_buf(),
            stream: None,
        }
    }

    pub fn from_stream(stream: UnixStream, socket_path: &Path) -> Self {
        UnixSocketTransport {
            socket_path: socket_path.to_path_buf(),
            stream: Some(stream),
        }
    }

    /// Set socket send buffer size (SO_SNDBUF)
    pub fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        if let Some(ref stream) = self.stream {
            setsockopt(stream, sockopt::SndBuf, &size).map_err(std::io::Error::from)?;
        }
        Ok(())
    }
}

impl Transport for UnixSocketTransport {
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
        let stream = UnixStream::connect(&self.socket_path)?;
        self.stream = Some(stream);
        if let Err(e) = self.set_send_buffer_size(SEND_BUFFER_SIZE) {
            tracing::debug!(error = %e, "could not resize unix socket send buffer");
        }
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
        Ok(Box::new(UnixSocketTransport {
            socket_path: self.socket_path.clone(),
            stream: Some(stream),
        }))
    }

    fn peer(&self) -> String {
        format!("unix:{}", self.socket_path.display())
    }
}

pub struct UnixTransportListener {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
}

impl UnixTransportListener {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        UnixTransportListener {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
        }
    }
}

impl TransportListener for UnixTransportListener {
    type Connection = UnixSocketTransport;

    fn bind(&mut self) -> Result<()> {
        // Remove a stale socket left by a previous run
        let _ = std::fs::remove_file(&self.socket_path);
        self.listener = Some(UnixListener::bind(&self.socket_path)?);
        Ok(())
    }

    fn accept(&mut self) -> Result<UnixSocketTransport> {
        let listener = self.listener.as_ref().ok_or_else(not_connected)?;
        let (stream, _) = listener.accept()?;
        stream.set_nonblocking(false)?;
        Ok(UnixSocketTransport::from_stream(stream, &self.socket_path))
    }

    fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match self.listener {
            Some(ref listener) => listener.set_nonblocking(nonblocking),
            None => Err(not_connected()),
        }
    }

    fn local_addr(&self) -> String {
        format!("unix:{}", self.socket_path.display())
    }
}

impl Drop for UnixTransportListener {
    fn drop(&mut self) {
        if self.listener.take().is_some() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

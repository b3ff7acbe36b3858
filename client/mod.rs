// client: nREPL client library for editors, scripts, and test harnesses
pub mod config;
pub mod correlator;
pub mod error;

pub use config::ClientConfig;
pub use correlator::{Completion, Correlator, PendingResponse, Routed};
pub use error::ClientError;

use chrono::{DateTime, Local};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use nrepl_core::{Message, Op};
use nrepl_transport::{FrameReader, FrameWriter, TcpTransport, Transport, UnixSocketTransport};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The stream is established. There is no protocol handshake.
    Connected { peer: String },
    /// The stream ended; `error` is set when it ended abnormally.
    Closed { error: Option<String> },
}

pub struct Client {
    correlator: Arc<Correlator>,
    writer: FrameWriter,
    control: Box<dyn Transport>,
    reader: Option<JoinHandle<()>>,
    events: Receiver<ClientEvent>,
    request_timeout: Option<Duration>,
    closed: bool,
}

impl Client {
    /// Connect over TCP to `config.host:config.port`.
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let mut transport = TcpTransport::new(&config.address());
        if let Some(timeout) = config.connect_timeout {
            transport = transport.with_connect_timeout(timeout);
        }
        transport.connect()?;
        Client::from_transport(Box::new(transport), &config)
    }

    /// Connect to a server's Unix socket; host and port in `config` are
    /// ignored.
    pub fn connect_unix(path: impl AsRef<Path>, config: ClientConfig) -> Result<Self, ClientError> {
        let mut transport = UnixSocketTransport::new(path);
        transport.connect()?;
        Client::from_transport(Box::new(transport), &config)
    }

    /// Wrap a transport that is already connected.
    pub fn from_transport(transport: Box<dyn Transport>, config: &ClientConfig) -> Result<Self, ClientError> {
        let peer = transport.peer();
        let control = transport.try_clone()?;
        let writer = FrameWriter::spawn(transport.try_clone()?, config.write_queue)?;
        let correlator = Arc::new(Correlator::new(writer.sink())?);
        let (events_tx, events) = unbounded();
        let _ = events_tx.send(ClientEvent::Connected { peer: peer.clone() });

        let routed = Arc::clone(&correlator);
        let verbose = config.verbose;
        let reader = thread::Builder::new()
            .name("nrepl-client-reader".to_string())
            .spawn(move || read_loop(transport, &routed, &events_tx, verbose))?;
        debug!(peer = %peer, "connected");

        Ok(Client {
            correlator,
            writer,
            control,
            reader: Some(reader),
            events,
            request_timeout: config.request_timeout,
            closed: false,
        })
    }

    pub fn events(&self) -> &Receiver<ClientEvent> {
        &self.events
    }

    /// Whether queued writes are keeping up with the stream.
    pub fn is_write_ready(&self) -> bool {
        self.correlator.is_write_ready()
    }

    pub fn pending_count(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Send `msg`, delivering its [`Completion`] to `on_complete`. Returns the
    /// request id. With no `timeout` the request waits for a terminal status
    /// or connection loss.
    pub fn submit<F>(&self, msg: Message, timeout: Option<Duration>, on_complete: F) -> Result<String, ClientError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        if self.closed {
            return Err(ClientError::ConnectionClosed);
        }
        self.correlator.submit(msg, timeout, on_complete)
    }

    /// Send `msg` with an explicit timeout and get a handle to its result.
    pub fn request_with_timeout(&self, msg: Message, timeout: Option<Duration>) -> Result<PendingResponse, ClientError> {
        let (tx, rx) = bounded(1);
        let id = self.submit(msg, timeout, move |completion| {
            let _ = tx.send(completion);
        })?;
        Ok(PendingResponse::new(id, rx))
    }

    /// Send `msg` using the configured request timeout.
    pub fn request(&self, msg: Message) -> Result<PendingResponse, ClientError> {
        self.request_with_timeout(msg, self.request_timeout)
    }

    pub fn eval(&self, code: &str, session: Option<&str>) -> Result<PendingResponse, ClientError> {
        self.request(eval_message(code, session))
    }

    pub fn eval_with<F>(&self, code: &str, session: Option<&str>, on_complete: F) -> Result<String, ClientError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.submit(eval_message(code, session), self.request_timeout, on_complete)
    }

    /// Evaluate file contents; `file_name` is informational.
    pub fn load_file(
        &self,
        contents: &str,
        file_name: Option<&str>,
        session: Option<&str>,
    ) -> Result<PendingResponse, ClientError> {
        let mut msg = Message::request(Op::LoadFile).with("file", contents);
        if let Some(name) = file_name {
            msg.insert("file-name", name);
        }
        if let Some(session) = session {
            msg.insert("session", session);
        }
        self.request(msg)
    }

    /// Clone `source`, or open a fresh session when `None`. The new id is
    /// in [`Completion::new_session`].
    pub fn clone_session(&self, source: Option<&str>) -> Result<PendingResponse, ClientError> {
        let mut msg = Message::request(Op::Clone);
        if let Some(source) = source {
            msg.insert("session", source);
        }
        self.request(msg)
    }

    pub fn close_session(&self, session: &str) -> Result<PendingResponse, ClientError> {
        self.request(Message::request(Op::Close).with("session", session))
    }

    /// Interrupt the eval `target` (or whatever is running) in `session`.
    pub fn interrupt(&self, session: &str, target: Option<&str>) -> Result<PendingResponse, ClientError> {
        let mut msg = Message::request(Op::Interrupt).with("session", session);
        if let Some(target) = target {
            msg.insert("interrupt-id", target);
        }
        self.request(msg)
    }

    pub fn describe(&self) -> Result<PendingResponse, ClientError> {
        self.request(Message::request(Op::Describe))
    }

    pub fn ls_sessions(&self) -> Result<PendingResponse, ClientError> {
        self.request(Message::request(Op::LsSessions))
    }

    /// Flush queued writes, close the stream, and fail anything still
    /// pending with `ConnectionClosed`.
    pub fn end(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.writer.close();
        let _ = self.control.disconnect();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.correlator.fail_all();
    }

    pub fn close(&mut self) {
        self.end();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.end();
    }
}

fn eval_message(code: &str, session: Option<&str>) -> Message {
    let mut msg = Message::request(Op::Eval).with("code", code);
    if let Some(session) = session {
        msg.insert("session", session);
    }
    msg
}

fn read_loop(transport: Box<dyn Transport>, correlator: &Correlator, events: &Sender<ClientEvent>, verbose: bool) {
    let mut error = None;
    for msg in FrameReader::new(transport) {
        match msg {
            Ok(msg) => {
                if verbose {
                    info!("{}", format_message(&msg, Local::now()));
                }
                correlator.on_message(msg);
            }
            Err(e) => {
                debug!(error = %e, "read failed");
                error = Some(e.to_string());
            }
        }
    }
    correlator.fail_all();
    let _ = events.send(ClientEvent::Closed { error });
}

/// One-line rendering of a received message for verbose output.
///
/// Format: "YYYY/MM/DD HH:MM:SS.mmm <id> [status] key=value ..."
pub fn format_message(msg: &Message, at: DateTime<Local>) -> String {
    let mut line = format!(
        "{} {}",
        at.format("%Y/%m/%d %H:%M:%S%.3f"),
        msg.id().unwrap_or("-")
    );
    let status = msg.status();
    if !status.is_empty() {
        let tags: Vec<&str> = status.iter().map(|s| s.as_str()).collect();
        line.push_str(&format!(" [{}]", tags.join(" ")));
    }
    for (key, value) in msg.iter() {
        if matches!(key, "id" | "status") {
            continue;
        }
        match value.as_str() {
            Some(text) => line.push_str(&format!(" {}={:?}", key, text)),
            None => line.push_str(&format!(" {}={:?}", key, value)),
        }
    }
    line
}

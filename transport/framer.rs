// Message framing: a lazy reader and an ordered, back-pressured writer
use crate::error::TransportError;
use crate::traits::Transport;
use crossbeam::channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TrySendError};
use nrepl_core::{decode, encode_into, Message};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

const READ_CHUNK: usize = 64 * 1024;

/// Default number of queued outbound messages before `send` blocks.
pub const DEFAULT_WRITE_QUEUE: usize = 256;

/// How long `FrameWriter::close` waits for queued messages to reach the peer.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

// Messages coalesced into one write
const WRITE_BATCH: usize = 16;

/// Lazy sequence of decoded messages from one connection.
///
/// Yields `Ok` for each complete message. A stream-level failure (reset,
/// malformed bytes, EOF inside a message) is yielded once as `Err`, after
/// which the sequence ends. A clean EOF ends the sequence without an error.
pub struct FrameReader {
    transport: Box<dyn Transport>,
    chunk: Vec<u8>,
    pending: Vec<u8>,
    cursor: usize,
    finished: bool,
}

impl FrameReader {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        FrameReader {
            transport,
            chunk: vec![0u8; READ_CHUNK],
            pending: Vec::new(),
            cursor: 0,
            finished: false,
        }
    }

    /// Bytes received but not yet part of a complete message.
    pub fn buffered(&self) -> usize {
        self.pending.len() - self.cursor
    }

    fn compact(&mut self) {
        if self.cursor > 0 {
            self.pending.drain(..self.cursor);
            self.cursor = 0;
        }
    }

    fn fail(&mut self, err: TransportError) -> Option<Result<Message, TransportError>> {
        self.finished = true;
        Some(Err(err))
    }
}

impl Iterator for FrameReader {
    type Item = Result<Message, TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            match decode(&self.pending, self.cursor) {
                Ok(Some((msg, used))) => {
                    self.cursor += used;
                    return Some(Ok(msg));
                }
                Ok(None) => {}
                Err(e) => return self.fail(e.into()),
            }

            self.compact();
            match self.transport.receive(&mut self.chunk) {
                Ok(0) => {
                    let buffered = self.buffered();
                    if buffered > 0 {
                        return self.fail(TransportError::UnexpectedEof { buffered });
                    }
                    self.finished = true;
                    return None;
                }
                Ok(n) => self.pending.extend_from_slice(&self.chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return self.fail(e.into()),
            }
        }
    }
}

struct WriterState {
    closed: AtomicBool,
}

/// Cloneable handle for queueing outbound messages.
///
/// Messages from one handle are written in the order they were queued.
#[derive(Clone)]
pub struct MessageSink {
    tx: Sender<Message>,
    state: Arc<WriterState>,
}

impl MessageSink {
    /// Queue a message, blocking while the queue is full.
    pub fn send(&self, msg: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.tx.send(msg).map_err(|_| TransportError::Closed)
    }

    /// Queue a message without blocking.
    pub fn try_send(&self, msg: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::Full),
            Err(TrySendError::Disconnected(_)) => Err(TransportError::Closed),
        }
    }

    /// Whether a `send` would proceed without waiting on the stream.
    pub fn is_write_ready(&self) -> bool {
        !self.is_closed() && !self.tx.is_full()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

impl From<Sender<Message>> for MessageSink {
    fn from(tx: Sender<Message>) -> Self {
        MessageSink {
            tx,
            state: Arc::new(WriterState {
                closed: AtomicBool::new(false),
            }),
        }
    }
}

/// Owns the writer thread for one connection.
pub struct FrameWriter {
    sink: MessageSink,
    close_tx: Sender<()>,
    // Disconnected once the writer thread exits
    stopped_rx: Receiver<()>,
    control: Box<dyn Transport>,
    worker: Option<JoinHandle<()>>,
}

impl FrameWriter {
    pub fn spawn(transport: Box<dyn Transport>, capacity: usize) -> Result<Self, TransportError> {
        let (tx, rx) = bounded(capacity.max(1));
        let (close_tx, close_rx) = bounded(1);
        let (stopped_tx, stopped_rx) = bounded::<()>(0);
        let sink = MessageSink::from(tx);
        let state = Arc::clone(&sink.state);
        let peer = transport.peer();
        let control = transport.try_clone()?;

        let worker = thread::Builder::new()
            .name("nrepl-writer".to_string())
            .spawn(move || {
                let _stopped = stopped_tx;
                Self::worker_thread(transport, rx, close_rx, &state);
                state.closed.store(true, Ordering::Release);
                debug!(peer = %peer, "writer stopped");
            })?;

        Ok(FrameWriter {
            sink,
            close_tx,
            stopped_rx,
            control,
            worker: Some(worker),
        })
    }

    pub fn sink(&self) -> MessageSink {
        self.sink.clone()
    }

    pub fn send(&self, msg: Message) -> Result<(), TransportError> {
        self.sink.send(msg)
    }

    pub fn is_write_ready(&self) -> bool {
        self.sink.is_write_ready()
    }

    /// Flush every message queued so far, then stop the writer thread.
    /// Gives up after [`DEFAULT_FLUSH_TIMEOUT`].
    pub fn close(&mut self) {
        self.close_within(DEFAULT_FLUSH_TIMEOUT);
    }

    /// Like [`FrameWriter::close`] with an explicit flush deadline. When the
    /// peer stops reading and the deadline passes, the stream is shut down
    /// and unsent messages are dropped. Returns whether the flush finished.
    pub fn close_within(&mut self, timeout: Duration) -> bool {
        let Some(worker) = self.worker.take() else {
            return true;
        };
        let _ = self.close_tx.try_send(());
        let flushed = !matches!(self.stopped_rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout));
        if !flushed {
            debug!(peer = %self.control.peer(), "flush timed out, shutting stream down");
            let _ = self.control.disconnect();
        }
        let _ = worker.join();
        flushed
    }

    fn worker_thread(
        mut transport: Box<dyn Transport>,
        rx: Receiver<Message>,
        close_rx: Receiver<()>,
        state: &WriterState,
    ) {
        let mut out = Vec::with_capacity(4096);
        loop {
            let (first, closing) = select! {
                recv(rx) -> msg => match msg {
                    Ok(msg) => (Some(msg), false),
                    Err(_) => return,
                },
                recv(close_rx) -> _ => (rx.try_recv().ok(), true),
            };
            let Some(first) = first else { return };

            out.clear();
            encode_into(&first, &mut out);
            // Collect more without blocking; on close drain everything
            let mut batched = 1;
            while closing || batched < WRITE_BATCH {
                match rx.try_recv() {
                    Ok(msg) => encode_into(&msg, &mut out),
                    Err(_) => break,
                }
                batched += 1;
            }

            if let Err(e) = write_all(transport.as_mut(), &out) {
                debug!(peer = %transport.peer(), error = %e, "write failed, closing stream");
                state.closed.store(true, Ordering::Release);
                let _ = transport.disconnect();
                return;
            }
            if closing {
                return;
            }
        }
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        // Signal only: joining here could wait on a peer that stopped reading
        let _ = self.close_tx.try_send(());
    }
}

fn write_all(transport: &mut dyn Transport, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        match transport.send(data) {
            Ok(0) => return Err(std::io::Error::new(ErrorKind::WriteZero, "stream accepted no bytes")),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(1)),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nrepl_core::{encode, Op};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Shared<T> = Arc<Mutex<T>>;

    // Minimal in-memory transport: scripted reads, recorded writes
    struct ScriptedTransport {
        reads: Shared<VecDeque<Vec<u8>>>,
        written: Shared<Vec<u8>>,
        max_write: usize,
    }

    impl ScriptedTransport {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            ScriptedTransport {
                reads: Arc::new(Mutex::new(chunks.into())),
                written: Arc::new(Mutex::new(Vec::new())),
                max_write: usize::MAX,
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&mut self, data: &[u8]) -> std::io::Result<usize> {
            let n = data.len().min(self.max_write);
            self.written.lock().unwrap().extend_from_slice(&data[..n]);
            Ok(n)
        }

        fn receive(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.reads.lock().unwrap().pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }

        fn connect(&mut self) -> std::io::Result<()> {
            Ok(())
        }

        fn disconnect(&mut self) -> std::io::Result<()> {
            Ok(())
        }

        fn try_clone(&self) -> std::io::Result<Box<dyn Transport>> {
            Ok(Box::new(ScriptedTransport {
                reads: Arc::clone(&self.reads),
                written: Arc::clone(&self.written),
                max_write: self.max_write,
            }))
        }

        fn peer(&self) -> String {
            "scripted".to_string()
        }
    }

    // Accepts no bytes until disconnected, like a peer that stopped reading
    #[derive(Default)]
    struct StalledTransport {
        shut: Arc<AtomicBool>,
    }

    impl Transport for StalledTransport {
        fn send(&mut self, _data: &[u8]) -> std::io::Result<usize> {
            while !self.shut.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
            Err(std::io::Error::new(ErrorKind::BrokenPipe, "shut down"))
        }

        fn receive(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn connect(&mut self) -> std::io::Result<()> {
            Ok(())
        }

        fn disconnect(&mut self) -> std::io::Result<()> {
            self.shut.store(true, Ordering::Release);
            Ok(())
        }

        fn try_clone(&self) -> std::io::Result<Box<dyn Transport>> {
            Ok(Box::new(StalledTransport {
                shut: Arc::clone(&self.shut),
            }))
        }

        fn peer(&self) -> String {
            "stalled".to_string()
        }
    }

    fn eval(id: &str) -> Message {
        Message::request(Op::Eval).with("id", id).with("code", "(+ 3 4)")
    }

    #[test]
    fn reassembles_messages_split_across_reads() {
        let mut bytes = encode(&eval("1"));
        bytes.extend(encode(&eval("2")));
        let chunks: Vec<Vec<u8>> = bytes.chunks(3).map(|c| c.to_vec()).collect();

        let reader = FrameReader::new(Box::new(ScriptedTransport::new(chunks)));
        let ids: Vec<String> = reader
            .map(|m| m.unwrap().id().unwrap().to_string())
            .collect();
        assert_eq!(ids, ["1", "2"]);
    }

    #[test]
    fn malformed_bytes_end_the_sequence() {
        let mut bytes = encode(&eval("1"));
        bytes.extend_from_slice(b"l1:xe");
        bytes.extend(encode(&eval("2")));

        let mut reader = FrameReader::new(Box::new(ScriptedTransport::new(vec![bytes])));
        assert!(reader.next().unwrap().is_ok());
        assert!(matches!(reader.next(), Some(Err(TransportError::Malformed(_)))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn eof_inside_a_message_is_an_error() {
        let bytes = encode(&eval("1"));
        let cut = bytes[..bytes.len() - 2].to_vec();
        let mut reader = FrameReader::new(Box::new(ScriptedTransport::new(vec![cut])));
        match reader.next() {
            Some(Err(TransportError::UnexpectedEof { buffered })) => assert!(buffered > 0),
            other => panic!("unexpected {:?}", other.map(|r| r.is_ok())),
        }
        assert!(reader.next().is_none());
    }

    #[test]
    fn close_flushes_in_queue_order() {
        let mut transport = ScriptedTransport::new(Vec::new());
        transport.max_write = 5;
        let written = Arc::clone(&transport.written);

        let mut writer = FrameWriter::spawn(Box::new(transport), 4).unwrap();
        let sink = writer.sink();
        for i in 0..20 {
            sink.send(eval(&i.to_string())).unwrap();
        }
        writer.close();

        let bytes = written.lock().unwrap().clone();
        let ids: Vec<String> = FrameReader::new(Box::new(ScriptedTransport::new(vec![bytes])))
            .map(|m| m.unwrap().id().unwrap().to_string())
            .collect();
        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(ids, expected);

        assert!(!sink.is_write_ready());
        assert!(matches!(sink.send(eval("late")), Err(TransportError::Closed)));
    }

    #[test]
    fn close_gives_up_on_a_stalled_peer() {
        let transport = StalledTransport::default();
        let shut = Arc::clone(&transport.shut);
        let mut writer = FrameWriter::spawn(Box::new(transport), 4).unwrap();
        writer.send(eval("1")).unwrap();

        let started = std::time::Instant::now();
        assert!(!writer.close_within(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(shut.load(Ordering::Acquire));
        assert!(!writer.is_write_ready());
        // A second close is a no-op
        assert!(writer.close_within(Duration::from_millis(1)));
    }

    #[test]
    fn full_queue_reports_not_ready() {
        let (tx, _rx) = bounded(1);
        let sink = MessageSink::from(tx);
        assert!(sink.is_write_ready());
        sink.try_send(eval("1")).unwrap();
        assert!(!sink.is_write_ready());
        assert!(matches!(sink.try_send(eval("2")), Err(TransportError::Full)));
    }
}

// Request correlator: pending-request table keyed by message id
use crate::error::ClientError;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use nrepl_core::{Message, StatusSet};
use nrepl_transport::MessageSink;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// How a pending request was resolved. Every submitted request resolves
/// exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// A terminal status arrived; the last message carries it.
    Done(Vec<Message>),
    /// The deadline passed first; holds whatever arrived until then.
    TimedOut(Vec<Message>),
    /// The connection went away first.
    Disconnected(Vec<Message>),
}

impl Completion {
    pub fn messages(&self) -> &[Message] {
        match self {
            Completion::Done(m) | Completion::TimedOut(m) | Completion::Disconnected(m) => m,
        }
    }

    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Completion::Done(m) | Completion::TimedOut(m) | Completion::Disconnected(m) => m,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Completion::Done(_))
    }

    pub fn into_result(self) -> Result<Vec<Message>, ClientError> {
        match self {
            Completion::Done(m) => Ok(m),
            Completion::TimedOut(_) => Err(ClientError::Timeout),
            Completion::Disconnected(_) => Err(ClientError::ConnectionClosed),
        }
    }

    /// The last `value` in the response stream.
    pub fn value(&self) -> Option<&str> {
        self.messages().iter().rev().find_map(|m| m.value())
    }

    /// All `out` text, in arrival order.
    pub fn out(&self) -> String {
        self.concat("out")
    }

    /// All `err` text, in arrival order.
    pub fn err(&self) -> String {
        self.concat("err")
    }

    /// Union of every message's status tags.
    pub fn status(&self) -> StatusSet {
        let mut status = StatusSet::new();
        for msg in self.messages() {
            status.extend(&msg.status());
        }
        status
    }

    pub fn new_session(&self) -> Option<&str> {
        self.messages().iter().find_map(|m| m.get_str("new-session"))
    }

    fn concat(&self, key: &str) -> String {
        self.messages().iter().filter_map(|m| m.get_str(key)).collect()
    }
}

/// What `on_message` did with an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Appended,
    Completed,
    /// No pending request has this id (late, duplicate, or id-less).
    Dropped,
}

type Callback = Box<dyn FnOnce(Completion) + Send>;

struct Pending {
    messages: Vec<Message>,
    on_complete: Callback,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct PendingTable {
    entries: Mutex<HashMap<String, Pending>>,
}

impl PendingTable {
    // Only fires if the entry still carries this deadline; a reused id
    // with a new deadline is left alone
    fn expire(&self, id: &str, at: Instant) {
        let expired = {
            let mut entries = self.entries.lock();
            let due = entries.get(id).is_some_and(|p| p.deadline == Some(at));
            if due {
                entries.remove(id)
            } else {
                None
            }
        };
        if let Some(p) = expired {
            debug!(id = %id, received = p.messages.len(), "request timed out");
            (p.on_complete)(Completion::TimedOut(p.messages));
        }
    }
}

/// Tracks outstanding requests on one connection and resolves each when
/// its terminal response arrives, its deadline passes, or the connection
/// fails.
pub struct Correlator {
    sink: MessageSink,
    table: Arc<PendingTable>,
    timer_tx: Sender<(Instant, String)>,
}

impl Correlator {
    pub fn new(sink: MessageSink) -> Result<Self, ClientError> {
        let table = Arc::new(PendingTable::default());
        let (timer_tx, timer_rx) = unbounded();
        let timer_table = Arc::clone(&table);
        thread::Builder::new()
            .name("nrepl-client-timer".to_string())
            .spawn(move || run_timer(&timer_table, timer_rx))?;
        Ok(Correlator {
            sink,
            table,
            timer_tx,
        })
    }

    /// Send `msg` and call `on_complete` once it resolves.
    ///
    /// A missing `id` is filled with a fresh UUID. The entry is recorded
    /// before the message is queued, so a fast reply cannot race past it.
    ///
    /// Never waits on the stream: when the write queue is full the request
    /// is dropped and `TransportError::Full` is returned. Callers that care
    /// check [`Correlator::is_write_ready`] first.
    pub fn submit<F>(&self, mut msg: Message, timeout: Option<Duration>, on_complete: F) -> Result<String, ClientError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        let id = match msg.id() {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                msg.insert("id", id.as_str());
                id
            }
        };
        let deadline = timeout.map(|t| Instant::now() + t);

        {
            let mut entries = self.table.entries.lock();
            if entries.contains_key(&id) {
                return Err(ClientError::DuplicateId(id));
            }
            entries.insert(
                id.clone(),
                Pending {
                    messages: Vec::new(),
                    on_complete: Box::new(on_complete),
                    deadline,
                },
            );
        }
        if let Some(at) = deadline {
            let _ = self.timer_tx.send((at, id.clone()));
        }
        debug!(id = %id, op = msg.get_str("op").unwrap_or("<none>"), timeout = ?timeout, "request submitted");

        if let Err(e) = self.sink.try_send(msg) {
            // If the entry is already gone its callback has run (timeout)
            if self.table.entries.lock().remove(&id).is_some() {
                return Err(e.into());
            }
        }
        Ok(id)
    }

    /// Route one inbound message to its pending request.
    pub fn on_message(&self, msg: Message) -> Routed {
        let Some(id) = msg.id().map(str::to_string) else {
            debug!("dropping response without id");
            return Routed::Dropped;
        };
        let terminal = msg.is_terminal();
        let finished = {
            let mut entries = self.table.entries.lock();
            let Some(pending) = entries.get_mut(&id) else {
                debug!(id = %id, "dropping response for unknown request");
                return Routed::Dropped;
            };
            pending.messages.push(msg);
            if !terminal {
                return Routed::Appended;
            }
            entries.remove(&id)
        };
        if let Some(p) = finished {
            (p.on_complete)(Completion::Done(p.messages));
        }
        Routed::Completed
    }

    /// Resolve every pending request as disconnected.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<(String, Pending)> = self.table.entries.lock().drain().collect();
        if !drained.is_empty() {
            warn!(pending = drained.len(), "failing pending requests, connection closed");
        }
        let count = drained.len();
        for (_, p) in drained {
            (p.on_complete)(Completion::Disconnected(p.messages));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.table.entries.lock().len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.table.entries.lock().contains_key(id)
    }

    pub fn is_write_ready(&self) -> bool {
        self.sink.is_write_ready()
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.fail_all();
    }
}

fn run_timer(table: &PendingTable, rx: Receiver<(Instant, String)>) {
    let mut deadlines: BinaryHeap<Reverse<(Instant, String)>> = BinaryHeap::new();
    loop {
        let next = deadlines.peek().map(|Reverse((at, _))| *at);
        let received = match next {
            Some(at) => rx.recv_deadline(at),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(entry) => deadlines.push(Reverse(entry)),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }

        let now = Instant::now();
        while deadlines.peek().is_some_and(|Reverse((at, _))| *at <= now) {
            if let Some(Reverse((at, id))) = deadlines.pop() {
                table.expire(&id, at);
            }
        }
    }
}

/// A request's eventual [`Completion`], for callers that prefer waiting to
/// callbacks.
pub struct PendingResponse {
    id: String,
    rx: Receiver<Completion>,
}

impl PendingResponse {
    pub(crate) fn new(id: String, rx: Receiver<Completion>) -> Self {
        PendingResponse { id, rx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Block until the request resolves.
    pub fn wait(self) -> Completion {
        self.rx.recv().unwrap_or(Completion::Disconnected(Vec::new()))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Completion> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_take(&self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;
    use nrepl_core::{Op, Status};
    use nrepl_transport::TransportError;

    fn correlator() -> (Correlator, Receiver<Message>) {
        let (tx, rx) = unbounded();
        (Correlator::new(MessageSink::from(tx)).unwrap(), rx)
    }

    fn reply(id: &str) -> Message {
        Message::new().with("id", id)
    }

    fn collect() -> (Sender<Completion>, Receiver<Completion>) {
        unbounded()
    }

    #[test]
    fn accumulates_until_terminal() {
        let (c, outbound) = correlator();
        let (tx, done) = collect();
        let id = c
            .submit(Message::request(Op::Eval).with("code", "1"), None, move |r| {
                let _ = tx.send(r);
            })
            .unwrap();
        assert_eq!(outbound.recv().unwrap().id(), Some(id.as_str()));

        assert_eq!(c.on_message(reply(&id).with("out", "a")), Routed::Appended);
        assert_eq!(c.on_message(reply("stranger")), Routed::Dropped);
        let mut last = reply(&id).with("value", "1");
        last.set_status(StatusSet::of(&[Status::Done]));
        assert_eq!(c.on_message(last), Routed::Completed);

        let completion = done.try_recv().unwrap();
        assert!(completion.is_done());
        assert_eq!(completion.messages().len(), 2);
        assert_eq!(completion.value(), Some("1"));
        assert_eq!(completion.out(), "a");
        assert_eq!(c.pending_count(), 0);
        // Late duplicates are dropped
        assert_eq!(c.on_message(reply(&id)), Routed::Dropped);
    }

    #[test]
    fn concurrent_requests_stay_independent() {
        let (c, _outbound) = correlator();
        let (tx, done) = collect();
        for id in ["a", "b"] {
            let tx = tx.clone();
            c.submit(Message::request(Op::Eval).with("id", id), None, move |r| {
                let _ = tx.send(r);
            })
            .unwrap();
        }
        c.on_message(reply("b").with("out", "b1"));
        c.on_message(reply("a").with("out", "a1"));
        let mut end_b = reply("b");
        end_b.set_status(StatusSet::of(&[Status::Done]));
        c.on_message(end_b);

        let first = done.try_recv().unwrap();
        assert_eq!(first.out(), "b1");
        assert!(c.is_pending("a"));
        assert!(!c.is_pending("b"));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let (c, _outbound) = correlator();
        c.submit(Message::request(Op::Describe).with("id", "x"), None, |_| {})
            .unwrap();
        assert!(matches!(
            c.submit(Message::request(Op::Describe).with("id", "x"), None, |_| {}),
            Err(ClientError::DuplicateId(id)) if id == "x"
        ));
    }

    #[test]
    fn timeout_resolves_with_partial_messages() {
        let (c, _outbound) = correlator();
        let (tx, done) = collect();
        let id = c
            .submit(Message::request(Op::Eval), Some(Duration::from_millis(10)), move |r| {
                let _ = tx.send(r);
            })
            .unwrap();
        c.on_message(reply(&id).with("out", "partial"));

        let completion = done.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(completion, Completion::TimedOut(ref m) if m.len() == 1));
        assert!(matches!(completion.into_result(), Err(ClientError::Timeout)));
        assert_eq!(c.pending_count(), 0);
    }

    #[test]
    fn completed_requests_ignore_their_deadline() {
        let (c, _outbound) = correlator();
        let (tx, done) = collect();
        let id = c
            .submit(Message::request(Op::Eval), Some(Duration::from_millis(20)), move |r| {
                let _ = tx.send(r);
            })
            .unwrap();
        let mut end = reply(&id);
        end.set_status(StatusSet::of(&[Status::Done]));
        c.on_message(end);
        thread::sleep(Duration::from_millis(60));
        assert!(done.try_recv().unwrap().is_done());
        assert!(done.try_recv().is_err());
    }

    #[test]
    fn fail_all_and_closed_sink() {
        let (c, outbound) = correlator();
        let (tx, done) = collect();
        c.submit(Message::request(Op::Eval), None, move |r| {
            let _ = tx.send(r);
        })
        .unwrap();
        assert_eq!(c.fail_all(), 1);
        assert!(matches!(
            done.try_recv().unwrap().into_result(),
            Err(ClientError::ConnectionClosed)
        ));

        drop(outbound);
        assert!(c.submit(Message::request(Op::Eval), None, |_| {}).is_err());
        assert_eq!(c.pending_count(), 0);
    }

    #[test]
    fn full_write_queue_rejects_without_waiting() {
        // Nobody drains the queue, like a writer stuck on a peer that stopped reading
        let (tx, _outbound) = bounded(1);
        let c = Correlator::new(MessageSink::from(tx)).unwrap();
        c.submit(Message::request(Op::Eval).with("code", "1"), None, |_| {})
            .unwrap();
        assert!(!c.is_write_ready());

        let started = Instant::now();
        let second = c.submit(Message::request(Op::Eval).with("code", "2"), None, |_| {});
        assert!(matches!(second, Err(ClientError::Transport(TransportError::Full))));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(c.pending_count(), 1);
    }
}

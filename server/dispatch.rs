// Operation dispatcher: routes each request to the handler for its op
use crate::error::SessionError;
use crate::evaluator::{EvalIo, EvalOutcome, Evaluator, OutputStream};
use crate::session::{InterruptOutcome, SessionManager};
use nrepl_core::{Message, Op, Status, StatusSet, PROTOCOL_VERSION};
use nrepl_transport::MessageSink;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

/// Sends responses for one request, stamping each with its id and session.
#[derive(Clone)]
pub struct Responder {
    sink: MessageSink,
    id: Option<String>,
    session: Option<String>,
}

impl Responder {
    pub fn new(sink: MessageSink, request: &Message) -> Self {
        Responder {
            sink,
            id: request.id().map(str::to_string),
            session: request.session().map(str::to_string),
        }
    }

    fn for_session(mut self, session: &str) -> Self {
        self.session = Some(session.to_string());
        self
    }

    pub fn send(&self, mut msg: Message) {
        if let Some(id) = &self.id {
            msg.insert("id", id.as_str());
        }
        if let Some(session) = &self.session {
            if !msg.contains_key("session") {
                msg.insert("session", session.as_str());
            }
        }
        if let Err(e) = self.sink.send(msg) {
            debug!(id = ?self.id, error = %e, "dropping response for closed connection");
        }
    }

    /// Send the terminal response: `tags` plus `done`.
    pub fn done(&self, mut msg: Message, tags: &[Status]) {
        let mut status = StatusSet::of(tags);
        status.insert(Status::Done);
        msg.set_status(status);
        self.send(msg);
    }
}

/// Per-connection dispatch state. Only the implicit default session is
/// tied to the connection; sessions from `clone` are server-wide and stay
/// open until closed explicitly or the server stops.
#[derive(Debug, Default)]
pub struct ConnectionState {
    default_session: Option<String>,
}

impl ConnectionState {
    pub fn default_session_id(&self) -> Option<&str> {
        self.default_session.as_deref()
    }

    fn forget(&mut self, id: &str) {
        if self.default_session.as_deref() == Some(id) {
            self.default_session = None;
        }
    }

    // Lazily created session for evals that name none
    fn default_session<C: Clone + Default>(&mut self, sessions: &SessionManager<C>) -> String {
        if let Some(id) = &self.default_session {
            if sessions.get(id).is_ok() {
                return id.clone();
            }
        }
        let id = sessions.create();
        self.default_session = Some(id.clone());
        id
    }
}

pub struct Dispatcher<E: Evaluator> {
    sessions: Arc<SessionManager<E::Context>>,
    evaluator: Arc<E>,
}

impl<E: Evaluator> Clone for Dispatcher<E> {
    fn clone(&self) -> Self {
        Dispatcher {
            sessions: Arc::clone(&self.sessions),
            evaluator: Arc::clone(&self.evaluator),
        }
    }
}

impl<E: Evaluator> Dispatcher<E> {
    pub fn new(sessions: Arc<SessionManager<E::Context>>, evaluator: Arc<E>) -> Self {
        Dispatcher { sessions, evaluator }
    }

    pub fn sessions(&self) -> &Arc<SessionManager<E::Context>> {
        &self.sessions
    }

    /// Handle one decoded request. Responses go to `sink`, possibly after
    /// this returns (evals run on their own thread).
    pub fn dispatch(&self, request: Message, conn: &mut ConnectionState, sink: &MessageSink) {
        let responder = Responder::new(sink.clone(), &request);
        match request.op() {
            Some(Op::Eval) => self.eval(&request, request.code(), conn, responder),
            Some(Op::LoadFile) => self.eval(&request, request.get_str("file"), conn, responder),
            Some(Op::Clone) => self.clone_session(&request, responder),
            Some(Op::Close) => self.close(&request, conn, responder),
            Some(Op::Describe) => self.describe(responder),
            Some(Op::Interrupt) => self.interrupt(&request, responder),
            Some(Op::LsSessions) => {
                let sessions = self.sessions.list();
                responder.done(Message::new().with("sessions", sessions), &[]);
            }
            Some(Op::Unknown(op)) => {
                debug!(op = %op, "unknown op");
                responder.done(Message::new(), &[Status::Error, Status::UnknownOp]);
            }
            None => responder.done(Message::new(), &[Status::Error, Status::UnknownOp]),
        }
    }

    fn eval(&self, request: &Message, code: Option<&str>, conn: &mut ConnectionState, responder: Responder) {
        let session = match request.session() {
            Some(s) => s.to_string(),
            None => conn.default_session(&self.sessions),
        };
        let responder = responder.for_session(&session);
        let Some(code) = code else {
            responder.done(Message::new(), &[Status::Error, Status::NoCode]);
            return;
        };
        let message_id = request.id().unwrap_or_default().to_string();

        let (mut context, cancel) = match self.sessions.begin_eval(&session, &message_id) {
            Ok(started) => started,
            Err(SessionError::UnknownSession(_)) => {
                responder.done(Message::new(), &[Status::Error, Status::UnknownSession]);
                return;
            }
            Err(SessionError::Busy { running, .. }) => {
                debug!(session = %session, running = %running, "rejecting eval on busy session");
                responder.done(Message::new(), &[Status::Error, Status::SessionBusy]);
                return;
            }
        };

        let sessions = Arc::clone(&self.sessions);
        let evaluator = Arc::clone(&self.evaluator);
        let code = code.to_string();
        let worker_session = session.clone();
        let worker_id = message_id.clone();
        let worker_responder = responder.clone();
        let spawned = thread::Builder::new()
            .name("nrepl-eval".to_string())
            .spawn(move || {
                let out = worker_responder.clone();
                let mut emit = |stream: OutputStream, text: &str| {
                    out.send(Message::new().with(stream.key(), text));
                };
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    let mut io = EvalIo::new(&cancel, &mut emit);
                    evaluator.evaluate(&code, &mut context, &mut io)
                }))
                .unwrap_or_else(|_| EvalOutcome::Exception {
                    class: "panic".to_string(),
                    message: "evaluator panicked".to_string(),
                });

                // Free the session before the terminal response goes out, so
                // a follow-up eval sent on receipt never sees it busy
                if cancel.is_cancelled() {
                    sessions.finish_eval(&worker_session, &worker_id, None);
                    worker_responder.done(Message::new(), &[Status::Interrupted]);
                    return;
                }
                sessions.finish_eval(&worker_session, &worker_id, Some(context));
                match outcome {
                    EvalOutcome::Value(value) => {
                        worker_responder.done(Message::new().with("value", value), &[]);
                    }
                    EvalOutcome::Exception { class, message } => {
                        worker_responder.done(
                            Message::new().with("ex", class).with("err", message),
                            &[Status::EvalError],
                        );
                    }
                }
            });

        if let Err(e) = spawned {
            warn!(session = %session, error = %e, "failed to spawn eval worker");
            self.sessions.finish_eval(&session, &message_id, None);
            responder.done(Message::new().with("err", e.to_string()), &[Status::Error]);
        }
    }

    fn clone_session(&self, request: &Message, responder: Responder) {
        let created = match request.session() {
            Some(source) => self.sessions.clone_session(source),
            None => Ok(self.sessions.create()),
        };
        match created {
            Ok(id) => responder.done(Message::new().with("new-session", id), &[]),
            Err(_) => responder.done(Message::new(), &[Status::Error, Status::UnknownSession]),
        }
    }

    fn close(&self, request: &Message, conn: &mut ConnectionState, responder: Responder) {
        let Some(session) = request.session() else {
            responder.done(Message::new(), &[Status::Error, Status::UnknownSession]);
            return;
        };
        // Already-closed sessions answer plain `done`
        self.sessions.close(session);
        conn.forget(session);
        responder.done(Message::new(), &[]);
    }

    fn describe(&self, responder: Responder) {
        let mut ops = Message::new();
        for op in Op::KNOWN.iter() {
            ops.insert(op.as_str(), Message::new());
        }
        let (major, minor, incremental) = PROTOCOL_VERSION;
        let version = Message::new()
            .with("major", major)
            .with("minor", minor)
            .with("incremental", incremental)
            .with("version-string", format!("{}.{}.{}", major, minor, incremental));
        let reply = Message::new()
            .with("ops", ops)
            .with("versions", Message::new().with("nrepl", version))
            .with("aux", Message::new().with("evaluator", self.evaluator.name()));
        responder.done(reply, &[]);
    }

    fn interrupt(&self, request: &Message, responder: Responder) {
        let Some(session) = request.session() else {
            responder.done(Message::new(), &[Status::Error, Status::UnknownSession]);
            return;
        };
        match self.sessions.interrupt(session, request.get_str("interrupt-id")) {
            Ok(InterruptOutcome::Requested { .. }) => responder.done(Message::new(), &[]),
            Ok(InterruptOutcome::Idle) | Ok(InterruptOutcome::Mismatch { .. }) => responder.done(
                Message::new().with("error", "no eval to interrupt"),
                &[Status::Error, Status::SessionIdle],
            ),
            Err(_) => responder.done(Message::new(), &[Status::Error, Status::UnknownSession]),
        }
    }
}

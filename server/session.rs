// Session manager: server-wide table of evaluation sessions
use crate::error::SessionError;
use crate::evaluator::CancelToken;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// An eval currently running in a session, keyed by its request id.
struct RunningEval {
    message_id: String,
    cancel: CancelToken,
}

struct SessionEntry<C> {
    context: C,
    running: Option<RunningEval>,
    created_at: Instant,
    seq: u64,
}

struct Table<C> {
    entries: HashMap<String, SessionEntry<C>>,
    next_seq: u64,
}

impl<C> Table<C> {
    fn insert(&mut self, context: C) -> String {
        let id = Uuid::new_v4().to_string();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            id.clone(),
            SessionEntry {
                context,
                running: None,
                created_at: Instant::now(),
                seq,
            },
        );
        id
    }
}

/// Snapshot of a session's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    /// Request id of the eval in flight, if any.
    pub running: Option<String>,
    pub age: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// Cancellation was requested for this eval.
    Requested { message_id: String },
    /// Nothing is running in the session.
    Idle,
    /// Something is running, but not the requested id.
    Mismatch { running: String },
}

/// Owns every open session of one server instance.
///
/// Each operation locks the table once, so create/clone/close and eval
/// bookkeeping never partially apply. A session's context is handed to an
/// eval as a snapshot and committed back when the eval finishes.
pub struct SessionManager<C> {
    table: Mutex<Table<C>>,
}

impl<C: Clone + Default> SessionManager<C> {
    pub fn new() -> Self {
        SessionManager {
            table: Mutex::new(Table {
                entries: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Open a session with a fresh default context.
    pub fn create(&self) -> String {
        let id = self.table.lock().insert(C::default());
        debug!(session = %id, "session created");
        id
    }

    /// Open a session whose context copies `source`'s last committed context.
    pub fn clone_session(&self, source: &str) -> Result<String, SessionError> {
        let mut table = self.table.lock();
        let context = table
            .entries
            .get(source)
            .map(|e| e.context.clone())
            .ok_or_else(|| SessionError::UnknownSession(source.to_string()))?;
        let id = table.insert(context);
        debug!(session = %id, source = %source, "session cloned");
        Ok(id)
    }

    /// Close a session, interrupting its running eval first.
    ///
    /// Returns whether the session was open; closing twice is a no-op.
    pub fn close(&self, id: &str) -> bool {
        let Some(entry) = self.table.lock().entries.remove(id) else {
            return false;
        };
        if let Some(running) = entry.running {
            running.cancel.cancel();
            debug!(session = %id, id = %running.message_id, "interrupted eval of closing session");
        }
        debug!(session = %id, "session closed");
        true
    }

    pub fn get(&self, id: &str) -> Result<SessionInfo, SessionError> {
        let table = self.table.lock();
        let entry = table
            .entries
            .get(id)
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))?;
        Ok(SessionInfo {
            id: id.to_string(),
            running: entry.running.as_ref().map(|r| r.message_id.clone()),
            age: entry.created_at.elapsed(),
        })
    }

    /// A copy of the session's last committed context.
    pub fn context(&self, id: &str) -> Result<C, SessionError> {
        self.table
            .lock()
            .entries
            .get(id)
            .map(|e| e.context.clone())
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))
    }

    /// Open session ids, oldest first.
    pub fn list(&self) -> Vec<String> {
        let table = self.table.lock();
        let mut ids: Vec<(&String, u64)> = table.entries.iter().map(|(id, e)| (id, e.seq)).collect();
        ids.sort_by_key(|(_, seq)| *seq);
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the session busy with `message_id` and hand out its context.
    ///
    /// Fails with `Busy` while another eval is in flight.
    pub fn begin_eval(&self, id: &str, message_id: &str) -> Result<(C, CancelToken), SessionError> {
        let mut table = self.table.lock();
        let entry = table
            .entries
            .get_mut(id)
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))?;
        if let Some(running) = &entry.running {
            return Err(SessionError::Busy {
                session: id.to_string(),
                running: running.message_id.clone(),
            });
        }
        let cancel = CancelToken::new();
        entry.running = Some(RunningEval {
            message_id: message_id.to_string(),
            cancel: cancel.clone(),
        });
        Ok((entry.context.clone(), cancel))
    }

    /// Clear the busy mark set by `begin_eval`, committing `context` if given.
    ///
    /// A session closed meanwhile stays closed.
    pub fn finish_eval(&self, id: &str, message_id: &str, context: Option<C>) {
        let mut table = self.table.lock();
        let Some(entry) = table.entries.get_mut(id) else {
            return;
        };
        if entry.running.as_ref().map(|r| r.message_id.as_str()) != Some(message_id) {
            return;
        }
        entry.running = None;
        if let Some(context) = context {
            entry.context = context;
        }
    }

    /// Request cancellation of the eval running in `id`.
    ///
    /// With `target` set, only an eval with that request id is interrupted.
    pub fn interrupt(&self, id: &str, target: Option<&str>) -> Result<InterruptOutcome, SessionError> {
        let table = self.table.lock();
        let entry = table
            .entries
            .get(id)
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))?;
        let Some(running) = &entry.running else {
            return Ok(InterruptOutcome::Idle);
        };
        match target {
            Some(t) if t != running.message_id => Ok(InterruptOutcome::Mismatch {
                running: running.message_id.clone(),
            }),
            _ => {
                running.cancel.cancel();
                debug!(session = %id, id = %running.message_id, "interrupt requested");
                Ok(InterruptOutcome::Requested {
                    message_id: running.message_id.clone(),
                })
            }
        }
    }

    /// Close every session; returns how many were open.
    pub fn close_all(&self) -> usize {
        let drained: Vec<(String, SessionEntry<C>)> = self.table.lock().entries.drain().collect();
        for (_, entry) in &drained {
            if let Some(running) = &entry.running {
                running.cancel.cancel();
            }
        }
        drained.len()
    }
}

impl<C: Clone + Default> Default for SessionManager<C> {
    fn default() -> Self {
        SessionManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Bindings = Vec<(String, i64)>;

    #[test]
    fn clone_copies_then_diverges() {
        let sessions: SessionManager<Bindings> = SessionManager::new();
        let source = sessions.create();

        let (mut ctx, _) = sessions.begin_eval(&source, "m1").unwrap();
        ctx.push(("x".into(), 1));
        sessions.finish_eval(&source, "m1", Some(ctx));

        let branch = sessions.clone_session(&source).unwrap();
        let (mut ctx, _) = sessions.begin_eval(&branch, "m2").unwrap();
        ctx.push(("y".into(), 2));
        sessions.finish_eval(&branch, "m2", Some(ctx));

        assert_eq!(sessions.context(&source).unwrap(), vec![("x".to_string(), 1)]);
        assert_eq!(sessions.context(&branch).unwrap().len(), 2);
        assert_eq!(sessions.list(), vec![source, branch]);
    }

    #[test]
    fn clone_of_unknown_session_fails() {
        let sessions: SessionManager<Bindings> = SessionManager::new();
        assert_eq!(
            sessions.clone_session("nope"),
            Err(SessionError::UnknownSession("nope".into()))
        );
        assert!(sessions.is_empty());
    }

    #[test]
    fn one_eval_at_a_time() {
        let sessions: SessionManager<Bindings> = SessionManager::new();
        let id = sessions.create();
        sessions.begin_eval(&id, "first").unwrap();
        assert_eq!(
            sessions.begin_eval(&id, "second").unwrap_err(),
            SessionError::Busy {
                session: id.clone(),
                running: "first".into()
            }
        );
        // A stale finish for the rejected request must not free the session
        sessions.finish_eval(&id, "second", None);
        assert_eq!(sessions.get(&id).unwrap().running.as_deref(), Some("first"));

        sessions.finish_eval(&id, "first", None);
        assert!(sessions.begin_eval(&id, "third").is_ok());
    }

    #[test]
    fn close_is_idempotent_and_cancels() {
        let sessions: SessionManager<Bindings> = SessionManager::new();
        let id = sessions.create();
        let (_, cancel) = sessions.begin_eval(&id, "m").unwrap();

        assert!(sessions.close(&id));
        assert!(cancel.is_cancelled());
        assert!(!sessions.close(&id));
        assert!(sessions.get(&id).is_err());
        // Finishing after close does not resurrect the session
        sessions.finish_eval(&id, "m", Some(Vec::new()));
        assert!(sessions.get(&id).is_err());
    }

    #[test]
    fn interrupt_targets_by_request_id() {
        let sessions: SessionManager<Bindings> = SessionManager::new();
        let id = sessions.create();
        assert_eq!(sessions.interrupt(&id, None), Ok(InterruptOutcome::Idle));

        let (_, cancel) = sessions.begin_eval(&id, "long").unwrap();
        assert_eq!(
            sessions.interrupt(&id, Some("other")),
            Ok(InterruptOutcome::Mismatch {
                running: "long".into()
            })
        );
        assert!(!cancel.is_cancelled());
        assert_eq!(
            sessions.interrupt(&id, Some("long")),
            Ok(InterruptOutcome::Requested {
                message_id: "long".into()
            })
        );
        assert!(cancel.is_cancelled());
        assert!(sessions.interrupt("missing", None).is_err());
    }
}

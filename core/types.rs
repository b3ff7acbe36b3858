// Core types shared by the server and the client - no I/O
use std::fmt;

/// Protocol version advertised by `describe`.
pub const PROTOCOL_VERSION: (i64, i64, i64) = (1, 1, 0);

/// One value inside a message.
///
/// Byte strings that are valid UTF-8 always decode as [`Value::Str`].
/// The wire has a single byte-string type, so `Str` and `Bytes` with the
/// same bytes compare equal.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(Message),
}

impl Value {
    /// Raw bytes of a `Str` or `Bytes` value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Str(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Build a byte-string value, preferring the text form when possible.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(s) => Value::Str(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Message> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => match (self.as_bytes(), other.as_bytes()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl Eq for Value {}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<Message> for Value {
    fn from(m: Message) -> Self {
        Value::Map(m)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::List(items.into_iter().map(Value::Str).collect())
    }
}

impl From<StatusSet> for Value {
    fn from(status: StatusSet) -> Self {
        Value::List(status.iter().map(|s| Value::Str(s.as_str().to_string())).collect())
    }
}

/// An ordered string-keyed mapping: the unit of the wire protocol.
///
/// Keys keep their insertion order. Inserting an existing key replaces the
/// value in place, so a key appears at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    entries: Vec<(String, Value)>,
}

impl Message {
    pub fn new() -> Self {
        Message { entries: Vec::new() }
    }

    /// A request carrying only its `op`.
    pub fn request(op: Op) -> Self {
        Message::new().with("op", op.as_str())
    }

    /// Builder form of [`Message::insert`].
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn id(&self) -> Option<&str> {
        self.get_str("id")
    }

    pub fn session(&self) -> Option<&str> {
        self.get_str("session")
    }

    pub fn op(&self) -> Option<Op> {
        self.get_str("op").map(Op::parse)
    }

    pub fn code(&self) -> Option<&str> {
        self.get_str("code")
    }

    pub fn value(&self) -> Option<&str> {
        self.get_str("value")
    }

    /// Status tags carried by this message; empty when absent.
    pub fn status(&self) -> StatusSet {
        let mut set = StatusSet::new();
        if let Some(items) = self.get("status").and_then(Value::as_list) {
            for tag in items.iter().filter_map(Value::as_str) {
                set.insert(Status::parse(tag));
            }
        }
        set
    }

    pub fn set_status(&mut self, status: StatusSet) {
        self.insert("status", status);
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

/// Operation named by a request's `op`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    Eval,
    LoadFile,
    Clone,
    Close,
    Describe,
    Interrupt,
    LsSessions,
    Unknown(String),
}

impl Op {
    /// Every operation the server recognizes, in `describe` order.
    pub const KNOWN: [Op; 7] = [
        Op::Eval,
        Op::LoadFile,
        Op::Clone,
        Op::Close,
        Op::Describe,
        Op::Interrupt,
        Op::LsSessions,
    ];

    pub fn parse(s: &str) -> Self {
        match s {
            "eval" => Op::Eval,
            "load-file" => Op::LoadFile,
            "clone" => Op::Clone,
            "close" => Op::Close,
            "describe" => Op::Describe,
            "interrupt" => Op::Interrupt,
            "ls-sessions" => Op::LsSessions,
            other => Op::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Op::Eval => "eval",
            Op::LoadFile => "load-file",
            Op::Clone => "clone",
            Op::Close => "close",
            Op::Describe => "describe",
            Op::Interrupt => "interrupt",
            Op::LsSessions => "ls-sessions",
            Op::Unknown(s) => s,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outcome tag inside a `status` list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    Done,
    Error,
    EvalError,
    Interrupted,
    SessionBusy,
    SessionIdle,
    UnknownOp,
    UnknownSession,
    NoCode,
    Other(String),
}

impl Status {
    pub fn parse(s: &str) -> Self {
        match s {
            "done" => Status::Done,
            "error" => Status::Error,
            "eval-error" => Status::EvalError,
            "interrupted" => Status::Interrupted,
            "session-busy" => Status::SessionBusy,
            "session-idle" => Status::SessionIdle,
            "unknown-op" => Status::UnknownOp,
            "unknown-session" => Status::UnknownSession,
            "no-code" => Status::NoCode,
            other => Status::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Status::Done => "done",
            Status::Error => "error",
            Status::EvalError => "eval-error",
            Status::Interrupted => "interrupted",
            Status::SessionBusy => "session-busy",
            Status::SessionIdle => "session-idle",
            Status::UnknownOp => "unknown-op",
            Status::UnknownSession => "unknown-session",
            Status::NoCode => "no-code",
            Status::Other(s) => s,
        }
    }

    /// Tags after which no further responses for the same id are sent.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Done | Status::Interrupted | Status::UnknownSession)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of status tags. Iteration follows first insertion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSet(Vec<Status>);

impl StatusSet {
    pub fn new() -> Self {
        StatusSet(Vec::new())
    }

    pub fn of(tags: &[Status]) -> Self {
        let mut set = StatusSet::new();
        for tag in tags {
            set.insert(tag.clone());
        }
        set
    }

    pub fn insert(&mut self, tag: Status) {
        if !self.0.contains(&tag) {
            self.0.push(tag);
        }
    }

    pub fn extend(&mut self, other: &StatusSet) {
        for tag in other.iter() {
            self.insert(tag.clone());
        }
    }

    pub fn contains(&self, tag: &Status) -> bool {
        self.0.contains(tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Status> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_terminal(&self) -> bool {
        self.0.iter().any(Status::is_terminal)
    }

    /// Order-insensitive comparison against a list of tags.
    pub fn same_tags(&self, tags: &[Status]) -> bool {
        self.0.len() == StatusSet::of(tags).len() && tags.iter().all(|t| self.contains(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_strings_compare_by_content() {
        assert_eq!(Value::Bytes(b"ok".to_vec()), Value::from("ok"));
        assert_ne!(Value::Bytes(vec![0xff]), Value::from("ok"));
        assert_ne!(Value::from("1"), Value::Int(1));
        assert_eq!(
            Value::List(vec![Value::Bytes(b"a".to_vec())]),
            Value::List(vec!["a".into()])
        );
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut msg = Message::request(Op::Eval).with("code", "(+ 1 2)").with("id", "a");
        msg.insert("code", "(+ 3 4)");
        let keys: Vec<&str> = msg.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["op", "code", "id"]);
        assert_eq!(msg.code(), Some("(+ 3 4)"));
    }

    #[test]
    fn status_is_a_set() {
        let mut msg = Message::new();
        msg.insert(
            "status",
            Value::List(vec!["done".into(), "eval-error".into(), "done".into()]),
        );
        let status = msg.status();
        assert_eq!(status.len(), 2);
        assert!(status.same_tags(&[Status::EvalError, Status::Done]));
        assert!(status.is_terminal());
    }

    #[test]
    fn error_alone_is_not_terminal() {
        let status = StatusSet::of(&[Status::Error, Status::EvalError]);
        assert!(!status.is_terminal());
        assert!(StatusSet::of(&[Status::Interrupted]).is_terminal());
    }

    #[test]
    fn unknown_names_survive_parsing() {
        assert_eq!(Op::parse("frobnicate"), Op::Unknown("frobnicate".into()));
        assert_eq!(Op::parse("ls-sessions").as_str(), "ls-sessions");
        assert_eq!(Status::parse("custom").as_str(), "custom");
    }

    #[test]
    fn non_utf8_bytes_stay_bytes() {
        assert_eq!(Value::from_bytes(b"ok".to_vec()), Value::Str("ok".into()));
        assert_eq!(Value::from_bytes(vec![0xff, 0xfe]), Value::Bytes(vec![0xff, 0xfe]));
    }
}

// Wire codec - pure functions over byte buffers, no I/O
//
// Encoding (bencode):
//   integer     i<decimal>e          i42e, i-7e
//   byte string <len>:<bytes>        4:eval
//   list        l<items>e            l4:donee
//   map         d<key><value>...e    d2:op4:evale
//
// Every message is a top-level map. The encoding is self-delimiting, so the
// decoder finds message boundaries without an outer length prefix.
use crate::error::CodecError;
use crate::types::{Message, Value};

/// Deepest list/map nesting accepted by the decoder.
pub const MAX_DEPTH: usize = 64;

/// Longest byte string accepted by the decoder (32 MiB).
pub const MAX_STRING_LEN: usize = 32 * 1024 * 1024;

// i64::MIN has 20 characters including the sign
const MAX_INT_CHARS: usize = 20;
// Enough digits for MAX_STRING_LEN plus headroom to reject oversize lengths
const MAX_LEN_DIGITS: usize = 10;

pub fn encode(msg: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    encode_into(msg, &mut out);
    out
}

pub fn encode_into(msg: &Message, out: &mut Vec<u8>) {
    out.push(b'd');
    for (key, value) in msg.iter() {
        encode_bytes(key.as_bytes(), out);
        encode_value(value, out);
    }
    out.push(b'e');
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Str(s) => encode_bytes(s.as_bytes(), out),
        Value::Bytes(b) => encode_bytes(b, out),
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_value(item, out);
            }
            out.push(b'e');
        }
        Value::Map(m) => encode_into(m, out),
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

/// Decode one message starting at `offset`.
///
/// Returns `Ok(None)` when the buffer holds only a prefix of a message, and
/// `Ok(Some((message, consumed)))` once a full message is available, where
/// `consumed` counts bytes from `offset`. Never blocks; callers re-invoke it
/// as more bytes arrive.
pub fn decode(buf: &[u8], offset: usize) -> Result<Option<(Message, usize)>, CodecError> {
    if offset >= buf.len() {
        return Ok(None);
    }
    if buf[offset] != b'd' {
        return Err(CodecError::malformed(offset, "message must be a map"));
    }

    let mut parser = Parser { buf, pos: offset };
    match parser.map(0) {
        Ok(msg) => Ok(Some((msg, parser.pos - offset))),
        Err(Step::Incomplete) => Ok(None),
        Err(Step::Malformed(e)) => Err(e),
    }
}

enum Step {
    Incomplete,
    Malformed(CodecError),
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8, Step> {
        self.buf.get(self.pos).copied().ok_or(Step::Incomplete)
    }

    fn malformed<T>(&self, reason: &str) -> Result<T, Step> {
        Err(Step::Malformed(CodecError::malformed(self.pos, reason)))
    }

    fn value(&mut self, depth: usize) -> Result<Value, Step> {
        match self.peek()? {
            b'i' => self.int().map(Value::Int),
            b'l' => self.list(depth + 1),
            b'd' => self.map(depth + 1).map(Value::Map),
            b'0'..=b'9' => self.bytes().map(|b| Value::from_bytes(b.to_vec())),
            _ => self.malformed("unexpected type marker"),
        }
    }

    // Scan up to `terminator`, allowing only `allowed` bytes before it
    fn scan_until(
        &mut self,
        terminator: u8,
        max_len: usize,
        allowed: impl Fn(usize, u8) -> bool,
    ) -> Result<&'a [u8], Step> {
        let start = self.pos;
        let mut idx = start;
        loop {
            let Some(&b) = self.buf.get(idx) else {
                return Err(Step::Incomplete);
            };
            if b == terminator {
                break;
            }
            if idx - start >= max_len || !allowed(idx - start, b) {
                self.pos = idx;
                return self.malformed("invalid digit sequence");
            }
            idx += 1;
        }
        self.pos = idx + 1;
        let buf = self.buf;
        Ok(&buf[start..idx])
    }

    fn int(&mut self) -> Result<i64, Step> {
        self.pos += 1;
        let start = self.pos;
        let digits = self.scan_until(b'e', MAX_INT_CHARS, |i, b| {
            b.is_ascii_digit() || (i == 0 && b == b'-')
        })?;
        let text = std::str::from_utf8(digits).unwrap_or_default();
        let unsigned = text.strip_prefix('-').unwrap_or(text);
        let canonical = !unsigned.is_empty()
            && !(unsigned.len() > 1 && unsigned.starts_with('0'))
            && text != "-0";
        match text.parse::<i64>() {
            Ok(n) if canonical => Ok(n),
            _ => Err(Step::Malformed(CodecError::malformed(
                start,
                format!("invalid integer {:?}", text),
            ))),
        }
    }

    fn bytes(&mut self) -> Result<&'a [u8], Step> {
        let start = self.pos;
        let digits = self.scan_until(b':', MAX_LEN_DIGITS, |_, b| b.is_ascii_digit())?;
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(Step::Malformed(CodecError::malformed(start, "length has leading zero")));
        }
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(usize::MAX);
        if len > MAX_STRING_LEN {
            return Err(Step::Malformed(CodecError::malformed(
                start,
                format!("byte string of {} bytes exceeds limit", len),
            )));
        }
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(Step::Incomplete);
        }
        let buf = self.buf;
        let bytes = &buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, Step> {
        if depth > MAX_DEPTH {
            return self.malformed("nesting too deep");
        }
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(Value::List(items));
            }
            items.push(self.value(depth)?);
        }
    }

    fn map(&mut self, depth: usize) -> Result<Message, Step> {
        if depth > MAX_DEPTH {
            return self.malformed("nesting too deep");
        }
        self.pos += 1;
        let mut msg = Message::new();
        loop {
            match self.peek()? {
                b'e' => {
                    self.pos += 1;
                    return Ok(msg);
                }
                b'0'..=b'9' => {}
                _ => return self.malformed("map key must be a byte string"),
            }
            let key_at = self.pos;
            let key = match std::str::from_utf8(self.bytes()?) {
                Ok(k) => k.to_string(),
                Err(_) => {
                    return Err(Step::Malformed(CodecError::malformed(
                        key_at,
                        "map key is not UTF-8",
                    )))
                }
            };
            let value = self.value(depth)?;
            msg.insert(&key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Op, Status, StatusSet};
    use proptest::prelude::*;

    fn sample() -> Message {
        Message::request(Op::Eval)
            .with("id", "42")
            .with("code", "(+ 3 4)")
            .with("line", -3)
    }

    #[test]
    fn encodes_in_key_order() {
        let bytes = encode(&sample());
        assert_eq!(bytes, b"d2:op4:eval2:id2:424:code7:(+ 3 4)4:linei-3ee".to_vec());
    }

    #[test]
    fn every_strict_prefix_is_incomplete() {
        let bytes = encode(&sample());
        for cut in 0..bytes.len() {
            assert_eq!(decode(&bytes[..cut], 0), Ok(None), "prefix of {} bytes", cut);
        }
        let (msg, used) = decode(&bytes, 0).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(msg, sample());
    }

    #[test]
    fn decodes_back_to_back_messages_by_offset() {
        let mut status = Message::new().with("id", "1");
        status.set_status(StatusSet::of(&[Status::Done]));
        let mut buf = encode(&sample());
        let first_len = buf.len();
        buf.extend(encode(&status));

        let (first, used) = decode(&buf, 0).unwrap().unwrap();
        assert_eq!((first, used), (sample(), first_len));
        let (second, used2) = decode(&buf, used).unwrap().unwrap();
        assert_eq!(used + used2, buf.len());
        assert!(second.status().same_tags(&[Status::Done]));
        assert_eq!(decode(&buf, buf.len()), Ok(None));
    }

    #[test]
    fn nested_values() {
        let inner = Message::new().with("eval", Message::new());
        let msg = Message::new()
            .with("ops", inner)
            .with("sessions", vec!["a".to_string(), "b".to_string()]);
        let bytes = encode(&msg);
        assert_eq!(bytes, b"d3:opsd4:evaldee8:sessionsl1:a1:bee".to_vec());
        assert_eq!(decode(&bytes, 0).unwrap().unwrap().0, msg);
    }

    #[test]
    fn rejects_malformed_envelopes() {
        let cases: &[&[u8]] = &[
            b"l4:evale",
            b"d2:opx",
            b"di1ei2ee",
            b"d2:idi01ee",
            b"d2:idi-0ee",
            b"d2:idiee",
            b"d2:idi1-2ee",
            b"d02:id1:xe",
            b"d2:id99999999999:x",
            b"d2:\xff\xfe1:xe",
        ];
        for case in cases {
            match decode(case, 0) {
                Err(CodecError::MalformedMessage { .. }) => {}
                other => panic!("{:?} decoded as {:?}", String::from_utf8_lossy(case), other),
            }
        }
    }

    #[test]
    fn rejects_excessive_nesting() {
        let mut bytes = b"d1:x".to_vec();
        bytes.extend(std::iter::repeat(b'l').take(MAX_DEPTH + 1));
        bytes.extend(std::iter::repeat(b'e').take(MAX_DEPTH + 2));
        assert!(decode(&bytes, 0).is_err());
    }

    #[test]
    fn integer_extremes() {
        let msg = Message::new().with("min", i64::MIN).with("max", i64::MAX).with("zero", 0);
        assert_eq!(decode(&encode(&msg), 0).unwrap().unwrap().0, msg);
    }

    #[test]
    fn text_bytes_decode_equal_to_what_was_sent() {
        let msg = Message::new().with("payload", Value::Bytes(b"ok".to_vec()));
        let (decoded, _) = decode(&encode(&msg), 0).unwrap().unwrap();
        assert_eq!(decoded.get("payload"), Some(&Value::Str("ok".to_string())));
        assert_eq!(decoded, msg);
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<i64>().prop_map(Value::Int),
            ".{0,12}".prop_map(Value::Str),
            prop::collection::vec(any::<u8>(), 0..8).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
                prop::collection::vec(("[a-z-]{1,8}", inner), 0..6)
                    .prop_map(|pairs| Value::Map(message_from(pairs))),
            ]
        })
    }

    fn message_from(pairs: Vec<(String, Value)>) -> Message {
        let mut msg = Message::new();
        for (k, v) in pairs {
            msg.insert(&k, v);
        }
        msg
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(pairs in prop::collection::vec(("[a-z-]{1,8}", arb_value()), 0..8)) {
            let msg = message_from(pairs);
            let bytes = encode(&msg);
            let decoded = decode(&bytes, 0).unwrap().unwrap();
            prop_assert_eq!(decoded, (msg, bytes.len()));
        }
    }
}

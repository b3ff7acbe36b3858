// Evaluator adapter: the seam between the protocol and a host language
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between the dispatcher and one eval.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Which output stream a chunk of text belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Out,
    Err,
}

impl OutputStream {
    /// Message key carrying text for this stream.
    pub fn key(self) -> &'static str {
        match self {
            OutputStream::Out => "out",
            OutputStream::Err => "err",
        }
    }
}

/// Side channel an evaluator uses while running: output and cancellation.
pub struct EvalIo<'a> {
    emit: &'a mut dyn FnMut(OutputStream, &str),
    cancel: &'a CancelToken,
}

impl<'a> EvalIo<'a> {
    pub fn new(cancel: &'a CancelToken, emit: &'a mut dyn FnMut(OutputStream, &str)) -> Self {
        EvalIo { emit, cancel }
    }

    pub fn out(&mut self, text: &str) {
        (self.emit)(OutputStream::Out, text);
    }

    pub fn err(&mut self, text: &str) {
        (self.emit)(OutputStream::Err, text);
    }

    /// Long-running evaluations should poll this and stop promptly.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Result of one evaluation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalOutcome {
    /// Printed form of the last value produced.
    Value(String),
    /// The code raised; reported as message content, never as a fault.
    Exception { class: String, message: String },
}

/// A host language the server can evaluate code in.
///
/// `evaluate` runs on its own thread, off the connection's I/O path. It owns
/// `ctx` exclusively for the duration of the call.
pub trait Evaluator: Send + Sync + 'static {
    /// Per-session state such as bindings. Cloning it branches a session.
    type Context: Clone + Default + Send + 'static;

    fn name(&self) -> &str;

    fn evaluate(&self, code: &str, ctx: &mut Self::Context, io: &mut EvalIo<'_>) -> EvalOutcome;
}

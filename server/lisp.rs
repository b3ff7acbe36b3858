// Reference evaluator: a tiny prefix-expression language
//
// Stands in for a real host runtime so the daemon and tests have something
// to evaluate. Supports integers, strings, nil/true/false, `def`, `do`, `if`,
// `quote`, and a fixed table of builtins.
use crate::evaluator::{EvalIo, EvalOutcome, Evaluator};
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

// How often `sleep` checks for cancellation
const CANCEL_POLL: Duration = Duration::from_millis(10);

// Longest accepted `sleep`
const MAX_SLEEP: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Deepest list nesting the reader accepts or `list` builds. Reading and
/// evaluating recurse once per level, so this bounds stack use on the eval
/// thread.
pub const MAX_NESTING: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Symbol(String),
    List(Vec<Datum>),
    Var(String),
}

impl Datum {
    fn truthy(&self) -> bool {
        !matches!(self, Datum::Nil | Datum::Bool(false))
    }

    // Values never nest past MAX_NESTING, so this recursion is bounded
    fn depth(&self) -> usize {
        match self {
            Datum::List(items) => 1 + items.iter().map(Datum::depth).max().unwrap_or(0),
            _ => 0,
        }
    }

    /// Display form without string quoting, as used by `str` and `println`.
    fn plain(&self) -> String {
        match self {
            Datum::Str(s) => s.clone(),
            Datum::Nil => String::new(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Datum::Nil => f.write_str("nil"),
            Datum::Bool(b) => write!(f, "{}", b),
            Datum::Int(n) => write!(f, "{}", n),
            Datum::Str(s) => {
                f.write_str("\"")?;
                for c in s.chars() {
                    match c {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        c => write!(f, "{}", c)?,
                    }
                }
                f.write_str("\"")
            }
            Datum::Symbol(s) => f.write_str(s),
            Datum::List(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
            Datum::Var(name) => write!(f, "#'user/{}", name),
        }
    }
}

/// Session bindings.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    vars: BTreeMap<String, Datum>,
}

impl Namespace {
    /// Printed value of a var, if defined.
    pub fn lookup(&self, name: &str) -> Option<String> {
        self.vars.get(name).map(|d| d.to_string())
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

#[derive(Debug)]
struct Thrown {
    class: &'static str,
    message: String,
}

impl Thrown {
    fn new(class: &'static str, message: impl Into<String>) -> Self {
        Thrown {
            class,
            message: message.into(),
        }
    }
}

type Builtin = fn(&[Datum], &mut EvalIo<'_>) -> Result<Datum, Thrown>;

static BUILTINS: Lazy<HashMap<&'static str, Builtin>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, Builtin> = HashMap::new();
    table.insert("+", |args, _| fold_ints(args, 0, i64::checked_add));
    table.insert("*", |args, _| fold_ints(args, 1, i64::checked_mul));
    table.insert("-", |args, _| match args {
        [single] => Ok(Datum::Int(int(single)?.checked_neg().ok_or_else(overflow)?)),
        [first, rest @ ..] => fold_ints(rest, int(first)?, i64::checked_sub),
        [] => Err(arity("-")),
    });
    table.insert("/", |args, _| match args {
        [first, rest @ ..] if !rest.is_empty() => {
            let mut acc = int(first)?;
            for d in rest {
                let n = int(d)?;
                if n == 0 {
                    return Err(Thrown::new("ArithmeticException", "Divide by zero"));
                }
                acc = acc.checked_div(n).ok_or_else(overflow)?;
            }
            Ok(Datum::Int(acc))
        }
        _ => Err(arity("/")),
    });
    table.insert("inc", |args, _| match args {
        [n] => Ok(Datum::Int(int(n)?.checked_add(1).ok_or_else(overflow)?)),
        _ => Err(arity("inc")),
    });
    table.insert("=", |args, _| {
        Ok(Datum::Bool(args.windows(2).all(|w| w[0] == w[1])))
    });
    table.insert("<", |args, _| compare(args, |a, b| a < b));
    table.insert(">", |args, _| compare(args, |a, b| a > b));
    table.insert("<=", |args, _| compare(args, |a, b| a <= b));
    table.insert(">=", |args, _| compare(args, |a, b| a >= b));
    table.insert("str", |args, _| {
        Ok(Datum::Str(args.iter().map(Datum::plain).collect()))
    });
    table.insert("list", |args, _| {
        let list = Datum::List(args.to_vec());
        if list.depth() > MAX_NESTING {
            return Err(too_deep());
        }
        Ok(list)
    });
    table.insert("print", |args, io| {
        io.out(&joined(args));
        Ok(Datum::Nil)
    });
    table.insert("println", |args, io| {
        io.out(&format!("{}\n", joined(args)));
        Ok(Datum::Nil)
    });
    table.insert("eprintln", |args, io| {
        io.err(&format!("{}\n", joined(args)));
        Ok(Datum::Nil)
    });
    table.insert("sleep", |args, io| match args {
        [ms] => {
            let wait = Duration::from_millis(int(ms)?.max(0) as u64);
            if wait > MAX_SLEEP {
                return Err(Thrown::new("ArithmeticException", "sleep duration out of range"));
            }
            let deadline = Instant::now().checked_add(wait).ok_or_else(overflow)?;
            while Instant::now() < deadline {
                if io.is_cancelled() {
                    return Err(interrupted());
                }
                thread::sleep(CANCEL_POLL.min(deadline.saturating_duration_since(Instant::now())));
            }
            Ok(Datum::Nil)
        }
        _ => Err(arity("sleep")),
    });
    table.insert("throw", |args, _| {
        Err(Thrown::new("ExceptionInfo", joined(args)))
    });
    table
});

fn joined(args: &[Datum]) -> String {
    args.iter().map(Datum::plain).collect::<Vec<_>>().join(" ")
}

fn int(d: &Datum) -> Result<i64, Thrown> {
    match d {
        Datum::Int(n) => Ok(*n),
        other => Err(Thrown::new(
            "ClassCastException",
            format!("{} cannot be cast to a number", other),
        )),
    }
}

fn fold_ints(args: &[Datum], init: i64, op: fn(i64, i64) -> Option<i64>) -> Result<Datum, Thrown> {
    let mut acc = init;
    for d in args {
        acc = op(acc, int(d)?).ok_or_else(overflow)?;
    }
    Ok(Datum::Int(acc))
}

fn compare(args: &[Datum], ok: fn(i64, i64) -> bool) -> Result<Datum, Thrown> {
    let nums = args.iter().map(int).collect::<Result<Vec<_>, _>>()?;
    Ok(Datum::Bool(nums.windows(2).all(|w| ok(w[0], w[1]))))
}

fn overflow() -> Thrown {
    Thrown::new("ArithmeticException", "integer overflow")
}

fn too_deep() -> Thrown {
    Thrown::new("ReaderException", format!("Nesting exceeds {} levels", MAX_NESTING))
}

fn arity(name: &str) -> Thrown {
    Thrown::new("ArityException", format!("Wrong number of args passed to: {}", name))
}

fn interrupted() -> Thrown {
    Thrown::new("InterruptedException", "evaluation interrupted")
}

// Reader

fn tokenize(code: &str) -> Result<Vec<Token>, Thrown> {
    let mut tokens = Vec::new();
    let mut chars = code.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() || c == ',' => {
                chars.next();
            }
            ';' => {
                while chars.next_if(|&c| c != '\n').is_some() {}
            }
            '(' | ')' | '\'' => {
                chars.next();
                tokens.push(Token::Punct(c));
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => return Err(eof()),
                        },
                        Some(other) => s.push(other),
                        None => return Err(eof()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            _ => {
                let mut atom = String::new();
                while let Some(c) = chars.next_if(|&c| !c.is_whitespace() && !"()'\";,".contains(c)) {
                    atom.push(c);
                }
                tokens.push(Token::Atom(atom));
            }
        }
    }
    Ok(tokens)
}

enum Token {
    Punct(char),
    Str(String),
    Atom(String),
}

fn eof() -> Thrown {
    Thrown::new("ReaderException", "EOF while reading")
}

fn read_forms(code: &str) -> Result<Vec<Datum>, Thrown> {
    let tokens = tokenize(code)?;
    let mut pos = 0;
    let mut forms = Vec::new();
    while pos < tokens.len() {
        forms.push(read_form(&tokens, &mut pos, 0)?);
    }
    Ok(forms)
}

fn read_form(tokens: &[Token], pos: &mut usize, depth: usize) -> Result<Datum, Thrown> {
    let token = tokens.get(*pos).ok_or_else(eof)?;
    *pos += 1;
    if matches!(token, Token::Punct('(' | '\'')) && depth >= MAX_NESTING {
        return Err(too_deep());
    }
    match token {
        Token::Punct('(') => {
            let mut items = Vec::new();
            loop {
                match tokens.get(*pos) {
                    Some(Token::Punct(')')) => {
                        *pos += 1;
                        return Ok(Datum::List(items));
                    }
                    Some(_) => items.push(read_form(tokens, pos, depth + 1)?),
                    None => return Err(eof()),
                }
            }
        }
        Token::Punct('\'') => {
            let quoted = read_form(tokens, pos, depth + 1)?;
            Ok(Datum::List(vec![Datum::Symbol("quote".into()), quoted]))
        }
        Token::Punct(c) => Err(Thrown::new("ReaderException", format!("Unmatched delimiter: {}", c))),
        Token::Str(s) => Ok(Datum::Str(s.clone())),
        Token::Atom(a) => Ok(match a.as_str() {
            "nil" => Datum::Nil,
            "true" => Datum::Bool(true),
            "false" => Datum::Bool(false),
            _ => match a.parse::<i64>() {
                Ok(n) => Datum::Int(n),
                Err(_) => Datum::Symbol(a.clone()),
            },
        }),
    }
}

/// The reference evaluator used by the daemon.
#[derive(Debug, Clone, Copy, Default)]
pub struct LispEvaluator;

impl LispEvaluator {
    fn eval(&self, form: &Datum, ns: &mut Namespace, io: &mut EvalIo<'_>) -> Result<Datum, Thrown> {
        if io.is_cancelled() {
            return Err(interrupted());
        }
        let items = match form {
            Datum::Symbol(name) => {
                return ns.vars.get(name).cloned().ok_or_else(|| {
                    Thrown::new(
                        "CompilerException",
                        format!("Unable to resolve symbol: {} in this context", name),
                    )
                })
            }
            Datum::List(items) if !items.is_empty() => items,
            other => return Ok(other.clone()),
        };

        let Datum::Symbol(head) = &items[0] else {
            return Err(Thrown::new("ClassCastException", format!("{} is not a function", items[0])));
        };
        let args = &items[1..];
        match head.as_str() {
            "quote" => match args {
                [quoted] => Ok(quoted.clone()),
                _ => Err(arity("quote")),
            },
            "def" => match args {
                [Datum::Symbol(name), expr] => {
                    let value = self.eval(expr, ns, io)?;
                    ns.vars.insert(name.clone(), value);
                    Ok(Datum::Var(name.clone()))
                }
                _ => Err(Thrown::new("CompilerException", "def expects a symbol and a value")),
            },
            "do" => {
                let mut last = Datum::Nil;
                for expr in args {
                    last = self.eval(expr, ns, io)?;
                }
                Ok(last)
            }
            "if" => match args {
                [cond, then, rest @ ..] if rest.len() <= 1 => {
                    if self.eval(cond, ns, io)?.truthy() {
                        self.eval(then, ns, io)
                    } else {
                        rest.first().map_or(Ok(Datum::Nil), |e| self.eval(e, ns, io))
                    }
                }
                _ => Err(arity("if")),
            },
            name => {
                let builtin = BUILTINS.get(name).ok_or_else(|| {
                    Thrown::new(
                        "CompilerException",
                        format!("Unable to resolve symbol: {} in this context", name),
                    )
                })?;
                let values = args
                    .iter()
                    .map(|a| self.eval(a, ns, io))
                    .collect::<Result<Vec<_>, _>>()?;
                builtin(&values, io)
            }
        }
    }
}

impl Evaluator for LispEvaluator {
    type Context = Namespace;

    fn name(&self) -> &str {
        "nrepl-lisp"
    }

    fn evaluate(&self, code: &str, ns: &mut Namespace, io: &mut EvalIo<'_>) -> EvalOutcome {
        let result = read_forms(code).and_then(|forms| {
            let mut last = Datum::Nil;
            for form in &forms {
                last = self.eval(form, ns, io)?;
            }
            Ok(last)
        });
        match result {
            Ok(value) => EvalOutcome::Value(value.to_string()),
            Err(thrown) => EvalOutcome::Exception {
                class: thrown.class.to_string(),
                message: thrown.message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{CancelToken, OutputStream};

    fn run(code: &str, ns: &mut Namespace) -> (EvalOutcome, Vec<(OutputStream, String)>) {
        let cancel = CancelToken::new();
        let mut output = Vec::new();
        let mut emit = |stream: OutputStream, text: &str| output.push((stream, text.to_string()));
        let outcome = {
            let mut io = EvalIo::new(&cancel, &mut emit);
            LispEvaluator.evaluate(code, ns, &mut io)
        };
        (outcome, output)
    }

    fn value(code: &str) -> String {
        match run(code, &mut Namespace::default()).0 {
            EvalOutcome::Value(v) => v,
            other => panic!("{} raised {:?}", code, other),
        }
    }

    #[test]
    fn arithmetic() {
        assert_eq!(value("(+ 3 4)"), "7");
        assert_eq!(value("(- 10 (* 2 3))"), "4");
        assert_eq!(value("(- 5)"), "-5");
        assert_eq!(value("(/ 9 2)"), "4");
        assert_eq!(value("(< 1 2 3)"), "true");
        assert_eq!(value(""), "nil");
    }

    #[test]
    fn strings_print_readably() {
        assert_eq!(value(r#"(str "a" 1 nil "b")"#), r#""a1b""#);
        assert_eq!(value(r#""say \"hi\"""#), r#""say \"hi\"""#);
        assert_eq!(value("'(1 two \"3\")"), r#"(1 two "3")"#);
    }

    #[test]
    fn def_persists_in_namespace() {
        let mut ns = Namespace::default();
        assert_eq!(run("(def x 5)", &mut ns).0, EvalOutcome::Value("#'user/x".into()));
        assert_eq!(run("(inc x)", &mut ns).0, EvalOutcome::Value("6".into()));
        assert_eq!(ns.lookup("x").as_deref(), Some("5"));
    }

    #[test]
    fn output_goes_to_streams() {
        let (outcome, output) = run(r#"(println "hello" 42) (eprintln "oops") 1"#, &mut Namespace::default());
        assert_eq!(outcome, EvalOutcome::Value("1".into()));
        assert_eq!(
            output,
            vec![
                (OutputStream::Out, "hello 42\n".to_string()),
                (OutputStream::Err, "oops\n".to_string()),
            ]
        );
    }

    #[test]
    fn errors_become_exceptions() {
        let cases = [
            ("(/ 1 0)", "ArithmeticException"),
            ("(throw \"boom\")", "ExceptionInfo"),
            ("undefined-thing", "CompilerException"),
            ("(+ 1", "ReaderException"),
            (")", "ReaderException"),
            ("(+ 1 \"a\")", "ClassCastException"),
            ("(sleep 9223372036854775807)", "ArithmeticException"),
        ];
        for (code, expected) in cases {
            match run(code, &mut Namespace::default()).0 {
                EvalOutcome::Exception { class, .. } => assert_eq!(class, expected, "{}", code),
                other => panic!("{} returned {:?}", code, other),
            }
        }
    }

    #[test]
    fn deep_nesting_is_a_reader_error() {
        let code = format!("{}{}", "(".repeat(200_000), ")".repeat(200_000));
        match run(&code, &mut Namespace::default()).0 {
            EvalOutcome::Exception { class, message } => {
                assert_eq!(class, "ReaderException");
                assert!(message.contains("Nesting"), "{}", message);
            }
            other => panic!("deep nesting returned {:?}", other),
        }
        let quotes = format!("{}1", "'".repeat(200_000));
        assert!(matches!(
            run(&quotes, &mut Namespace::default()).0,
            EvalOutcome::Exception { .. }
        ));

        let nested = format!("(quote {}{})", "(".repeat(MAX_NESTING - 1), ")".repeat(MAX_NESTING - 1));
        assert!(matches!(run(&nested, &mut Namespace::default()).0, EvalOutcome::Value(_)));
    }

    #[test]
    fn list_cannot_grow_past_the_nesting_limit() {
        let mut ns = Namespace::default();
        let mut code = String::from("(def x nil)");
        for _ in 0..MAX_NESTING + 10 {
            code.push_str(" (def x (list x))");
        }
        match run(&code, &mut ns).0 {
            EvalOutcome::Exception { class, .. } => assert_eq!(class, "ReaderException"),
            other => panic!("unbounded list returned {:?}", other),
        }
    }

    #[test]
    fn sleep_honors_cancellation() {
        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            canceller.cancel();
        });
        let mut emit = |_: OutputStream, _: &str| {};
        let mut io = EvalIo::new(&cancel, &mut emit);
        let started = Instant::now();
        let outcome = LispEvaluator.evaluate("(sleep 10000)", &mut Namespace::default(), &mut io);
        handle.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(outcome, EvalOutcome::Exception { ref class, .. } if class == "InterruptedException"));
    }
}

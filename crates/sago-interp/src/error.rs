//! Error kinds.
//!
//! Inside the step loop, unwinding is an explicit [`Panic`] payload carried
//! through `Result` returns. The runner classifies panics into the public
//! [`Error`] kinds at the outer boundary; an exit request is not an error
//! and becomes the process exit code.

use thiserror::Error;

use crate::value::Value;

/// A fault the interpreter itself detected (division by zero, index out of
/// range, failed type assertion, ...).
#[derive(Clone, Debug, Error, PartialEq)]
#[error("runtime error: {0}")]
pub struct RuntimeError(pub String);

/// The unwinding payload of the step loop.
#[derive(Clone, Debug)]
pub enum Panic {
    /// Interpreter-detected fault.
    Runtime(RuntimeError),
    /// The target program called `panic(v)`; the value is preserved.
    Target(Value),
    /// A bare string panic from the program side (wrapnilchk and friends).
    Plain(String),
    /// A failed value conversion, surfaced unchanged.
    Conversion(String),
    /// `os.Exit(n)` routed through the unwinder so defers still run.
    Exit(i32),
}

impl Panic {
    pub fn runtime(msg: impl Into<String>) -> Panic {
        Panic::Runtime(RuntimeError(msg.into()))
    }

    /// The value `recover()` yields for this panic. Exit requests are never
    /// consumed by recover, so they have no recovered form.
    pub fn recovered_value(&self) -> Value {
        match self {
            Panic::Target(v) => v.clone(),
            Panic::Runtime(e) => Value::from(e.to_string()),
            Panic::Plain(s) | Panic::Conversion(s) => Value::from(s.as_str()),
            Panic::Exit(_) => Value::Nil,
        }
    }
}

/// Public error kinds, per the error-handling design.
#[derive(Debug, Error)]
pub enum Error {
    /// Program load, link or interpreter construction failure.
    #[error("{0}")]
    Setup(String),
    /// A failure while running package init.
    #[error("init error: {0}")]
    Init(#[source] Box<Error>),
    #[error(transparent)]
    Runtime(RuntimeError),
    /// The program panicked with this value.
    #[error("{}", crate::value::format_value(.0))]
    Panic(Value),
    #[error("{0}")]
    Plain(String),
    #[error("{0}")]
    Conversion(String),
    /// The requested entrypoint does not exist.
    #[error("no function {0}")]
    NoFunction(String),
}

impl Error {
    /// Classify an escaped panic. `Exit` payloads must be mapped to exit
    /// codes before this point.
    pub fn from_panic(p: Panic) -> Error {
        match p {
            Panic::Runtime(e) => Error::Runtime(e),
            Panic::Target(v) => Error::Panic(v),
            Panic::Plain(s) => Error::Plain(s),
            Panic::Conversion(s) => Error::Conversion(s),
            Panic::Exit(code) => Error::Plain(format!("unexpected exit request: {}", code)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_display() {
        let e = RuntimeError("integer divide by zero".into());
        assert_eq!(e.to_string(), "runtime error: integer divide by zero");
    }

    #[test]
    fn test_recovered_values() {
        let p = Panic::Target(Value::from("boom"));
        assert_eq!(p.recovered_value(), Value::from("boom"));
        let p = Panic::runtime("index out of range [3]");
        assert_eq!(
            p.recovered_value(),
            Value::from("runtime error: index out of range [3]")
        );
        assert_eq!(Panic::Exit(3).recovered_value(), Value::Nil);
    }
}

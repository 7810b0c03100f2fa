use std::fmt;

/// The single recoverable, user-facing error kind produced by the HTTP
/// transaction engine. Caught at the top of request dispatch, logged, and
/// rendered to the client wrapped in `<pre>`.
#[derive(Debug, Clone)]
pub enum Pebkac {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    RangeNotSatisfiable(String),
    Unimplemented(String),
}

impl Pebkac {
    /// HTTP status line this error should be rendered with (REDESIGN FLAG:
    /// proper status codes instead of always-200, see DESIGN.md).
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            Pebkac::BadRequest(_) => (400, "Bad Request"),
            Pebkac::Forbidden(_) => (403, "Forbidden"),
            Pebkac::NotFound(_) => (404, "Not Found"),
            Pebkac::RangeNotSatisfiable(_) => (416, "Range Not Satisfiable"),
            Pebkac::Unimplemented(_) => (501, "Not Implemented"),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Pebkac::BadRequest(m)
            | Pebkac::Forbidden(m)
            | Pebkac::NotFound(m)
            | Pebkac::RangeNotSatisfiable(m)
            | Pebkac::Unimplemented(m) => m,
        }
    }
}

impl fmt::Display for Pebkac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for Pebkac {}

/// A dotted-path IPC destination that does not resolve to anything in the
/// receiver's service registry, or a `retq` whose correlation id is not in
/// the pending table. Fatal to the worker that raises it (see broker.rs).
#[derive(Debug, Clone)]
pub struct BrokerFatal(pub String);

impl fmt::Display for BrokerFatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broker invariant violation: {}", self.0)
    }
}

impl std::error::Error for BrokerFatal {}

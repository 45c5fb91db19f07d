//! Text wire format: one frame per connection, `;`-separated `key=value` pairs.
//!
//! Requests: `method=<token>;ip=<dotted-quad>`.
//! Responses: `code=<int>;reason=<text>`.
//!
//! Keys may appear in any order, unknown keys are ignored, empty segments are
//! skipped. A segment without `=` fails the whole frame.

use std::fmt;

const PAIR_DELIM: char = ';';
const KV_DELIM: char = '=';

pub const CODE_OK: i32 = 0;
pub const CODE_INVALID_METHOD: i32 = 1;
pub const CODE_INVALID_HOST: i32 = 2;
pub const CODE_MALFORMED_REQUEST: i32 = 3;
pub const CODE_EXECUTION_ERROR: i32 = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub ip: String,
}

impl Request {
    pub fn new(method: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ip: ip.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub code: i32,
    pub reason: String,
}

impl Response {
    pub fn new(code: i32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn ok(reason: impl Into<String>) -> Self {
        Self::new(CODE_OK, reason)
    }

    /// Generic reply for handler failures. Details stay in the server log.
    pub fn internal_error() -> Self {
        Self::new(CODE_EXECUTION_ERROR, "Internal error (see server logs)")
    }

    pub fn malformed(err: &ParseError) -> Self {
        Self::new(CODE_MALFORMED_REQUEST, format!("Malformed request: {err}"))
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A segment had no `=` separator.
    MissingSeparator(String),
    /// `code` was present but not an integer.
    InvalidCode(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSeparator(pair) => write!(f, "pair {pair:?} has no '{KV_DELIM}'"),
            Self::InvalidCode(code) => write!(f, "code {code:?} is not an integer"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Iterate `(key, value)` pairs, stopping at the first malformed segment.
fn pairs(text: &str) -> impl Iterator<Item = Result<(&str, &str), ParseError>> {
    text.split(PAIR_DELIM)
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            segment
                .split_once(KV_DELIM)
                .ok_or_else(|| ParseError::MissingSeparator(segment.to_string()))
        })
}

pub fn parse_request(text: &str) -> Result<Request, ParseError> {
    let mut request = Request::default();
    for pair in pairs(text) {
        match pair? {
            ("method", value) => request.method = value.to_string(),
            ("ip", value) => request.ip = value.to_string(),
            _ => {}
        }
    }
    Ok(request)
}

pub fn parse_response(text: &str) -> Result<Response, ParseError> {
    let mut response = Response::default();
    for pair in pairs(text) {
        match pair? {
            ("code", value) => {
                response.code = value
                    .parse()
                    .map_err(|_| ParseError::InvalidCode(value.to_string()))?;
            }
            ("reason", value) => response.reason = value.to_string(),
            _ => {}
        }
    }
    Ok(response)
}

pub fn compose_request(request: &Request) -> String {
    format!("method={};ip={}", request.method, request.ip)
}

pub fn compose_response(response: &Response) -> String {
    format!("code={};reason={}", response.code, response.reason)
}

//! The line protocol spoken over TCP.
//!
//! A request is a single `\n`-terminated line: an uppercase verb followed
//! by colon-separated fields. PV names themselves contain colons
//! (`BL02:SAMPLE:X`), so the value-bearing verbs split on the *last* colon
//! of the line; everything between the first colon and that one is the
//! target name.
//!
//! Responses are `OK`, `OK:<payload>`, `ERR:<code>` or, for monitor
//! pushes, `DATA:<value>`, each terminated by `\n`.

use std::fmt;

use thiserror::Error;

use crate::registry::PV_NAME_MAX;
use crate::utils::{format_value, parse_number};

/// Maximum bytes of a single request line. A client that sends this much
/// without a newline loses its session.
pub const CMD_BUFFER_SIZE: usize = 1024;
/// Upper bound on an encoded response line, header included; payloads
/// beyond it are truncated.
pub const RESPONSE_BUFFER_SIZE: usize = 4096;

/// A fully parsed request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    Quit,
    /// Cancel the session's monitor subscription, if any.
    Stop,
    List {
        pattern: Option<String>,
    },
    Get {
        target: String,
    },
    Status {
        target: String,
    },
    Put {
        target: String,
        value: f64,
    },
    Move {
        target: String,
        value: f64,
    },
    Monitor {
        target: String,
        interval_ms: u64,
    },
}

/// Why a request line failed to parse. Every variant surfaces on the wire
/// as `ERR:UNKNOWN_CMD`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty request")]
    Empty,
    #[error("unknown verb: {0:?}")]
    UnknownVerb(String),
    #[error("missing value field")]
    MissingValue,
    #[error("unparseable number: {0:?}")]
    BadNumber(String),
}

/// Parse one request line (without its newline).
pub fn parse(line: &str) -> Result<Command, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ParseError::Empty);
    }

    let Some((verb, rest)) = line.split_once(':') else {
        // Verbs that take no fields.
        return match line {
            "PING" => Ok(Command::Ping),
            "QUIT" => Ok(Command::Quit),
            "STOP" => Ok(Command::Stop),
            "LIST" => Ok(Command::List { pattern: None }),
            other => Err(ParseError::UnknownVerb(other.to_string())),
        };
    };

    match verb {
        "GET" => Ok(Command::Get {
            target: bounded_name(rest),
        }),
        "STATUS" => Ok(Command::Status {
            target: bounded_name(rest),
        }),
        "LIST" => Ok(Command::List {
            pattern: (!rest.is_empty()).then(|| bounded_name(rest)),
        }),
        "PUT" => {
            let (target, value) = split_value(rest)?;
            Ok(Command::Put { target, value })
        }
        "MOVE" => {
            let (target, value) = split_value(rest)?;
            Ok(Command::Move { target, value })
        }
        "MONITOR" => {
            let (target, value) = split_value(rest)?;
            // Fractional intervals truncate toward zero milliseconds.
            Ok(Command::Monitor {
                target,
                interval_ms: value as u64,
            })
        }
        other => Err(ParseError::UnknownVerb(other.to_string())),
    }
}

/// Split `<target>:<number>` on the last colon.
fn split_value(rest: &str) -> Result<(String, f64), ParseError> {
    let (target, tail) = rest.rsplit_once(':').ok_or(ParseError::MissingValue)?;
    let value = parse_number(tail).ok_or_else(|| ParseError::BadNumber(tail.to_string()))?;
    Ok((bounded_name(target), value))
}

/// Copy a name out of a request, truncating at the registry's name limit.
/// Over-long names therefore simply fail to resolve.
fn bounded_name(raw: &str) -> String {
    let mut name = raw.to_string();
    truncate_to_boundary(&mut name, PV_NAME_MAX - 1);
    name
}

fn truncate_to_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

impl fmt::Display for Command {
    /// The canonical wire form of the command, newline excluded.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Ping => write!(f, "PING"),
            Command::Quit => write!(f, "QUIT"),
            Command::Stop => write!(f, "STOP"),
            Command::List { pattern: None } => write!(f, "LIST"),
            Command::List {
                pattern: Some(pattern),
            } => write!(f, "LIST:{pattern}"),
            Command::Get { target } => write!(f, "GET:{target}"),
            Command::Status { target } => write!(f, "STATUS:{target}"),
            Command::Put { target, value } => {
                write!(f, "PUT:{target}:{}", format_value(*value))
            }
            Command::Move { target, value } => {
                write!(f, "MOVE:{target}:{}", format_value(*value))
            }
            Command::Monitor {
                target,
                interval_ms,
            } => write!(f, "MONITOR:{target}:{interval_ms}"),
        }
    }
}

/// Client-visible error codes, each with a fixed wire string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UnknownCmd,
    UnknownPv,
    InvalidValue,
    /// Reserved for hardware-style motor failures.
    MotorFault,
    /// Reserved for server-side faults.
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UnknownCmd => "UNKNOWN_CMD",
            ErrorCode::UnknownPv => "UNKNOWN_PV",
            ErrorCode::InvalidValue => "INVALID_VALUE",
            ErrorCode::MotorFault => "MOTOR_FAULT",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

/// A single response line to be framed back to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok,
    OkPayload(String),
    Err(ErrorCode),
    Data(f64),
}

impl Response {
    pub fn ok_with(payload: impl Into<String>) -> Response {
        Response::OkPayload(payload.into())
    }

    /// Render without the trailing newline; the line codec appends it.
    pub fn render(&self) -> String {
        let mut line = match self {
            Response::Ok => "OK".to_string(),
            Response::OkPayload(data) if data.is_empty() => "OK".to_string(),
            Response::OkPayload(data) => format!("OK:{data}"),
            Response::Err(code) => format!("ERR:{}", code.as_str()),
            Response::Data(value) => format!("DATA:{}", format_value(*value)),
        };
        truncate_to_boundary(&mut line, RESPONSE_BUFFER_SIZE - 1);
        line
    }
}

//! Handler results and their RESP encoding.
//!
//! Handlers return a [`Reply`]; the set of shapes is closed, so the encoder
//! below is total and there is no "unsupported result" path at runtime.

use crate::error::{Result, XdisError};
use crate::protocol::RespValue;
use bytes::Bytes;

/// Fixed status lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Pong,
    NoKey,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Pong => "PONG",
            Status::NoKey => "NOKEY",
        }
    }
}

/// Result value of a command handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Absent value; encoded as a null bulk string.
    Nil,
    Int(i64),
    Bulk(Bytes),
    Array(Vec<Reply>),
    Status(Status),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Status(Status::Ok)
    }

    pub fn bulk(b: impl Into<Bytes>) -> Self {
        Reply::Bulk(b.into())
    }

    /// `Nil` for `None`, `Bulk` otherwise.
    pub fn opt_bulk(b: Option<Bytes>) -> Self {
        b.map(Reply::Bulk).unwrap_or(Reply::Nil)
    }

    pub fn bool(b: bool) -> Self {
        Reply::Int(b as i64)
    }

    pub fn bulks<I: IntoIterator<Item = Bytes>>(items: I) -> Self {
        Reply::Array(items.into_iter().map(Reply::Bulk).collect())
    }

    pub fn ints<I: IntoIterator<Item = i64>>(items: I) -> Self {
        Reply::Array(items.into_iter().map(Reply::Int).collect())
    }
}

impl From<i64> for Reply {
    fn from(i: i64) -> Self {
        Reply::Int(i)
    }
}

impl From<Status> for Reply {
    fn from(s: Status) -> Self {
        Reply::Status(s)
    }
}

impl From<Reply> for RespValue {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Nil => RespValue::null_bulk_string(),
            Reply::Int(i) => RespValue::Integer(i),
            Reply::Bulk(b) => RespValue::BulkString(Some(b)),
            Reply::Array(items) => {
                RespValue::Array(Some(items.into_iter().map(RespValue::from).collect()))
            }
            Reply::Status(s) => RespValue::SimpleString(s.as_str().to_string()),
        }
    }
}

/// Map a handler outcome to the frame to write.
///
/// `None` means nothing is written: the handler signalled [`XdisError::Noop`]
/// because it already produced its own output.
pub fn encode(result: Result<Reply>) -> Option<RespValue> {
    match result {
        Ok(reply) => Some(reply.into()),
        Err(XdisError::Noop) => None,
        Err(e) => Some(RespValue::Error(e.to_string())),
    }
}

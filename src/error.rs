use thiserror::Error;

/// Errors produced while serving commands.
///
/// The `Display` text of every variant that can reach a client is exactly
/// the error line written on the wire (without the leading `-`).
#[derive(Error, Debug)]
pub enum XdisError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ERR Protocol error: {0}")]
    Protocol(String),

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArgCount(String),

    #[error("ERR value is not an integer or out of range")]
    Value,

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR syntax error in {0} option '{1}'")]
    SyntaxOption(String, String),

    #[error("ERR Protocol version is not an integer or out of range")]
    ProtocolVersion,

    #[error("NOPROTO unsupported protocol version")]
    UnsupportedProtocol,

    #[error("ERR Client sent AUTH, but no password is set")]
    NoPassword,

    #[error("ERR invalid password")]
    InvalidPassword,

    #[error("NOAUTH Authentication required.")]
    NotAuthenticated,

    #[error("ERR DB index is out of range")]
    DbIndex,

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR {0}")]
    InvalidArgument(String),

    /// Backend failure, surfaced verbatim.
    #[error("{0}")]
    Storage(String),

    /// Migration peer could not be reached or answered badly.
    #[error("IOERR {0}")]
    Network(String),

    /// Unreadable or invalid configuration file.
    #[error("config error: {0}")]
    Config(String),

    /// The handler already wrote its own reply (or none is due).
    #[error("no reply")]
    Noop,
}

pub type Result<T> = std::result::Result<T, XdisError>;

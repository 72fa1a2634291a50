//! xdis: a RESP command front-end with Codis-style slot migration over a
//! pluggable storage backend.

pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod migrate;
pub mod protocol;
pub mod reply;
pub mod server;
pub mod session;
pub mod storage;

pub use config::{Config, ServiceOptions};
pub use error::{Result, XdisError};
pub use server::{Server, Service};
pub use storage::{MemoryStorage, Storager};

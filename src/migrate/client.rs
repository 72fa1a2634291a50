//! Outbound RESP connection to a migration peer.

use crate::error::{Result, XdisError};
use crate::protocol::{RespParser, RespValue};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// A request/response connection where connect, write and every read are
/// bounded by the same timeout.
pub struct PeerClient {
    addr: String,
    stream: TcpStream,
    parser: RespParser,
    timeout: Duration,
}

impl PeerClient {
    pub async fn connect(addr: &str, io_timeout: Duration) -> Result<Self> {
        let stream = match timeout(io_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(XdisError::Network(format!("error connecting to {}: {}", addr, e)))
            }
            Err(_) => return Err(XdisError::Network(format!("timeout connecting to {}", addr))),
        };
        stream.set_nodelay(true)?;
        debug!(peer = addr, "connected to migration target");

        Ok(Self {
            addr: addr.to_string(),
            stream,
            parser: RespParser::new(4096),
            timeout: io_timeout,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one request and wait for its reply.
    pub async fn call(&mut self, request: &RespValue) -> Result<RespValue> {
        let data = request.serialize();
        match timeout(self.timeout, self.stream.write_all(&data)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.io_error("writing to", e)),
            Err(_) => return Err(self.timeout_error("writing to")),
        }

        loop {
            if let Some(reply) = self.parser.parse()? {
                return Ok(reply);
            }
            let read = timeout(self.timeout, self.stream.read_buf(self.parser.buffer_mut())).await;
            match read {
                Ok(Ok(0)) => {
                    return Err(XdisError::Network(format!(
                        "connection closed by {}",
                        self.addr
                    )))
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(self.io_error("reading from", e)),
                Err(_) => return Err(self.timeout_error("reading from")),
            }
        }
    }

    fn io_error(&self, action: &str, e: std::io::Error) -> XdisError {
        XdisError::Network(format!("error {} {}: {}", action, self.addr, e))
    }

    fn timeout_error(&self, action: &str) -> XdisError {
        XdisError::Network(format!("timeout {} {}", action, self.addr))
    }
}

use super::pubsub::{PubMessage, SUBSCRIBER_CAPACITY};
use super::Service;
use crate::error::{Result, XdisError};
use crate::protocol::{into_command, RespParser, RespValue};
use crate::reply::{self, Reply};
use crate::session::Session;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Connection mode. `Subscribed` is entered by the first (P)SUBSCRIBE and
/// never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionMode {
    Command,
    Subscribed,
}

enum Event {
    Read(std::io::Result<usize>),
    Message(Option<PubMessage>),
    Closed,
    Idle,
}

/// Per-client worker: reads frames, runs them through the service in
/// arrival order and writes the replies.
pub struct Connection {
    stream: TcpStream,
    parser: RespParser,
    service: Arc<Service>,
    session: Session,
    mode: ConnectionMode,
    channels: HashSet<Bytes>,
    patterns: HashSet<Bytes>,
    inbox: Option<(mpsc::Sender<PubMessage>, mpsc::Receiver<PubMessage>)>,
}

impl Connection {
    pub fn new(stream: TcpStream, service: Arc<Service>, session: Session) -> Self {
        Self {
            stream,
            parser: RespParser::new(8192),
            service,
            session,
            mode: ConnectionMode::Command,
            channels: HashSet::new(),
            patterns: HashSet::new(),
            inbox: None,
        }
    }

    /// Serves the connection until the peer leaves, QUIT, idle timeout or
    /// shutdown. The session is unregistered when the connection is
    /// dropped, which also covers a panicking handler.
    pub async fn handle(&mut self) -> Result<()> {
        loop {
            let keep_open = match self.mode {
                ConnectionMode::Command => self.handle_command_mode().await?,
                ConnectionMode::Subscribed => self.handle_subscribed_mode().await?,
            };
            if !keep_open {
                return Ok(());
            }
        }
    }

    /// Waits for input. Returns false when the connection should close.
    async fn handle_command_mode(&mut self) -> Result<bool> {
        if !self.process_buffered().await? {
            return Ok(false);
        }
        if self.mode != ConnectionMode::Command {
            return Ok(true);
        }

        let mut closed = self.session.close_signal();
        if *closed.borrow() {
            return Ok(false);
        }
        let idle = self.service.options().conn_keepalive_interval;
        let event = select! {
            n = self.stream.read_buf(self.parser.buffer_mut()) => Event::Read(n),
            _ = closed.changed() => Event::Closed,
            _ = idle_timeout(idle) => Event::Idle,
        };

        match event {
            Event::Read(Ok(0)) => Ok(false),
            Event::Read(Ok(_)) => Ok(true),
            Event::Read(Err(e)) => Err(e.into()),
            Event::Idle => {
                info!(client = self.session.addr(), idle_secs = idle.as_secs(), "closing idle connection");
                Ok(false)
            }
            Event::Closed | Event::Message(_) => Ok(false),
        }
    }

    /// Runs every complete frame in the buffer. Returns false when the
    /// connection should close.
    async fn process_buffered(&mut self) -> Result<bool> {
        while self.mode == ConnectionMode::Command {
            let frame = match self.parser.parse() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.write_frame(&RespValue::Error(e.to_string())).await?;
                    return Ok(false);
                }
            };
            if is_blank(&frame) {
                continue;
            }
            let (name, args) = match into_command(frame) {
                Ok(cmd) => cmd,
                Err(e) => {
                    self.write_frame(&RespValue::Error(e.to_string())).await?;
                    continue;
                }
            };

            if name.eq_ignore_ascii_case(b"subscribe") || name.eq_ignore_ascii_case(b"psubscribe") {
                if let Err(e) = self.service.check_auth(&self.session, &String::from_utf8_lossy(&name)) {
                    self.write_frame(&RespValue::Error(e.to_string())).await?;
                    continue;
                }
                if !self.handle_subscribe(&name, &args).await? {
                    return Ok(false);
                }
                continue;
            }

            let (result, peer_gone) = self.dispatch(&name, &args).await;
            if peer_gone {
                debug!(client = self.session.addr(), "peer left during command");
                return Ok(false);
            }
            if let Some(frame) = reply::encode(result) {
                self.write_frame(&frame).await?;
            }
            if self.session.is_closed() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Runs one command while still watching the socket, so that a peer
    /// hanging up during a blocking command closes the session and lets the
    /// command finish early. Bytes pipelined meanwhile stay buffered.
    async fn dispatch(&mut self, name: &Bytes, args: &[Bytes]) -> (Result<Reply>, bool) {
        let handle = self.session.handle().clone();
        let mut peer_gone = false;
        let dispatch = self.service.dispatch(&mut self.session, name, args);
        tokio::pin!(dispatch);
        let result = loop {
            select! {
                result = &mut dispatch => break result,
                n = self.stream.read_buf(self.parser.buffer_mut()), if !peer_gone => {
                    if !matches!(n, Ok(n) if n > 0) {
                        peer_gone = true;
                        let _ = handle.close();
                    }
                }
            }
        };
        (result, peer_gone)
    }

    async fn handle_subscribed_mode(&mut self) -> Result<bool> {
        loop {
            let frame = match self.parser.parse() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.write_frame(&RespValue::Error(e.to_string())).await?;
                    return Ok(false);
                }
            };
            if is_blank(&frame) {
                continue;
            }
            let (name, args) = match into_command(frame) {
                Ok(cmd) => cmd,
                Err(e) => {
                    self.write_frame(&RespValue::Error(e.to_string())).await?;
                    continue;
                }
            };
            if !self.handle_subscribed_command(&name, &args).await? {
                return Ok(false);
            }
        }

        let mut closed = self.session.close_signal();
        if *closed.borrow() {
            return Ok(false);
        }
        let event = match self.inbox.as_mut() {
            Some((_, rx)) => select! {
                msg = rx.recv() => Event::Message(msg),
                n = self.stream.read_buf(self.parser.buffer_mut()) => Event::Read(n),
                _ = closed.changed() => Event::Closed,
            },
            None => return Ok(false),
        };

        match event {
            Event::Message(Some(msg)) => {
                self.write_frame(&msg.to_frame()).await?;
                Ok(true)
            }
            Event::Read(Ok(0)) => Ok(false),
            Event::Read(Ok(_)) => Ok(true),
            Event::Read(Err(e)) => Err(e.into()),
            Event::Message(None) | Event::Closed | Event::Idle => Ok(false),
        }
    }

    async fn handle_subscribed_command(&mut self, name: &Bytes, args: &[Bytes]) -> Result<bool> {
        let lname = String::from_utf8_lossy(name).to_ascii_lowercase();
        match lname.as_str() {
            "subscribe" | "psubscribe" => self.handle_subscribe(name, args).await,
            "unsubscribe" => {
                self.unsubscribe(args, false).await?;
                Ok(true)
            }
            "punsubscribe" => {
                self.unsubscribe(args, true).await?;
                Ok(true)
            }
            "ping" => {
                let payload = args.first().cloned().unwrap_or_default();
                let frame = RespValue::array(vec![
                    RespValue::bulk_string("pong"),
                    RespValue::bulk_string(payload),
                ]);
                self.write_frame(&frame).await?;
                Ok(true)
            }
            "quit" => {
                self.write_frame(&RespValue::ok()).await?;
                Ok(false)
            }
            _ => {
                let err = XdisError::InvalidArgument(format!(
                    "Can't execute '{}': only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / QUIT are allowed in this context",
                    lname
                ));
                self.write_frame(&RespValue::Error(err.to_string())).await?;
                Ok(true)
            }
        }
    }

    /// SUBSCRIBE / PSUBSCRIBE: confirms each channel and switches the
    /// connection to subscribed mode.
    async fn handle_subscribe(&mut self, name: &Bytes, args: &[Bytes]) -> Result<bool> {
        let pattern = name.eq_ignore_ascii_case(b"psubscribe");
        let kind = if pattern { "psubscribe" } else { "subscribe" };
        if args.is_empty() {
            let err = XdisError::WrongArgCount(kind.to_string());
            self.write_frame(&RespValue::Error(err.to_string())).await?;
            return Ok(true);
        }

        let tx = self.subscriber().clone();
        let id = self.session.id();
        for channel in args {
            if pattern {
                self.service.pubsub().psubscribe(channel.clone(), id, tx.clone());
                self.patterns.insert(channel.clone());
            } else {
                self.service.pubsub().subscribe(channel.clone(), id, tx.clone());
                self.channels.insert(channel.clone());
            }
            let frame = self.confirmation(kind, Some(channel.clone()));
            self.write_frame(&frame).await?;
        }

        if self.mode == ConnectionMode::Command {
            debug!(client = self.session.addr(), "entering subscribed mode");
            self.mode = ConnectionMode::Subscribed;
        }
        Ok(true)
    }

    /// UNSUBSCRIBE / PUNSUBSCRIBE; no arguments means all of them.
    async fn unsubscribe(&mut self, args: &[Bytes], pattern: bool) -> Result<()> {
        let kind = if pattern { "punsubscribe" } else { "unsubscribe" };
        let targets: Vec<Bytes> = if args.is_empty() {
            let current = if pattern { &self.patterns } else { &self.channels };
            current.iter().cloned().collect()
        } else {
            args.to_vec()
        };

        if targets.is_empty() {
            let frame = self.confirmation(kind, None);
            return self.write_frame(&frame).await;
        }

        let id = self.session.id();
        for channel in targets {
            if pattern {
                self.service.pubsub().punsubscribe(&channel, id);
                self.patterns.remove(&channel);
            } else {
                self.service.pubsub().unsubscribe(&channel, id);
                self.channels.remove(&channel);
            }
            let frame = self.confirmation(kind, Some(channel));
            self.write_frame(&frame).await?;
        }
        Ok(())
    }

    fn subscriber(&mut self) -> &mpsc::Sender<PubMessage> {
        let (tx, _) = self
            .inbox
            .get_or_insert_with(|| mpsc::channel(SUBSCRIBER_CAPACITY));
        tx
    }

    /// `[kind, channel, subscription count]`
    fn confirmation(&self, kind: &str, channel: Option<Bytes>) -> RespValue {
        let count = (self.channels.len() + self.patterns.len()) as i64;
        RespValue::array(vec![
            RespValue::bulk_string(kind.to_string()),
            match channel {
                Some(c) => RespValue::bulk_string(c),
                None => RespValue::null_bulk_string(),
            },
            RespValue::integer(count),
        ])
    }

    async fn write_frame(&mut self, frame: &RespValue) -> Result<()> {
        let data = frame.serialize();
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.service.on_closed(&self.session);
    }
}

/// An empty inline line, which is skipped without a reply.
fn is_blank(frame: &RespValue) -> bool {
    matches!(frame, RespValue::Array(Some(items)) if items.is_empty())
}

async fn idle_timeout(idle: Duration) {
    if idle.is_zero() {
        std::future::pending::<()>().await
    } else {
        tokio::time::sleep(idle).await
    }
}

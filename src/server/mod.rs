//! Dispatch service and TCP acceptor.

pub mod connection;
pub mod info;
pub mod pubsub;

use self::connection::Connection;
use self::info::InfoRegistry;
use self::pubsub::PubSub;
use crate::command::{CmdContext, CommandRegistry, ServerOps};
use crate::config::ServiceOptions;
use crate::error::{Result, XdisError};
use crate::reply::Reply;
use crate::session::{Session, SessionHandle};
use crate::storage::{Db, Storager};
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Commands a session may run before it authenticates.
const AUTH_EXEMPT: [&str; 4] = ["auth", "hello", "ping", "quit"];

/// Shared state behind every connection: command registry, backend, live
/// sessions, pub/sub bus and INFO sections.
pub struct Service {
    registry: CommandRegistry,
    store: Arc<dyn Storager>,
    opts: ServiceOptions,
    sessions: Mutex<HashMap<u64, SessionHandle>>,
    pubsub: PubSub,
    info: InfoRegistry,
    started: Instant,
}

impl Service {
    pub fn new(store: Arc<dyn Storager>, opts: ServiceOptions) -> Self {
        Self::with_registry(store, opts, CommandRegistry::with_builtin())
    }

    pub fn with_registry(
        store: Arc<dyn Storager>,
        opts: ServiceOptions,
        registry: CommandRegistry,
    ) -> Self {
        Self {
            registry,
            store,
            opts,
            sessions: Mutex::new(HashMap::new()),
            pubsub: PubSub::new(),
            info: InfoRegistry::default(),
            started: Instant::now(),
        }
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.opts
    }

    pub fn store(&self) -> &Arc<dyn Storager> {
        &self.store
    }

    pub fn pubsub(&self) -> &PubSub {
        &self.pubsub
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    /// Creates the session of a newly accepted connection, bound to db 0.
    pub fn on_accept(&self, addr: impl Into<String>) -> Result<Session> {
        let session = Session::new(addr, self.store.select(0)?);
        self.sessions()
            .insert(session.id(), session.handle().clone());
        info!(client = session.addr(), id = session.id(), "accept");
        Ok(session)
    }

    /// Forgets a session whose connection has ended.
    pub fn on_closed(&self, session: &Session) {
        self.pubsub.remove_subscriber(session.id());
        if self.sessions().remove(&session.id()).is_none() {
            error!(
                client = session.addr(),
                id = session.id(),
                "closed session was not registered"
            );
        }
    }

    /// Fails with `NotAuthenticated` while a password is configured and the
    /// session has not authenticated, except for a few handshake commands.
    pub fn check_auth(&self, session: &Session, name: &str) -> Result<()> {
        if self.opts.auth_password.is_none() || session.is_authenticated() {
            return Ok(());
        }
        if AUTH_EXEMPT.iter().any(|c| c.eq_ignore_ascii_case(name)) {
            return Ok(());
        }
        Err(XdisError::NotAuthenticated)
    }

    /// Runs one command for `session`. `args` excludes the command name.
    pub async fn dispatch(&self, session: &mut Session, name: &[u8], args: &[Bytes]) -> Result<Reply> {
        let name = String::from_utf8_lossy(name);
        self.check_auth(session, &name)?;
        let entry = self
            .registry
            .lookup(&name)
            .ok_or_else(|| XdisError::UnknownCommand(name.to_string()))?;

        let start = Instant::now();
        let result = entry
            .handler
            .call(CmdContext { server: self }, session, args)
            .await;
        let elapsed = start.elapsed();

        debug!(
            command = entry.name,
            duration_us = elapsed.as_micros() as u64,
            client = session.addr(),
            db = session.db_index(),
            "command executed"
        );
        if !self.opts.slowlog_threshold.is_zero() && elapsed > self.opts.slowlog_threshold {
            warn!(
                command = entry.name,
                duration_us = elapsed.as_micros() as u64,
                client = session.addr(),
                "slow command"
            );
        }
        result
    }

    /// Asks every registered session to close. Failures are logged and do
    /// not stop the remaining closes.
    pub fn close_all(&self) {
        let sessions = self.sessions();
        let mut failed = 0;
        for handle in sessions.values() {
            if let Err(e) = handle.close() {
                failed += 1;
                warn!(client = handle.addr(), id = handle.id(), error = %e, "failed to close session");
            }
        }
        info!(sessions = sessions.len(), failed, "closed all sessions");
    }
}

impl ServerOps for Service {
    fn select_db(&self, index: usize) -> Result<Arc<dyn Db>> {
        self.store.select(index)
    }

    fn flush_all(&self) -> Result<()> {
        self.store.flush_all()
    }

    fn check_password(&self, password: &[u8]) -> Result<()> {
        match &self.opts.auth_password {
            None => Err(XdisError::NoPassword),
            Some(p) if p.as_bytes() == password => Ok(()),
            Some(_) => Err(XdisError::InvalidPassword),
        }
    }

    fn publish(&self, channel: &[u8], message: Bytes) -> i64 {
        self.pubsub.publish(channel, message)
    }

    fn info(&self, section: &str) -> Bytes {
        Bytes::from(self.info.dump(self, section))
    }
}

/// TCP acceptor; one task per connection.
pub struct Server {
    service: Arc<Service>,
    listener: TcpListener,
}

impl Server {
    pub async fn bind(service: Arc<Service>, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { service, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves, then closes every
    /// session.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(addr = %self.local_addr()?, "xdis listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_connection(stream, addr),
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
            }
        }

        info!("shutting down");
        self.service.close_all();
        Ok(())
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let service = Arc::clone(&self.service);
        tokio::spawn(async move {
            let session = match service.on_accept(addr.to_string()) {
                Ok(session) => session,
                Err(e) => {
                    error!(client = %addr, error = %e, "failed to create session");
                    return;
                }
            };
            let mut conn = Connection::new(stream, service, session);
            if let Err(e) = conn.handle().await {
                error!(client = %addr, error = %e, "connection error");
            }
            info!(client = %addr, "Connection closed");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CmdCategory;
    use crate::storage::MemoryStorage;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn service(password: Option<&str>) -> Service {
        let opts = ServiceOptions {
            auth_password: password.map(str::to_string),
            ..ServiceOptions::default()
        };
        Service::new(Arc::new(MemoryStorage::new(4, 1024)), opts)
    }

    fn args(parts: &[&str]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::from(p.to_string())).collect()
    }

    #[tokio::test]
    async fn test_dispatch_unknown_and_known() {
        let service = service(None);
        let mut s = service.on_accept("127.0.0.1:1").unwrap();
        let err = service.dispatch(&mut s, b"nosuch", &[]).await.unwrap_err();
        assert_eq!(err.to_string(), "ERR unknown command 'nosuch'");

        service.dispatch(&mut s, b"SET", &args(&["k", "v"])).await.unwrap();
        assert_eq!(
            service.dispatch(&mut s, b"get", &args(&["k"])).await.unwrap(),
            Reply::bulk("v")
        );
    }

    #[tokio::test]
    async fn test_auth_required() {
        let service = service(Some("pw"));
        let mut s = service.on_accept("127.0.0.1:1").unwrap();
        assert!(matches!(
            service.dispatch(&mut s, b"get", &args(&["k"])).await,
            Err(XdisError::NotAuthenticated)
        ));
        assert!(matches!(
            service.dispatch(&mut s, b"nosuch", &[]).await,
            Err(XdisError::NotAuthenticated)
        ));
        assert_eq!(
            service.dispatch(&mut s, b"PING", &[]).await.unwrap(),
            Reply::Status(crate::reply::Status::Pong)
        );
        assert!(matches!(
            service.dispatch(&mut s, b"auth", &args(&["bad"])).await,
            Err(XdisError::InvalidPassword)
        ));
        service.dispatch(&mut s, b"auth", &args(&["pw"])).await.unwrap();
        assert_eq!(
            service.dispatch(&mut s, b"get", &args(&["k"])).await.unwrap(),
            Reply::Nil
        );
    }

    #[test]
    fn test_auth_not_enforced_without_password() {
        let service = service(None);
        let s = service.on_accept("127.0.0.1:1").unwrap();
        assert!(service.check_auth(&s, "get").is_ok());
        assert!(matches!(
            service.check_password(b"x"),
            Err(XdisError::NoPassword)
        ));
    }

    #[test]
    fn test_session_registry() {
        let service = service(None);
        let a = service.on_accept("127.0.0.1:1").unwrap();
        let b = service.on_accept("127.0.0.1:2").unwrap();
        assert_eq!(a.db_index(), 0);
        assert_eq!(service.session_count(), 2);

        service.on_closed(&a);
        assert_eq!(service.session_count(), 1);
        // A second close only logs.
        service.on_closed(&a);
        assert_eq!(service.session_count(), 1);

        service.close_all();
        assert!(b.is_closed());
        assert!(!a.is_closed());
    }

    #[test]
    fn test_close_all_tolerates_failures() {
        let service = service(None);
        let gone = service.on_accept("127.0.0.1:1").unwrap();
        let live = service.on_accept("127.0.0.1:2").unwrap();
        drop(gone);
        service.close_all();
        assert!(live.is_closed());
    }

    #[tokio::test]
    async fn test_info_and_publish_through_ops() {
        let service = service(None);
        let mut s = service.on_accept("127.0.0.1:1").unwrap();
        let reply = service.dispatch(&mut s, b"info", &args(&["clients"])).await.unwrap();
        match reply {
            Reply::Bulk(b) => {
                let text = String::from_utf8_lossy(&b).to_string();
                assert!(text.starts_with("# Clients\r\n"));
                assert!(text.contains("connected_clients:1"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            service.dispatch(&mut s, b"publish", &args(&["ch", "m"])).await.unwrap(),
            Reply::Int(0)
        );
    }

    fn explode(_: CmdContext<'_>, _: &mut Session, _: &[Bytes]) -> Result<Reply> {
        panic!("handler failure");
    }

    #[tokio::test]
    async fn test_panicking_handler_releases_session() {
        let mut registry = CommandRegistry::with_builtin();
        registry.register_sync("explode", CmdCategory::Server, explode);
        let service = Arc::new(Service::with_registry(
            Arc::new(MemoryStorage::new(1, 1024)),
            ServiceOptions::default(),
            registry,
        ));
        let server = Server::bind(Arc::clone(&service), "127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let client = async {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"PING\r\n").await.unwrap();
            let mut pong = [0u8; 7];
            stream.read_exact(&mut pong).await.unwrap();
            assert_eq!(service.session_count(), 1);

            stream.write_all(b"EXPLODE\r\n").await.unwrap();
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
            assert!(rest.is_empty());

            let deadline = Instant::now() + Duration::from_secs(2);
            while service.session_count() != 0 && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(service.session_count(), 0);
        };

        tokio::select! {
            _ = server.run() => panic!("server stopped"),
            _ = client => {}
        }
    }
}

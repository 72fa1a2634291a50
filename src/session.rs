//! Per-connection state.

use crate::error::{Result, XdisError};
use crate::storage::Db;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Non-owning handle to a session, kept by the service's session registry.
///
/// Closing through the handle asks the owning connection to shut its
/// transport down; it never touches the socket directly.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: u64,
    addr: String,
    close_tx: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Errors when the connection is already gone.
    pub fn close(&self) -> Result<()> {
        self.close_tx.send(true).map_err(|_| {
            XdisError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("session {} already closed", self.id),
            ))
        })
    }
}

/// State of one client connection: authentication, name and selected
/// database. Owned by the connection task and lent to handlers.
pub struct Session {
    handle: SessionHandle,
    close_rx: watch::Receiver<bool>,
    authenticated: bool,
    name: String,
    db: Arc<dyn Db>,
}

impl Session {
    pub fn new(addr: impl Into<String>, db: Arc<dyn Db>) -> Self {
        let (close_tx, close_rx) = watch::channel(false);
        Self {
            handle: SessionHandle {
                id: SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                addr: addr.into(),
                close_tx: Arc::new(close_tx),
            },
            close_rx,
            authenticated: false,
            name: String::new(),
            db,
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.id
    }

    pub fn addr(&self) -> &str {
        &self.handle.addr
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn set_authenticated(&mut self, authenticated: bool) {
        self.authenticated = authenticated;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// The currently selected database.
    pub fn db(&self) -> &Arc<dyn Db> {
        &self.db
    }

    pub fn db_index(&self) -> usize {
        self.db.index()
    }

    pub fn set_db(&mut self, db: Arc<dyn Db>) {
        self.db = db;
    }

    pub fn close(&self) -> Result<()> {
        self.handle.close()
    }

    pub fn is_closed(&self) -> bool {
        *self.close_rx.borrow()
    }

    /// Receiver that flips to `true` once the session is asked to close.
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_rx.clone()
    }
}

//! Command registry and the handler calling convention.
//!
//! Handlers are plain functions registered by lowercase name. Each receives
//! a [`CmdContext`] (server-level capabilities), the calling [`Session`] and
//! the raw argument vector, and returns a [`Reply`]. Most handlers are
//! synchronous; the few that wait (blocking pops, slot migration) are
//! registered as async handlers returning a boxed future.

use crate::error::{Result, XdisError};
use crate::reply::Reply;
use crate::session::Session;
use crate::storage::{Db, KeyOps};
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::warn;

/// Defines the six type-scoped key commands (`*MCLEAR`, `*KEYEXISTS`,
/// `*EXPIRE`, `*EXPIREAT`, `*TTL`, `*PERSIST`) over one typed store.
macro_rules! typed_key_commands {
    ($store:ident: $del:ident, $exists:ident, $expire:ident, $expire_at:ident, $ttl:ident, $persist:ident) => {
        fn $del(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
            super::key_del(s.db().$store(), stringify!($del), args)
        }

        fn $exists(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
            super::key_exists(s.db().$store(), stringify!($exists), args)
        }

        fn $expire(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
            super::key_expire(s.db().$store(), stringify!($expire), args)
        }

        fn $expire_at(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
            super::key_expire_at(s.db().$store(), stringify!($expire_at), args)
        }

        fn $ttl(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
            super::key_ttl(s.db().$store(), stringify!($ttl), args)
        }

        fn $persist(_: CmdContext<'_>, s: &mut Session, args: &[Bytes]) -> Result<Reply> {
            super::key_persist(s.db().$store(), stringify!($persist), args)
        }

        fn register_key_commands(registry: &mut super::CommandRegistry, category: super::CmdCategory) {
            registry.register_sync(stringify!($del), category, $del);
            registry.register_sync(stringify!($exists), category, $exists);
            registry.register_sync(stringify!($expire), category, $expire);
            registry.register_sync(stringify!($expire_at), category, $expire_at);
            registry.register_sync(stringify!($ttl), category, $ttl);
            registry.register_sync(stringify!($persist), category, $persist);
        }
    };
}

pub(crate) use typed_key_commands;

pub mod bitmap;
pub mod hash;
pub mod list;
pub mod server;
pub mod set;
pub mod slots;
pub mod string;
pub mod zset;

/// Command family, used for grouping and introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmdCategory {
    String,
    Hash,
    List,
    Set,
    ZSet,
    Bitmap,
    Slot,
    Server,
}

/// Server-level operations a handler may need beyond its session.
pub trait ServerOps: Send + Sync {
    fn select_db(&self, index: usize) -> Result<Arc<dyn Db>>;
    fn flush_all(&self) -> Result<()>;
    /// `NoPassword` when no password is configured, `InvalidPassword` on
    /// mismatch.
    fn check_password(&self, password: &[u8]) -> Result<()>;
    /// Returns the number of subscribers that received the message.
    fn publish(&self, channel: &[u8], message: Bytes) -> i64;
    /// INFO text for one section, or all sections for an empty name.
    fn info(&self, section: &str) -> Bytes;
}

/// Capabilities lent to a handler for one invocation.
#[derive(Clone, Copy)]
pub struct CmdContext<'a> {
    pub server: &'a dyn ServerOps,
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Reply>> + Send + 'a>>;

pub type SyncHandler = fn(CmdContext<'_>, &mut Session, &[Bytes]) -> Result<Reply>;
pub type AsyncHandler =
    for<'a> fn(CmdContext<'a>, &'a mut Session, &'a [Bytes]) -> HandlerFuture<'a>;

#[derive(Clone, Copy)]
pub enum CmdHandler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

impl CmdHandler {
    pub async fn call(
        &self,
        ctx: CmdContext<'_>,
        session: &mut Session,
        args: &[Bytes],
    ) -> Result<Reply> {
        match self {
            CmdHandler::Sync(f) => f(ctx, session, args),
            CmdHandler::Async(f) => f(ctx, session, args).await,
        }
    }
}

#[derive(Clone, Copy)]
pub struct CmdEntry {
    pub name: &'static str,
    pub category: CmdCategory,
    pub handler: CmdHandler,
}

/// Name to handler map. Populated once at start-up and read-only after.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, CmdEntry>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in command family.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        string::register(&mut registry);
        hash::register(&mut registry);
        list::register(&mut registry);
        set::register(&mut registry);
        zset::register(&mut registry);
        bitmap::register(&mut registry);
        server::register(&mut registry);
        slots::register(&mut registry);
        registry
    }

    /// Registering an existing name replaces the previous handler.
    pub fn register(&mut self, name: &'static str, category: CmdCategory, handler: CmdHandler) {
        let entry = CmdEntry {
            name,
            category,
            handler,
        };
        if self
            .commands
            .insert(name.to_ascii_lowercase(), entry)
            .is_some()
        {
            warn!(command = name, "command registered twice, replacing handler");
        }
    }

    pub fn register_sync(&mut self, name: &'static str, category: CmdCategory, f: SyncHandler) {
        self.register(name, category, CmdHandler::Sync(f));
    }

    pub fn register_async(&mut self, name: &'static str, category: CmdCategory, f: AsyncHandler) {
        self.register(name, category, CmdHandler::Async(f));
    }

    /// Case-insensitive lookup.
    pub fn lookup(&self, name: &str) -> Option<&CmdEntry> {
        match self.commands.get(name) {
            Some(entry) => Some(entry),
            None => self.commands.get(&name.to_ascii_lowercase()),
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Sorted names of one category.
    pub fn names(&self, category: CmdCategory) -> Vec<&'static str> {
        let mut names: Vec<_> = self
            .commands
            .values()
            .filter(|e| e.category == category)
            .map(|e| e.name)
            .collect();
        names.sort_unstable();
        names
    }
}

pub(crate) fn check_arity(name: &str, args: &[Bytes], min: usize) -> Result<()> {
    if args.len() < min {
        return Err(XdisError::WrongArgCount(name.to_string()));
    }
    Ok(())
}

pub(crate) fn check_exact(name: &str, args: &[Bytes], n: usize) -> Result<()> {
    if args.len() != n {
        return Err(XdisError::WrongArgCount(name.to_string()));
    }
    Ok(())
}

pub(crate) fn parse_i64(arg: &[u8]) -> Result<i64> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(XdisError::Value)
}

pub(crate) fn parse_u64(arg: &[u8]) -> Result<u64> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or(XdisError::Value)
}

pub(crate) fn lower(arg: &[u8]) -> String {
    String::from_utf8_lossy(arg).to_ascii_lowercase()
}

/// `k1 v1 k2 v2 ...` into pairs; the caller checks the length is even.
pub(crate) fn pairs(args: &[Bytes]) -> Vec<(Bytes, Bytes)> {
    args.chunks_exact(2)
        .map(|c| (c[0].clone(), c[1].clone()))
        .collect()
}

// Key management shared by every data type. Generic over `?Sized` so the
// typed stores (`dyn ListStore`, ...) can be passed as they are.

pub(crate) fn key_del<K: KeyOps + ?Sized>(keys: &K, name: &str, args: &[Bytes]) -> Result<Reply> {
    check_arity(name, args, 1)?;
    Ok(Reply::Int(keys.del(args)?))
}

pub(crate) fn key_exists<K: KeyOps + ?Sized>(
    keys: &K,
    name: &str,
    args: &[Bytes],
) -> Result<Reply> {
    check_arity(name, args, 1)?;
    let mut n = 0;
    for key in args {
        n += keys.exists(key)?;
    }
    Ok(Reply::Int(n))
}

pub(crate) fn key_expire<K: KeyOps + ?Sized>(
    keys: &K,
    name: &str,
    args: &[Bytes],
) -> Result<Reply> {
    check_exact(name, args, 2)?;
    let seconds = parse_i64(&args[1])?;
    Ok(Reply::Int(keys.expire(&args[0], seconds)?))
}

pub(crate) fn key_expire_at<K: KeyOps + ?Sized>(
    keys: &K,
    name: &str,
    args: &[Bytes],
) -> Result<Reply> {
    check_exact(name, args, 2)?;
    let when = parse_i64(&args[1])?;
    Ok(Reply::Int(keys.expire_at(&args[0], when)?))
}

pub(crate) fn key_ttl<K: KeyOps + ?Sized>(keys: &K, name: &str, args: &[Bytes]) -> Result<Reply> {
    check_exact(name, args, 1)?;
    Ok(Reply::Int(keys.ttl(&args[0])?))
}

pub(crate) fn key_persist<K: KeyOps + ?Sized>(
    keys: &K,
    name: &str,
    args: &[Bytes],
) -> Result<Reply> {
    check_exact(name, args, 1)?;
    Ok(Reply::Int(keys.persist(&args[0])?))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::storage::{MemoryStorage, Storager};

    /// `ServerOps` over a memory backend, with an optional password.
    pub struct TestServer {
        pub storage: MemoryStorage,
        pub password: Option<String>,
    }

    impl TestServer {
        pub fn new() -> Self {
            Self {
                storage: MemoryStorage::new(16, 1024),
                password: None,
            }
        }

        pub fn session(&self) -> Session {
            Session::new("127.0.0.1:40000", self.storage.select(0).unwrap())
        }

        pub fn ctx(&self) -> CmdContext<'_> {
            CmdContext { server: self }
        }
    }

    impl ServerOps for TestServer {
        fn select_db(&self, index: usize) -> Result<Arc<dyn Db>> {
            self.storage.select(index)
        }

        fn flush_all(&self) -> Result<()> {
            self.storage.flush_all()
        }

        fn check_password(&self, password: &[u8]) -> Result<()> {
            match &self.password {
                None => Err(XdisError::NoPassword),
                Some(p) if p.as_bytes() == password => Ok(()),
                Some(_) => Err(XdisError::InvalidPassword),
            }
        }

        fn publish(&self, _channel: &[u8], _message: Bytes) -> i64 {
            0
        }

        fn info(&self, section: &str) -> Bytes {
            Bytes::from(format!("# {}\r\n", section))
        }
    }

    pub fn args(parts: &[&str]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::from(p.to_string())).collect()
    }
}

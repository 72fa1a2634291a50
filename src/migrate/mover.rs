//! Moving one element between lists, and waiting for one to arrive.
//!
//! A move is pop then push. If the push fails the popped element is pushed
//! back onto the end it came from. When source and destination are the same
//! key, popping the last element removes the key together with its TTL, so
//! the TTL is read first and re-applied after the push.

use crate::error::Result;
use crate::storage::ListStore;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error};

/// End of a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    Head,
    Tail,
}

fn pop(lists: &dyn ListStore, key: &[u8], end: End) -> Result<Option<Bytes>> {
    match end {
        End::Head => lists.lpop(key),
        End::Tail => lists.rpop(key),
    }
}

/// Remaining TTL (ms) to restore on `source` after the move, if any.
fn ttl_to_restore(lists: &dyn ListStore, source: &[u8], dest: &[u8]) -> Result<Option<i64>> {
    if source != dest {
        return Ok(None);
    }
    let ttl = lists.pttl(source)?;
    Ok((ttl > 0).then_some(ttl))
}

fn push_popped(
    lists: &dyn ListStore,
    source: &[u8],
    dest: &[u8],
    value: Bytes,
    ttl_ms: Option<i64>,
) -> Result<Bytes> {
    if let Err(e) = lists.lpush(dest, std::slice::from_ref(&value)) {
        if let Err(rollback) = lists.rpush(source, std::slice::from_ref(&value)) {
            error!(
                source = %String::from_utf8_lossy(source),
                error = %rollback,
                "failed to push element back after aborted move"
            );
        }
        return Err(e);
    }

    if let Some(ttl) = ttl_ms {
        lists.pexpire(source, ttl)?;
    }
    Ok(value)
}

/// Pop the tail of `source` and push it onto the head of `dest`.
///
/// `None` when `source` is empty.
pub fn move_tail_to_head(lists: &dyn ListStore, source: &[u8], dest: &[u8]) -> Result<Option<Bytes>> {
    let ttl = ttl_to_restore(lists, source, dest)?;
    match lists.rpop(source)? {
        Some(value) => push_popped(lists, source, dest, value, ttl).map(Some),
        None => Ok(None),
    }
}

/// Like [`move_tail_to_head`], but waits up to `timeout` (forever when
/// `None`) for `source` to receive an element.
pub async fn blocking_move_tail_to_head(
    lists: &dyn ListStore,
    source: &Bytes,
    dest: &[u8],
    timeout: Option<Duration>,
    closed: watch::Receiver<bool>,
) -> Result<Option<Bytes>> {
    let ttl = ttl_to_restore(lists, source, dest)?;
    let popped = blocking_pop(lists, std::slice::from_ref(source), End::Tail, timeout, closed).await?;
    match popped {
        Some((_, value)) => push_popped(lists, source, dest, value, ttl).map(Some),
        None => Ok(None),
    }
}

/// Pop from the first non-empty list among `keys`, waiting for a push when
/// all are empty.
///
/// Returns `None` once the timeout elapses or the session is closed; the
/// wait never holds any storage lock.
pub async fn blocking_pop(
    lists: &dyn ListStore,
    keys: &[Bytes],
    end: End,
    timeout: Option<Duration>,
    mut closed: watch::Receiver<bool>,
) -> Result<Option<(Bytes, Bytes)>> {
    let signal = lists.push_signal();
    // A deadline past what `Instant` can represent means no deadline.
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

    loop {
        // Registered before checking so a push in between is not missed.
        let notified = signal.notified();

        for key in keys {
            if let Some(value) = pop(lists, key, end)? {
                return Ok(Some((key.clone(), value)));
            }
        }
        if *closed.borrow() {
            return Ok(None);
        }

        let expired = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = notified => {}
            _ = expired => {
                debug!(keys = keys.len(), "blocking pop timed out");
                return Ok(None);
            }
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    return Ok(None);
                }
            }
        }
    }
}

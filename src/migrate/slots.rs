//! Codis-style key and slot migration.
//!
//! Keys are serialized by the backend, shipped to the target as
//! `SLOTSRESTORE key ttl value [key ttl value ...]` batches and deleted
//! locally only after the target answers `+OK`. A failure aborts the
//! command; keys migrated by earlier batches stay migrated. A key written
//! by another client while its batch was in flight is kept locally and not
//! counted as moved.

use super::client::PeerClient;
use crate::error::{Result, XdisError};
use crate::protocol::RespValue;
use crate::storage::SlotStore;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What one migration command moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrateUnit {
    /// A single key.
    Key(Bytes),
    /// Every key in the slot, one key per batch.
    Slot(u64),
    /// Every key sharing the key's hash tag, as one batch.
    TagKey(Bytes),
    /// Every key in the slot, one batch per hash tag.
    TagSlot(u64),
}

/// Destination of a migration.
#[derive(Debug, Clone)]
pub struct MigrateTarget {
    pub addr: String,
    pub timeout: Duration,
}

impl MigrateTarget {
    /// A zero timeout is raised to one second.
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            Duration::from_secs(1)
        } else {
            timeout
        };
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

/// Migrates `unit` to `target` and returns the number of keys moved.
pub async fn migrate(slots: &dyn SlotStore, target: &MigrateTarget, unit: MigrateUnit) -> Result<i64> {
    let batches = plan(slots, &unit)?;
    let mut migrator = Migrator {
        slots,
        target,
        peer: None,
    };

    let mut moved = 0;
    for batch in batches {
        moved += migrator.send_batch(&batch).await?;
    }
    if moved > 0 {
        info!(target_addr = %target.addr, unit = ?unit, keys = moved, "migration finished");
    }
    Ok(moved)
}

/// Groups the keys of `unit` into restore batches.
fn plan(slots: &dyn SlotStore, unit: &MigrateUnit) -> Result<Vec<Vec<Bytes>>> {
    Ok(match unit {
        MigrateUnit::Key(key) => vec![vec![key.clone()]],
        MigrateUnit::TagKey(key) => {
            let keys = slots.tag_keys(key)?;
            if keys.is_empty() {
                Vec::new()
            } else {
                vec![keys]
            }
        }
        MigrateUnit::Slot(slot) => slots
            .slot_keys(*slot)?
            .into_iter()
            .map(|k| vec![k])
            .collect(),
        MigrateUnit::TagSlot(slot) => {
            let mut groups: BTreeMap<Bytes, Vec<Bytes>> = BTreeMap::new();
            for key in slots.slot_keys(*slot)? {
                groups.entry(slots.tag_of(&key)).or_default().push(key);
            }
            groups.into_values().collect()
        }
    })
}

struct Migrator<'a> {
    slots: &'a dyn SlotStore,
    target: &'a MigrateTarget,
    peer: Option<PeerClient>,
}

impl Migrator<'_> {
    /// Connects on first use so that a command with nothing to move never
    /// touches the network.
    async fn peer(&mut self) -> Result<&mut PeerClient> {
        if self.peer.is_none() {
            let client = PeerClient::connect(&self.target.addr, self.target.timeout).await?;
            self.peer = Some(client);
        }
        self.peer
            .as_mut()
            .ok_or_else(|| XdisError::Network("migration peer unavailable".to_string()))
    }

    async fn send_batch(&mut self, keys: &[Bytes]) -> Result<i64> {
        let mut request = vec![Bytes::from_static(b"SLOTSRESTORE")];
        let mut dumped = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(d) = self.slots.dump(key)? {
                request.push(d.key.clone());
                request.push(Bytes::from(d.ttl_ms.to_string()));
                request.push(d.value.clone());
                dumped.push(d);
            }
        }
        if dumped.is_empty() {
            return Ok(0);
        }

        let peer = self.peer().await?;
        let reply = peer.call(&RespValue::command(request)).await?;
        match reply {
            RespValue::SimpleString(s) if s == "OK" => {}
            RespValue::Error(e) => {
                return Err(XdisError::Network(format!(
                    "{} rejected restore: {}",
                    peer.addr(),
                    e
                )))
            }
            other => {
                return Err(XdisError::Network(format!(
                    "{} sent unexpected restore reply: {:?}",
                    peer.addr(),
                    other
                )))
            }
        }

        let mut removed = 0;
        for d in &dumped {
            if self.slots.remove_unchanged(d)? {
                removed += 1;
            } else {
                warn!(
                    key = %String::from_utf8_lossy(&d.key),
                    target_addr = %self.target.addr,
                    "key changed during migration, kept locally"
                );
            }
        }
        debug!(target_addr = %self.target.addr, keys = removed, "restore batch acknowledged");
        Ok(removed)
    }
}

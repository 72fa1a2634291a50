//! Backend capability consumed by the command layer.
//!
//! The front-end never touches data directly: every command goes through
//! the traits below. A backend provides a [`Storager`] that hands out
//! numbered [`Db`] handles, and each `Db` exposes one store per data type.
//! All typed stores share the [`KeyOps`] key-management surface, which the
//! type-scoped commands (`LTTL`, `HEXPIRE`, `ZMCLEAR`, ...) rely on.

mod memory;
mod slot;

pub use memory::MemoryStorage;
pub use slot::SlotHasher;

use crate::error::Result;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Notify;

/// Value kinds held by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    String,
    List,
    Hash,
    Set,
    ZSet,
}

/// Write condition for `SET`-style commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetCondition {
    #[default]
    Always,
    IfAbsent,
    IfPresent,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Relative expiry in milliseconds.
    pub expire_ms: Option<i64>,
    pub condition: SetCondition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Diff,
    Inter,
    Union,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZSetOp {
    Inter,
    Union,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Aggregate {
    #[default]
    Sum,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    And,
    Or,
    Xor,
    Not,
}

/// Sorted-set member with its integral score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScorePair {
    pub member: Bytes,
    pub score: i64,
}

/// One end of a lexicographic range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LexBound {
    Unbounded,
    Inclusive(Bytes),
    Exclusive(Bytes),
}

/// Paging applied after range filtering. `count < 0` means no limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub offset: i64,
    pub count: i64,
}

impl Default for Limit {
    fn default() -> Self {
        Limit {
            offset: 0,
            count: -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot: u64,
    pub size: u64,
}

/// A serialized key as produced by [`SlotStore::dump`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpedKey {
    pub key: Bytes,
    /// Remaining time to live in milliseconds; 0 when the key never expires.
    pub ttl_ms: i64,
    /// Absolute expiry in unix milliseconds at the time of the dump.
    pub expire_at_ms: Option<u64>,
    pub value: Bytes,
}

/// A validated `SLOTSRESTORE` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreEntry {
    pub key: Bytes,
    /// Absolute expiry in unix milliseconds.
    pub expire_at_ms: Option<u64>,
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceStat {
    pub db: usize,
    pub keys: u64,
    pub expires: u64,
}

/// Top-level backend handle.
pub trait Storager: Send + Sync {
    /// Handle for database `index`; `DbIndex` error when out of range.
    fn select(&self, index: usize) -> Result<Arc<dyn Db>>;
    fn flush_all(&self) -> Result<()>;
    fn db_count(&self) -> usize;
    /// Non-empty databases only.
    fn keyspace_stats(&self) -> Result<Vec<KeyspaceStat>>;
}

/// One numbered database.
pub trait Db: Send + Sync {
    fn index(&self) -> usize;
    /// Drop every key; returns how many were removed.
    fn flush(&self) -> Result<i64>;
    /// Key management that ignores the value type.
    fn keys(&self) -> &dyn KeyOps;
    fn strings(&self) -> &dyn StringStore;
    fn lists(&self) -> &dyn ListStore;
    fn hashes(&self) -> &dyn HashStore;
    fn sets(&self) -> &dyn SetStore;
    fn zsets(&self) -> &dyn ZSetStore;
    fn bitmaps(&self) -> &dyn BitmapStore;
    /// Slot migration capability; `None` when the backend has no slots.
    fn slots(&self) -> Option<&dyn SlotStore>;
}

/// TTL values follow the usual convention: `-2` missing key, `-1` no expiry.
pub trait KeyOps: Send + Sync {
    fn del(&self, keys: &[Bytes]) -> Result<i64>;
    fn exists(&self, key: &[u8]) -> Result<i64>;
    fn expire(&self, key: &[u8], seconds: i64) -> Result<i64>;
    fn expire_at(&self, key: &[u8], unix_seconds: i64) -> Result<i64>;
    fn pexpire(&self, key: &[u8], millis: i64) -> Result<i64>;
    fn ttl(&self, key: &[u8]) -> Result<i64>;
    fn pttl(&self, key: &[u8]) -> Result<i64>;
    fn persist(&self, key: &[u8]) -> Result<i64>;
}

pub trait StringStore: KeyOps {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;
    /// Returns whether the value was written (conditions may prevent it).
    fn set(&self, key: &[u8], value: Bytes, opts: SetOptions) -> Result<bool>;
    fn get_set(&self, key: &[u8], value: Bytes) -> Result<Option<Bytes>>;
    fn append(&self, key: &[u8], value: &[u8]) -> Result<i64>;
    fn incr_by(&self, key: &[u8], delta: i64) -> Result<i64>;
    fn get_range(&self, key: &[u8], start: i64, end: i64) -> Result<Bytes>;
    fn set_range(&self, key: &[u8], offset: usize, value: &[u8]) -> Result<i64>;
    fn strlen(&self, key: &[u8]) -> Result<i64>;
    fn mget(&self, keys: &[Bytes]) -> Result<Vec<Option<Bytes>>>;
    fn mset(&self, pairs: &[(Bytes, Bytes)]) -> Result<()>;
}

pub trait ListStore: KeyOps {
    fn lpush(&self, key: &[u8], values: &[Bytes]) -> Result<i64>;
    fn rpush(&self, key: &[u8], values: &[Bytes]) -> Result<i64>;
    fn lpop(&self, key: &[u8]) -> Result<Option<Bytes>>;
    fn rpop(&self, key: &[u8]) -> Result<Option<Bytes>>;
    fn llen(&self, key: &[u8]) -> Result<i64>;
    fn lrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Bytes>>;
    fn lindex(&self, key: &[u8], index: i64) -> Result<Option<Bytes>>;
    fn lset(&self, key: &[u8], index: i64, value: Bytes) -> Result<()>;
    /// Notified after every successful push, for blocking pops.
    fn push_signal(&self) -> Arc<Notify>;
}

pub trait HashStore: KeyOps {
    /// Returns the number of fields that were newly created.
    fn hset(&self, key: &[u8], pairs: &[(Bytes, Bytes)]) -> Result<i64>;
    fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Bytes>>;
    fn hdel(&self, key: &[u8], fields: &[Bytes]) -> Result<i64>;
    fn hgetall(&self, key: &[u8]) -> Result<Vec<(Bytes, Bytes)>>;
    fn hkeys(&self, key: &[u8]) -> Result<Vec<Bytes>>;
    fn hvals(&self, key: &[u8]) -> Result<Vec<Bytes>>;
    fn hlen(&self, key: &[u8]) -> Result<i64>;
    fn hmget(&self, key: &[u8], fields: &[Bytes]) -> Result<Vec<Option<Bytes>>>;
    fn hincr_by(&self, key: &[u8], field: &[u8], delta: i64) -> Result<i64>;
}

pub trait SetStore: KeyOps {
    fn sadd(&self, key: &[u8], members: &[Bytes]) -> Result<i64>;
    fn srem(&self, key: &[u8], members: &[Bytes]) -> Result<i64>;
    fn scard(&self, key: &[u8]) -> Result<i64>;
    fn sismember(&self, key: &[u8], member: &[u8]) -> Result<bool>;
    fn smembers(&self, key: &[u8]) -> Result<Vec<Bytes>>;
    fn combine(&self, op: SetOp, keys: &[Bytes]) -> Result<Vec<Bytes>>;
    /// Stores the combination at `dest`; returns its cardinality.
    fn combine_store(&self, op: SetOp, dest: &[u8], keys: &[Bytes]) -> Result<i64>;
}

pub trait ZSetStore: KeyOps {
    fn zadd(&self, key: &[u8], pairs: &[ScorePair]) -> Result<i64>;
    fn zcard(&self, key: &[u8]) -> Result<i64>;
    /// Inclusive score range.
    fn zcount(&self, key: &[u8], min: i64, max: i64) -> Result<i64>;
    fn zincr_by(&self, key: &[u8], delta: i64, member: &[u8]) -> Result<i64>;
    fn zrange(&self, key: &[u8], start: i64, stop: i64, reverse: bool) -> Result<Vec<ScorePair>>;
    fn zrange_by_score(
        &self,
        key: &[u8],
        min: i64,
        max: i64,
        limit: Limit,
        reverse: bool,
    ) -> Result<Vec<ScorePair>>;
    fn zrank(&self, key: &[u8], member: &[u8], reverse: bool) -> Result<Option<i64>>;
    fn zrem(&self, key: &[u8], members: &[Bytes]) -> Result<i64>;
    fn zrem_range_by_rank(&self, key: &[u8], start: i64, stop: i64) -> Result<i64>;
    fn zrem_range_by_score(&self, key: &[u8], min: i64, max: i64) -> Result<i64>;
    fn zscore(&self, key: &[u8], member: &[u8]) -> Result<Option<i64>>;
    fn zstore(
        &self,
        op: ZSetOp,
        dest: &[u8],
        keys: &[Bytes],
        weights: Option<&[i64]>,
        aggregate: Aggregate,
    ) -> Result<i64>;
    fn zrange_by_lex(
        &self,
        key: &[u8],
        min: &LexBound,
        max: &LexBound,
        limit: Limit,
    ) -> Result<Vec<Bytes>>;
    fn zrem_range_by_lex(&self, key: &[u8], min: &LexBound, max: &LexBound) -> Result<i64>;
    fn zlex_count(&self, key: &[u8], min: &LexBound, max: &LexBound) -> Result<i64>;
}

/// Bit operations over string values. Byte ranges are inclusive and accept
/// negative offsets from the end.
pub trait BitmapStore: Send + Sync {
    fn bitcount(&self, key: &[u8], start: i64, end: i64) -> Result<i64>;
    fn bitop(&self, op: BitOp, dest: &[u8], keys: &[Bytes]) -> Result<i64>;
    fn bitpos(&self, key: &[u8], bit: u8, start: i64, end: Option<i64>) -> Result<i64>;
    fn getbit(&self, key: &[u8], offset: u64) -> Result<i64>;
    fn setbit(&self, key: &[u8], offset: u64, on: bool) -> Result<i64>;
}

/// Slot bookkeeping for Codis-style migration. The hash function and the
/// slot count are the backend's own.
pub trait SlotStore: Send + Sync {
    fn hash_keys(&self, keys: &[Bytes]) -> Result<Vec<u64>>;
    /// Occupied slots in `[start, start + count)`.
    fn slots_info(&self, start: u64, count: u64, with_size: bool) -> Result<Vec<SlotInfo>>;
    /// Delete every key of each slot; reports the remaining size per slot.
    fn slots_del(&self, slots: &[u64]) -> Result<Vec<SlotInfo>>;
    fn check(&self) -> Result<()>;
    /// All-or-nothing write of a restore batch.
    fn restore(&self, entries: &[RestoreEntry]) -> Result<()>;
    fn dump(&self, key: &[u8]) -> Result<Option<DumpedKey>>;
    /// Deletes the key only while its value and expiry still match `dumped`.
    fn remove_unchanged(&self, dumped: &DumpedKey) -> Result<bool>;
    fn slot_keys(&self, slot: u64) -> Result<Vec<Bytes>>;
    /// Keys sharing `key`'s hash tag, including `key` itself when present.
    fn tag_keys(&self, key: &[u8]) -> Result<Vec<Bytes>>;
    fn tag_of(&self, key: &[u8]) -> Bytes;
}

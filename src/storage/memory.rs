use super::slot::SlotHasher;
use super::{
    Aggregate, BitOp, BitmapStore, DataType, Db, DumpedKey, HashStore, KeyOps, KeyspaceStat,
    LexBound, Limit, ListStore, RestoreEntry, ScorePair, SetCondition, SetOp, SetOptions,
    SetStore, SlotInfo, SlotStore, Storager, StringStore, ZSetOp, ZSetStore,
};
use crate::error::{Result, XdisError};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

/// Largest string a write may produce (512MB).
const MAX_STRING_LEN: usize = 512 * 1024 * 1024;

/// Sorted set with integral scores, ordered by `(score, member)`.
#[derive(Clone, Debug, Default)]
struct ZSet {
    scores: HashMap<Bytes, i64>,
    ordered: BTreeSet<(i64, Bytes)>,
}

impl ZSet {
    /// Returns true when the member is new.
    fn insert(&mut self, member: Bytes, score: i64) -> bool {
        match self.scores.insert(member.clone(), score) {
            Some(old) => {
                self.ordered.remove(&(old, member.clone()));
                self.ordered.insert((score, member));
                false
            }
            None => {
                self.ordered.insert((score, member));
                true
            }
        }
    }

    fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, Bytes::copy_from_slice(member)));
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.scores.len()
    }

    fn pairs(&self, reverse: bool) -> Box<dyn Iterator<Item = &(i64, Bytes)> + '_> {
        if reverse {
            Box::new(self.ordered.iter().rev())
        } else {
            Box::new(self.ordered.iter())
        }
    }

    fn rank(&self, member: &[u8], reverse: bool) -> Option<i64> {
        let score = *self.scores.get(member)?;
        let pos = self
            .ordered
            .range(..(score, Bytes::copy_from_slice(member)))
            .count() as i64;
        Some(if reverse {
            self.len() as i64 - 1 - pos
        } else {
            pos
        })
    }
}

#[derive(Clone, Debug)]
enum Value {
    String(Bytes),
    List(VecDeque<Bytes>),
    Hash(BTreeMap<Bytes, Bytes>),
    Set(BTreeSet<Bytes>),
    ZSet(ZSet),
}

impl Value {
    fn kind(&self) -> DataType {
        match self {
            Value::String(_) => DataType::String,
            Value::List(_) => DataType::List,
            Value::Hash(_) => DataType::Hash,
            Value::Set(_) => DataType::Set,
            Value::ZSet(_) => DataType::ZSet,
        }
    }
}

/// Serialized form used by `dump` and `restore`.
#[derive(Serialize, Deserialize)]
enum DumpValue {
    String(Vec<u8>),
    List(Vec<Vec<u8>>),
    Hash(Vec<(Vec<u8>, Vec<u8>)>),
    Set(Vec<Vec<u8>>),
    ZSet(Vec<(Vec<u8>, i64)>),
}

impl From<&Value> for DumpValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::String(s) => DumpValue::String(s.to_vec()),
            Value::List(l) => DumpValue::List(l.iter().map(|v| v.to_vec()).collect()),
            Value::Hash(h) => {
                DumpValue::Hash(h.iter().map(|(f, v)| (f.to_vec(), v.to_vec())).collect())
            }
            Value::Set(s) => DumpValue::Set(s.iter().map(|m| m.to_vec()).collect()),
            Value::ZSet(z) => {
                DumpValue::ZSet(z.ordered.iter().map(|(s, m)| (m.to_vec(), *s)).collect())
            }
        }
    }
}

impl From<DumpValue> for Value {
    fn from(dump: DumpValue) -> Self {
        match dump {
            DumpValue::String(s) => Value::String(Bytes::from(s)),
            DumpValue::List(l) => Value::List(l.into_iter().map(Bytes::from).collect()),
            DumpValue::Hash(h) => Value::Hash(
                h.into_iter()
                    .map(|(f, v)| (Bytes::from(f), Bytes::from(v)))
                    .collect(),
            ),
            DumpValue::Set(s) => Value::Set(s.into_iter().map(Bytes::from).collect()),
            DumpValue::ZSet(pairs) => {
                let mut z = ZSet::default();
                for (m, s) in pairs {
                    z.insert(Bytes::from(m), s);
                }
                Value::ZSet(z)
            }
        }
    }
}

/// Value with optional expiration time
#[derive(Clone, Debug)]
struct StoredValue {
    value: Value,
    /// Expiration time in milliseconds since UNIX epoch
    expires_at: Option<u64>,
}

impl StoredValue {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

type Map = HashMap<Bytes, StoredValue>;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Access to one variant of [`Value`].
trait Variant: Default + Sized {
    fn from_ref(value: &Value) -> Option<&Self>;
    fn from_mut(value: &mut Value) -> Option<&mut Self>;
    fn wrap(self) -> Value;
    /// Empty containers are removed from the keyspace.
    fn is_empty_container(&self) -> bool;
}

macro_rules! variant {
    ($ty:ty, $name:ident, $empty:expr) => {
        impl Variant for $ty {
            fn from_ref(value: &Value) -> Option<&Self> {
                match value {
                    Value::$name(v) => Some(v),
                    _ => None,
                }
            }

            fn from_mut(value: &mut Value) -> Option<&mut Self> {
                match value {
                    Value::$name(v) => Some(v),
                    _ => None,
                }
            }

            fn wrap(self) -> Value {
                Value::$name(self)
            }

            fn is_empty_container(&self) -> bool {
                let f: fn(&Self) -> bool = $empty;
                f(self)
            }
        }
    };
}

variant!(Bytes, String, |_| false);
variant!(VecDeque<Bytes>, List, |v| v.is_empty());
variant!(BTreeMap<Bytes, Bytes>, Hash, |v| v.is_empty());
variant!(BTreeSet<Bytes>, Set, |v| v.is_empty());
variant!(ZSet, ZSet, |v| v.len() == 0);

fn live<'a>(map: &'a Map, key: &[u8], now: u64) -> Option<&'a StoredValue> {
    map.get(key).filter(|v| !v.is_expired(now))
}

fn purge_expired(map: &mut Map, key: &[u8], now: u64) {
    if map.get(key).is_some_and(|v| v.is_expired(now)) {
        map.remove(key);
    }
}

fn read_as<'a, T: Variant>(map: &'a Map, key: &[u8], now: u64) -> Result<Option<&'a T>> {
    match live(map, key, now) {
        None => Ok(None),
        Some(v) => T::from_ref(&v.value).map(Some).ok_or(XdisError::WrongType),
    }
}

/// Existing value of type `T`, without creating it.
fn modify_as<'a, T: Variant>(map: &'a mut Map, key: &[u8], now: u64) -> Result<Option<&'a mut T>> {
    purge_expired(map, key, now);
    match map.get_mut(key) {
        None => Ok(None),
        Some(v) => T::from_mut(&mut v.value).map(Some).ok_or(XdisError::WrongType),
    }
}

/// Value of type `T`, created empty when missing.
fn write_as<'a, T: Variant>(map: &'a mut Map, key: &[u8], now: u64) -> Result<&'a mut T> {
    purge_expired(map, key, now);
    let entry = map
        .entry(Bytes::copy_from_slice(key))
        .or_insert_with(|| StoredValue::new(T::default().wrap()));
    T::from_mut(&mut entry.value).ok_or(XdisError::WrongType)
}

fn drop_if_empty<T: Variant>(map: &mut Map, key: &[u8]) {
    let empty = map
        .get(key)
        .and_then(|v| T::from_ref(&v.value))
        .is_some_and(|v| v.is_empty_container());
    if empty {
        map.remove(key);
    }
}

/// Clamp a Redis-style inclusive range (negative indexes count from the
/// end) to `0..len`.
fn normalize_range(start: i64, end: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }
    let start = if start < 0 { (start + len).max(0) } else { start };
    let end = if end < 0 { end + len } else { end.min(len - 1) };
    if start > end || start >= len {
        return None;
    }
    Some((start as usize, end as usize))
}

fn apply_limit<T>(items: impl Iterator<Item = T>, limit: Limit) -> Vec<T> {
    if limit.offset < 0 {
        return Vec::new();
    }
    let items = items.skip(limit.offset as usize);
    if limit.count < 0 {
        items.collect()
    } else {
        items.take(limit.count as usize).collect()
    }
}

fn lex_above_min(member: &[u8], min: &LexBound) -> bool {
    match min {
        LexBound::Unbounded => true,
        LexBound::Inclusive(b) => member >= &b[..],
        LexBound::Exclusive(b) => member > &b[..],
    }
}

fn lex_below_max(member: &[u8], max: &LexBound) -> bool {
    match max {
        LexBound::Unbounded => true,
        LexBound::Inclusive(b) => member <= &b[..],
        LexBound::Exclusive(b) => member < &b[..],
    }
}

fn lex_in_range(member: &[u8], min: &LexBound, max: &LexBound) -> bool {
    lex_above_min(member, min) && lex_below_max(member, max)
}

fn overflow() -> XdisError {
    XdisError::InvalidArgument("increment or decrement would overflow".to_string())
}

fn parse_stored_int(value: &[u8]) -> Result<i64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(XdisError::Value)
}

struct DbInner {
    index: usize,
    data: RwLock<Map>,
    push_signal: Arc<Notify>,
    hasher: SlotHasher,
}

impl DbInner {
    fn read(&self) -> Result<RwLockReadGuard<'_, Map>> {
        self.data
            .read()
            .map_err(|e| XdisError::Storage(format!("ERR lock error: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Map>> {
        self.data
            .write()
            .map_err(|e| XdisError::Storage(format!("ERR lock error: {}", e)))
    }

    /// Run `f` on the (possibly new) value of type `T` at `key`, dropping
    /// the key afterwards if it was left empty.
    fn mutate<T: Variant, R>(&self, key: &[u8], f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let mut map = self.write()?;
        let result = f(write_as::<T>(&mut map, key, now_ms())?);
        drop_if_empty::<T>(&mut map, key);
        result
    }

    /// Run `f` on an existing value of type `T`; `missing` when absent.
    fn modify<T: Variant, R>(
        &self,
        key: &[u8],
        missing: R,
        f: impl FnOnce(&mut T) -> Result<R>,
    ) -> Result<R> {
        let mut map = self.write()?;
        let result = match modify_as::<T>(&mut map, key, now_ms())? {
            Some(v) => f(v),
            None => Ok(missing),
        };
        drop_if_empty::<T>(&mut map, key);
        result
    }

    fn view<T: Variant, R>(&self, key: &[u8], missing: R, f: impl FnOnce(&T) -> R) -> Result<R> {
        let map = self.read()?;
        Ok(match read_as::<T>(&map, key, now_ms())? {
            Some(v) => f(v),
            None => missing,
        })
    }
}

/// Per-type projection of a database. `kind` restricts key management to
/// keys holding that type; `None` accepts any type.
struct TypedView {
    inner: Arc<DbInner>,
    kind: Option<DataType>,
}

impl TypedView {
    fn matches(&self, value: &StoredValue) -> bool {
        self.kind.map_or(true, |k| value.value.kind() == k)
    }

    fn with_live_mut<R>(
        &self,
        key: &[u8],
        missing: R,
        f: impl FnOnce(&mut Map, u64) -> R,
    ) -> Result<R> {
        let mut map = self.inner.write()?;
        let now = now_ms();
        purge_expired(&mut map, key, now);
        if !map.get(key).is_some_and(|v| self.matches(v)) {
            return Ok(missing);
        }
        Ok(f(&mut map, now))
    }

    fn expire_at_ms(&self, key: &[u8], at: u64) -> Result<i64> {
        self.with_live_mut(key, 0, |map, now| {
            if at <= now {
                map.remove(key);
            } else if let Some(v) = map.get_mut(key) {
                v.expires_at = Some(at);
            }
            1
        })
    }

    fn remaining_ms(&self, key: &[u8]) -> Result<Option<Option<u64>>> {
        let map = self.inner.read()?;
        let now = now_ms();
        Ok(live(&map, key, now)
            .filter(|v| self.matches(v))
            .map(|v| v.expires_at.map(|at| at.saturating_sub(now))))
    }
}

impl KeyOps for TypedView {
    fn del(&self, keys: &[Bytes]) -> Result<i64> {
        let mut map = self.inner.write()?;
        let now = now_ms();
        let mut removed = 0;
        for key in keys {
            purge_expired(&mut map, key, now);
            if map.get(&key[..]).is_some_and(|v| self.matches(v)) {
                map.remove(&key[..]);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn exists(&self, key: &[u8]) -> Result<i64> {
        let map = self.inner.read()?;
        Ok(live(&map, key, now_ms()).is_some_and(|v| self.matches(v)) as i64)
    }

    fn expire(&self, key: &[u8], seconds: i64) -> Result<i64> {
        self.pexpire(key, seconds.saturating_mul(1000))
    }

    fn expire_at(&self, key: &[u8], unix_seconds: i64) -> Result<i64> {
        self.expire_at_ms(key, unix_seconds.max(0).saturating_mul(1000) as u64)
    }

    fn pexpire(&self, key: &[u8], millis: i64) -> Result<i64> {
        let at = if millis <= 0 {
            0
        } else {
            now_ms().saturating_add(millis as u64)
        };
        self.expire_at_ms(key, at)
    }

    fn ttl(&self, key: &[u8]) -> Result<i64> {
        Ok(match self.remaining_ms(key)? {
            None => -2,
            Some(None) => -1,
            Some(Some(ms)) => ((ms + 500) / 1000) as i64,
        })
    }

    fn pttl(&self, key: &[u8]) -> Result<i64> {
        Ok(match self.remaining_ms(key)? {
            None => -2,
            Some(None) => -1,
            Some(Some(ms)) => ms as i64,
        })
    }

    fn persist(&self, key: &[u8]) -> Result<i64> {
        self.with_live_mut(key, 0, |map, _| match map.get_mut(key) {
            Some(v) if v.expires_at.is_some() => {
                v.expires_at = None;
                1
            }
            _ => 0,
        })
    }
}

impl StringStore for TypedView {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.inner.view::<Bytes, _>(key, None, |v| Some(v.clone()))
    }

    fn set(&self, key: &[u8], value: Bytes, opts: SetOptions) -> Result<bool> {
        let mut map = self.inner.write()?;
        let now = now_ms();
        purge_expired(&mut map, key, now);
        let exists = map.contains_key(key);
        match opts.condition {
            SetCondition::IfAbsent if exists => return Ok(false),
            SetCondition::IfPresent if !exists => return Ok(false),
            _ => {}
        }
        let mut stored = StoredValue::new(Value::String(value));
        if let Some(ms) = opts.expire_ms {
            stored.expires_at = Some(now.saturating_add(ms.max(0) as u64));
        }
        map.insert(Bytes::copy_from_slice(key), stored);
        Ok(true)
    }

    fn get_set(&self, key: &[u8], value: Bytes) -> Result<Option<Bytes>> {
        let mut map = self.inner.write()?;
        let now = now_ms();
        let old = read_as::<Bytes>(&map, key, now)?.cloned();
        map.insert(
            Bytes::copy_from_slice(key),
            StoredValue::new(Value::String(value)),
        );
        Ok(old)
    }

    fn append(&self, key: &[u8], value: &[u8]) -> Result<i64> {
        self.inner.mutate::<Bytes, _>(key, |s| {
            if s.len() + value.len() > MAX_STRING_LEN {
                return Err(XdisError::InvalidArgument(
                    "string exceeds maximum allowed size (512MB)".to_string(),
                ));
            }
            let mut buf = BytesMut::with_capacity(s.len() + value.len());
            buf.extend_from_slice(s);
            buf.extend_from_slice(value);
            *s = buf.freeze();
            Ok(s.len() as i64)
        })
    }

    fn incr_by(&self, key: &[u8], delta: i64) -> Result<i64> {
        let mut map = self.inner.write()?;
        let now = now_ms();
        let current = match read_as::<Bytes>(&map, key, now)? {
            Some(v) => parse_stored_int(v)?,
            None => 0,
        };
        let next = current.checked_add(delta).ok_or_else(overflow)?;
        let encoded = Bytes::from(next.to_string());
        match modify_as::<Bytes>(&mut map, key, now)? {
            Some(v) => *v = encoded,
            None => {
                map.insert(
                    Bytes::copy_from_slice(key),
                    StoredValue::new(Value::String(encoded)),
                );
            }
        }
        Ok(next)
    }

    fn get_range(&self, key: &[u8], start: i64, end: i64) -> Result<Bytes> {
        self.inner.view::<Bytes, _>(key, Bytes::new(), |s| {
            match normalize_range(start, end, s.len()) {
                Some((a, b)) => s.slice(a..=b),
                None => Bytes::new(),
            }
        })
    }

    fn set_range(&self, key: &[u8], offset: usize, value: &[u8]) -> Result<i64> {
        if value.is_empty() {
            return self.strlen(key);
        }
        if offset + value.len() > MAX_STRING_LEN {
            return Err(XdisError::InvalidArgument(
                "string exceeds maximum allowed size (512MB)".to_string(),
            ));
        }
        self.inner.mutate::<Bytes, _>(key, |s| {
            let mut buf = BytesMut::from(&s[..]);
            if buf.len() < offset + value.len() {
                buf.resize(offset + value.len(), 0);
            }
            buf[offset..offset + value.len()].copy_from_slice(value);
            *s = buf.freeze();
            Ok(s.len() as i64)
        })
    }

    fn strlen(&self, key: &[u8]) -> Result<i64> {
        self.inner.view::<Bytes, _>(key, 0, |s| s.len() as i64)
    }

    fn mget(&self, keys: &[Bytes]) -> Result<Vec<Option<Bytes>>> {
        let map = self.inner.read()?;
        let now = now_ms();
        Ok(keys
            .iter()
            .map(|k| {
                live(&map, k, now).and_then(|v| match &v.value {
                    Value::String(s) => Some(s.clone()),
                    _ => None,
                })
            })
            .collect())
    }

    fn mset(&self, pairs: &[(Bytes, Bytes)]) -> Result<()> {
        let mut map = self.inner.write()?;
        for (k, v) in pairs {
            map.insert(k.clone(), StoredValue::new(Value::String(v.clone())));
        }
        Ok(())
    }
}

impl ListStore for TypedView {
    fn lpush(&self, key: &[u8], values: &[Bytes]) -> Result<i64> {
        let len = self.inner.mutate::<VecDeque<Bytes>, _>(key, |list| {
            for v in values {
                list.push_front(v.clone());
            }
            Ok(list.len() as i64)
        })?;
        self.inner.push_signal.notify_waiters();
        Ok(len)
    }

    fn rpush(&self, key: &[u8], values: &[Bytes]) -> Result<i64> {
        let len = self.inner.mutate::<VecDeque<Bytes>, _>(key, |list| {
            list.extend(values.iter().cloned());
            Ok(list.len() as i64)
        })?;
        self.inner.push_signal.notify_waiters();
        Ok(len)
    }

    fn lpop(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.inner
            .modify::<VecDeque<Bytes>, _>(key, None, |list| Ok(list.pop_front()))
    }

    fn rpop(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.inner
            .modify::<VecDeque<Bytes>, _>(key, None, |list| Ok(list.pop_back()))
    }

    fn llen(&self, key: &[u8]) -> Result<i64> {
        self.inner
            .view::<VecDeque<Bytes>, _>(key, 0, |list| list.len() as i64)
    }

    fn lrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Bytes>> {
        self.inner.view::<VecDeque<Bytes>, _>(key, Vec::new(), |list| {
            match normalize_range(start, stop, list.len()) {
                Some((a, b)) => list.range(a..=b).cloned().collect(),
                None => Vec::new(),
            }
        })
    }

    fn lindex(&self, key: &[u8], index: i64) -> Result<Option<Bytes>> {
        self.inner.view::<VecDeque<Bytes>, _>(key, None, |list| {
            let i = if index < 0 {
                index + list.len() as i64
            } else {
                index
            };
            if i < 0 {
                None
            } else {
                list.get(i as usize).cloned()
            }
        })
    }

    fn lset(&self, key: &[u8], index: i64, value: Bytes) -> Result<()> {
        let found = self
            .inner
            .modify::<VecDeque<Bytes>, _>(key, false, |list| {
                let i = if index < 0 {
                    index + list.len() as i64
                } else {
                    index
                };
                match usize::try_from(i).ok().and_then(|i| list.get_mut(i)) {
                    Some(slot) => {
                        *slot = value;
                        Ok(true)
                    }
                    None => Err(XdisError::Storage("ERR index out of range".to_string())),
                }
            })?;
        if found {
            Ok(())
        } else {
            Err(XdisError::Storage("ERR no such key".to_string()))
        }
    }

    fn push_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.inner.push_signal)
    }
}

impl HashStore for TypedView {
    fn hset(&self, key: &[u8], pairs: &[(Bytes, Bytes)]) -> Result<i64> {
        self.inner.mutate::<BTreeMap<Bytes, Bytes>, _>(key, |hash| {
            let mut created = 0;
            for (f, v) in pairs {
                if hash.insert(f.clone(), v.clone()).is_none() {
                    created += 1;
                }
            }
            Ok(created)
        })
    }

    fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Bytes>> {
        self.inner
            .view::<BTreeMap<Bytes, Bytes>, _>(key, None, |hash| hash.get(field).cloned())
    }

    fn hdel(&self, key: &[u8], fields: &[Bytes]) -> Result<i64> {
        self.inner
            .modify::<BTreeMap<Bytes, Bytes>, _>(key, 0, |hash| {
                Ok(fields.iter().filter(|f| hash.remove(&f[..]).is_some()).count() as i64)
            })
    }

    fn hgetall(&self, key: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        self.inner
            .view::<BTreeMap<Bytes, Bytes>, _>(key, Vec::new(), |hash| {
                hash.iter().map(|(f, v)| (f.clone(), v.clone())).collect()
            })
    }

    fn hkeys(&self, key: &[u8]) -> Result<Vec<Bytes>> {
        self.inner
            .view::<BTreeMap<Bytes, Bytes>, _>(key, Vec::new(), |hash| {
                hash.keys().cloned().collect()
            })
    }

    fn hvals(&self, key: &[u8]) -> Result<Vec<Bytes>> {
        self.inner
            .view::<BTreeMap<Bytes, Bytes>, _>(key, Vec::new(), |hash| {
                hash.values().cloned().collect()
            })
    }

    fn hlen(&self, key: &[u8]) -> Result<i64> {
        self.inner
            .view::<BTreeMap<Bytes, Bytes>, _>(key, 0, |hash| hash.len() as i64)
    }

    fn hmget(&self, key: &[u8], fields: &[Bytes]) -> Result<Vec<Option<Bytes>>> {
        self.inner.view::<BTreeMap<Bytes, Bytes>, _>(
            key,
            vec![None; fields.len()],
            |hash| fields.iter().map(|f| hash.get(&f[..]).cloned()).collect(),
        )
    }

    fn hincr_by(&self, key: &[u8], field: &[u8], delta: i64) -> Result<i64> {
        let current = self
            .inner
            .view::<BTreeMap<Bytes, Bytes>, _>(key, None, |hash| hash.get(field).cloned())?;
        let current = match current {
            Some(v) => parse_stored_int(&v).map_err(|_| {
                XdisError::InvalidArgument("hash value is not an integer".to_string())
            })?,
            None => 0,
        };
        let next = current.checked_add(delta).ok_or_else(overflow)?;
        self.inner.mutate::<BTreeMap<Bytes, Bytes>, _>(key, |hash| {
            hash.insert(
                Bytes::copy_from_slice(field),
                Bytes::from(next.to_string()),
            );
            Ok(next)
        })
    }
}

impl TypedView {
    fn collect_sets(&self, map: &Map, keys: &[Bytes], now: u64) -> Result<Vec<BTreeSet<Bytes>>> {
        keys.iter()
            .map(|k| Ok(read_as::<BTreeSet<Bytes>>(map, k, now)?.cloned().unwrap_or_default()))
            .collect()
    }

    fn combine_locked(&self, map: &Map, op: SetOp, keys: &[Bytes]) -> Result<BTreeSet<Bytes>> {
        let mut sets = self.collect_sets(map, keys, now_ms())?.into_iter();
        let Some(first) = sets.next() else {
            return Ok(BTreeSet::new());
        };
        Ok(sets.fold(first, |acc, s| match op {
            SetOp::Diff => acc.difference(&s).cloned().collect(),
            SetOp::Inter => acc.intersection(&s).cloned().collect(),
            SetOp::Union => acc.union(&s).cloned().collect(),
        }))
    }
}

impl SetStore for TypedView {
    fn sadd(&self, key: &[u8], members: &[Bytes]) -> Result<i64> {
        self.inner.mutate::<BTreeSet<Bytes>, _>(key, |set| {
            Ok(members.iter().filter(|m| set.insert((*m).clone())).count() as i64)
        })
    }

    fn srem(&self, key: &[u8], members: &[Bytes]) -> Result<i64> {
        self.inner.modify::<BTreeSet<Bytes>, _>(key, 0, |set| {
            Ok(members.iter().filter(|m| set.remove(&m[..])).count() as i64)
        })
    }

    fn scard(&self, key: &[u8]) -> Result<i64> {
        self.inner
            .view::<BTreeSet<Bytes>, _>(key, 0, |set| set.len() as i64)
    }

    fn sismember(&self, key: &[u8], member: &[u8]) -> Result<bool> {
        self.inner
            .view::<BTreeSet<Bytes>, _>(key, false, |set| set.contains(member))
    }

    fn smembers(&self, key: &[u8]) -> Result<Vec<Bytes>> {
        self.inner
            .view::<BTreeSet<Bytes>, _>(key, Vec::new(), |set| set.iter().cloned().collect())
    }

    fn combine(&self, op: SetOp, keys: &[Bytes]) -> Result<Vec<Bytes>> {
        let map = self.inner.read()?;
        Ok(self.combine_locked(&map, op, keys)?.into_iter().collect())
    }

    fn combine_store(&self, op: SetOp, dest: &[u8], keys: &[Bytes]) -> Result<i64> {
        let mut map = self.inner.write()?;
        let result = self.combine_locked(&map, op, keys)?;
        let len = result.len() as i64;
        if result.is_empty() {
            map.remove(dest);
        } else {
            map.insert(
                Bytes::copy_from_slice(dest),
                StoredValue::new(Value::Set(result)),
            );
        }
        Ok(len)
    }
}

impl ZSetStore for TypedView {
    fn zadd(&self, key: &[u8], pairs: &[ScorePair]) -> Result<i64> {
        self.inner.mutate::<ZSet, _>(key, |z| {
            Ok(pairs
                .iter()
                .filter(|p| z.insert(p.member.clone(), p.score))
                .count() as i64)
        })
    }

    fn zcard(&self, key: &[u8]) -> Result<i64> {
        self.inner.view::<ZSet, _>(key, 0, |z| z.len() as i64)
    }

    fn zcount(&self, key: &[u8], min: i64, max: i64) -> Result<i64> {
        if min > max {
            return Ok(0);
        }
        self.inner.view::<ZSet, _>(key, 0, |z| {
            z.ordered
                .iter()
                .filter(|(s, _)| (min..=max).contains(s))
                .count() as i64
        })
    }

    fn zincr_by(&self, key: &[u8], delta: i64, member: &[u8]) -> Result<i64> {
        self.inner.mutate::<ZSet, _>(key, |z| {
            let current = z.scores.get(member).copied().unwrap_or(0);
            let next = current.checked_add(delta).ok_or_else(overflow)?;
            z.insert(Bytes::copy_from_slice(member), next);
            Ok(next)
        })
    }

    fn zrange(&self, key: &[u8], start: i64, stop: i64, reverse: bool) -> Result<Vec<ScorePair>> {
        self.inner.view::<ZSet, _>(key, Vec::new(), |z| {
            match normalize_range(start, stop, z.len()) {
                Some((a, b)) => z
                    .pairs(reverse)
                    .skip(a)
                    .take(b - a + 1)
                    .map(|(s, m)| ScorePair {
                        member: m.clone(),
                        score: *s,
                    })
                    .collect(),
                None => Vec::new(),
            }
        })
    }

    fn zrange_by_score(
        &self,
        key: &[u8],
        min: i64,
        max: i64,
        limit: Limit,
        reverse: bool,
    ) -> Result<Vec<ScorePair>> {
        if min > max {
            return Ok(Vec::new());
        }
        self.inner.view::<ZSet, _>(key, Vec::new(), |z| {
            let hits = z
                .pairs(reverse)
                .filter(|(s, _)| (min..=max).contains(s))
                .map(|(s, m)| ScorePair {
                    member: m.clone(),
                    score: *s,
                });
            apply_limit(hits, limit)
        })
    }

    fn zrank(&self, key: &[u8], member: &[u8], reverse: bool) -> Result<Option<i64>> {
        self.inner
            .view::<ZSet, _>(key, None, |z| z.rank(member, reverse))
    }

    fn zrem(&self, key: &[u8], members: &[Bytes]) -> Result<i64> {
        self.inner.modify::<ZSet, _>(key, 0, |z| {
            Ok(members.iter().filter(|m| z.remove(m)).count() as i64)
        })
    }

    fn zrem_range_by_rank(&self, key: &[u8], start: i64, stop: i64) -> Result<i64> {
        self.inner.modify::<ZSet, _>(key, 0, |z| {
            let Some((a, b)) = normalize_range(start, stop, z.len()) else {
                return Ok(0);
            };
            let doomed: Vec<Bytes> = z
                .ordered
                .iter()
                .skip(a)
                .take(b - a + 1)
                .map(|(_, m)| m.clone())
                .collect();
            Ok(doomed.iter().filter(|m| z.remove(m)).count() as i64)
        })
    }

    fn zrem_range_by_score(&self, key: &[u8], min: i64, max: i64) -> Result<i64> {
        if min > max {
            return Ok(0);
        }
        self.inner.modify::<ZSet, _>(key, 0, |z| {
            let doomed: Vec<Bytes> = z
                .ordered
                .iter()
                .filter(|(s, _)| (min..=max).contains(s))
                .map(|(_, m)| m.clone())
                .collect();
            Ok(doomed.iter().filter(|m| z.remove(m)).count() as i64)
        })
    }

    fn zscore(&self, key: &[u8], member: &[u8]) -> Result<Option<i64>> {
        self.inner
            .view::<ZSet, _>(key, None, |z| z.scores.get(member).copied())
    }

    fn zstore(
        &self,
        op: ZSetOp,
        dest: &[u8],
        keys: &[Bytes],
        weights: Option<&[i64]>,
        aggregate: Aggregate,
    ) -> Result<i64> {
        let mut map = self.inner.write()?;
        let now = now_ms();

        let mut inputs = Vec::with_capacity(keys.len());
        for (i, k) in keys.iter().enumerate() {
            let weight = weights.and_then(|w| w.get(i).copied()).unwrap_or(1);
            let z = read_as::<ZSet>(&map, k, now)?.cloned().unwrap_or_default();
            inputs.push((z, weight));
        }

        let mut acc: HashMap<Bytes, i64> = HashMap::new();
        let mut seen: HashMap<Bytes, usize> = HashMap::new();
        for (z, weight) in &inputs {
            for (member, score) in &z.scores {
                let weighted = score.saturating_mul(*weight);
                *seen.entry(member.clone()).or_insert(0) += 1;
                acc.entry(member.clone())
                    .and_modify(|cur| {
                        *cur = match aggregate {
                            Aggregate::Sum => cur.saturating_add(weighted),
                            Aggregate::Min => (*cur).min(weighted),
                            Aggregate::Max => (*cur).max(weighted),
                        }
                    })
                    .or_insert(weighted);
            }
        }

        let mut result = ZSet::default();
        for (member, score) in acc {
            if op == ZSetOp::Inter && seen.get(&member).copied() != Some(inputs.len()) {
                continue;
            }
            result.insert(member, score);
        }

        let len = result.len() as i64;
        if len == 0 {
            map.remove(dest);
        } else {
            map.insert(
                Bytes::copy_from_slice(dest),
                StoredValue::new(Value::ZSet(result)),
            );
        }
        Ok(len)
    }

    fn zrange_by_lex(
        &self,
        key: &[u8],
        min: &LexBound,
        max: &LexBound,
        limit: Limit,
    ) -> Result<Vec<Bytes>> {
        self.inner.view::<ZSet, _>(key, Vec::new(), |z| {
            let hits = z
                .ordered
                .iter()
                .filter(|(_, m)| lex_in_range(m, min, max))
                .map(|(_, m)| m.clone());
            apply_limit(hits, limit)
        })
    }

    fn zrem_range_by_lex(&self, key: &[u8], min: &LexBound, max: &LexBound) -> Result<i64> {
        self.inner.modify::<ZSet, _>(key, 0, |z| {
            let doomed: Vec<Bytes> = z
                .ordered
                .iter()
                .filter(|(_, m)| lex_in_range(m, min, max))
                .map(|(_, m)| m.clone())
                .collect();
            Ok(doomed.iter().filter(|m| z.remove(m)).count() as i64)
        })
    }

    fn zlex_count(&self, key: &[u8], min: &LexBound, max: &LexBound) -> Result<i64> {
        self.inner.view::<ZSet, _>(key, 0, |z| {
            z.ordered
                .iter()
                .filter(|(_, m)| lex_in_range(m, min, max))
                .count() as i64
        })
    }
}

impl BitmapStore for TypedView {
    fn bitcount(&self, key: &[u8], start: i64, end: i64) -> Result<i64> {
        self.inner.view::<Bytes, _>(key, 0, |s| {
            match normalize_range(start, end, s.len()) {
                Some((a, b)) => s[a..=b].iter().map(|b| b.count_ones() as i64).sum(),
                None => 0,
            }
        })
    }

    fn bitop(&self, op: BitOp, dest: &[u8], keys: &[Bytes]) -> Result<i64> {
        if op == BitOp::Not && keys.len() != 1 {
            return Err(XdisError::InvalidArgument(
                "BITOP NOT must be called with a single source key.".to_string(),
            ));
        }
        let mut map = self.inner.write()?;
        let now = now_ms();
        let mut sources = Vec::with_capacity(keys.len());
        for k in keys {
            sources.push(read_as::<Bytes>(&map, k, now)?.cloned().unwrap_or_default());
        }

        let len = sources.iter().map(|s| s.len()).max().unwrap_or(0);
        let mut out = vec![0u8; len];
        for (i, byte) in out.iter_mut().enumerate() {
            let at = |s: &Bytes| s.get(i).copied().unwrap_or(0);
            *byte = match op {
                BitOp::Not => !at(&sources[0]),
                BitOp::And => sources.iter().map(at).fold(0xff, |a, b| a & b),
                BitOp::Or => sources.iter().map(at).fold(0, |a, b| a | b),
                BitOp::Xor => sources.iter().map(at).fold(0, |a, b| a ^ b),
            };
        }

        if out.is_empty() {
            map.remove(dest);
        } else {
            map.insert(
                Bytes::copy_from_slice(dest),
                StoredValue::new(Value::String(Bytes::from(out))),
            );
        }
        Ok(len as i64)
    }

    fn bitpos(&self, key: &[u8], bit: u8, start: i64, end: Option<i64>) -> Result<i64> {
        let want_one = bit == 1;
        self.inner
            .view::<Bytes, _>(key, if want_one { -1 } else { 0 }, |s| {
                let Some((a, b)) = normalize_range(start, end.unwrap_or(-1), s.len()) else {
                    return -1;
                };
                for (i, byte) in s[a..=b].iter().enumerate() {
                    let masked = if want_one { *byte } else { !*byte };
                    if masked != 0 {
                        return ((a + i) * 8) as i64 + masked.leading_zeros() as i64;
                    }
                }
                if !want_one && end.is_none() {
                    // Clear bits are assumed past the end of the string.
                    ((b + 1) * 8) as i64
                } else {
                    -1
                }
            })
    }

    fn getbit(&self, key: &[u8], offset: u64) -> Result<i64> {
        self.inner.view::<Bytes, _>(key, 0, |s| {
            let byte = (offset / 8) as usize;
            s.get(byte)
                .map_or(0, |b| ((b >> (7 - offset % 8)) & 1) as i64)
        })
    }

    fn setbit(&self, key: &[u8], offset: u64, on: bool) -> Result<i64> {
        let byte = (offset / 8) as usize;
        if byte >= MAX_STRING_LEN {
            return Err(XdisError::InvalidArgument(
                "bit offset is not an integer or out of range".to_string(),
            ));
        }
        self.inner.mutate::<Bytes, _>(key, |s| {
            let mut buf = BytesMut::from(&s[..]);
            if buf.len() <= byte {
                buf.resize(byte + 1, 0);
            }
            let mask = 1u8 << (7 - offset % 8);
            let old = (buf[byte] & mask != 0) as i64;
            if on {
                buf[byte] |= mask;
            } else {
                buf[byte] &= !mask;
            }
            *s = buf.freeze();
            Ok(old)
        })
    }
}

impl SlotStore for TypedView {
    fn hash_keys(&self, keys: &[Bytes]) -> Result<Vec<u64>> {
        Ok(keys.iter().map(|k| self.inner.hasher.key_slot(k)).collect())
    }

    fn slots_info(&self, start: u64, count: u64, _with_size: bool) -> Result<Vec<SlotInfo>> {
        let total = self.inner.hasher.slot_count();
        let end = if count == 0 {
            total
        } else {
            start.saturating_add(count).min(total)
        };
        let map = self.inner.read()?;
        let now = now_ms();
        let mut sizes: BTreeMap<u64, u64> = BTreeMap::new();
        for (key, value) in map.iter() {
            if value.is_expired(now) {
                continue;
            }
            let slot = self.inner.hasher.key_slot(key);
            if (start..end).contains(&slot) {
                *sizes.entry(slot).or_insert(0) += 1;
            }
        }
        Ok(sizes
            .into_iter()
            .map(|(slot, size)| SlotInfo { slot, size })
            .collect())
    }

    fn slots_del(&self, slots: &[u64]) -> Result<Vec<SlotInfo>> {
        let mut map = self.inner.write()?;
        let hasher = self.inner.hasher;
        map.retain(|key, _| !slots.contains(&hasher.key_slot(key)));
        Ok(slots
            .iter()
            .map(|&slot| SlotInfo { slot, size: 0 })
            .collect())
    }

    fn check(&self) -> Result<()> {
        let map = self.inner.read()?;
        let total = self.inner.hasher.slot_count();
        match map.keys().find(|k| self.inner.hasher.key_slot(k) >= total) {
            Some(k) => Err(XdisError::Storage(format!(
                "ERR key '{}' hashes outside the slot table",
                String::from_utf8_lossy(k)
            ))),
            None => Ok(()),
        }
    }

    fn restore(&self, entries: &[RestoreEntry]) -> Result<()> {
        let mut decoded = Vec::with_capacity(entries.len());
        for entry in entries {
            let dump: DumpValue = bincode::deserialize(&entry.value).map_err(|e| {
                XdisError::Storage(format!("ERR bad restore payload: {}", e))
            })?;
            decoded.push(StoredValue {
                value: dump.into(),
                expires_at: entry.expire_at_ms,
            });
        }

        let mut map = self.inner.write()?;
        for (entry, stored) in entries.iter().zip(decoded) {
            map.insert(entry.key.clone(), stored);
        }
        Ok(())
    }

    fn dump(&self, key: &[u8]) -> Result<Option<DumpedKey>> {
        let map = self.inner.read()?;
        let now = now_ms();
        let Some(stored) = live(&map, key, now) else {
            return Ok(None);
        };
        let value = bincode::serialize(&DumpValue::from(&stored.value))
            .map_err(|e| XdisError::Storage(format!("ERR dump failed: {}", e)))?;
        let ttl_ms = match stored.expires_at {
            Some(at) => at.saturating_sub(now).max(1) as i64,
            None => 0,
        };
        Ok(Some(DumpedKey {
            key: Bytes::copy_from_slice(key),
            ttl_ms,
            expire_at_ms: stored.expires_at,
            value: Bytes::from(value),
        }))
    }

    fn remove_unchanged(&self, dumped: &DumpedKey) -> Result<bool> {
        let mut map = self.inner.write()?;
        let unchanged = match live(&map, &dumped.key, now_ms()) {
            Some(stored) if stored.expires_at == dumped.expire_at_ms => {
                let current = bincode::serialize(&DumpValue::from(&stored.value))
                    .map_err(|e| XdisError::Storage(format!("ERR dump failed: {}", e)))?;
                current[..] == dumped.value[..]
            }
            _ => false,
        };
        if unchanged {
            map.remove(&dumped.key[..]);
        }
        Ok(unchanged)
    }

    fn slot_keys(&self, slot: u64) -> Result<Vec<Bytes>> {
        let map = self.inner.read()?;
        let now = now_ms();
        let mut keys: Vec<Bytes> = map
            .iter()
            .filter(|(k, v)| !v.is_expired(now) && self.inner.hasher.key_slot(k) == slot)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn tag_keys(&self, key: &[u8]) -> Result<Vec<Bytes>> {
        let tag = SlotHasher::hash_tag(key);
        let map = self.inner.read()?;
        let now = now_ms();
        let mut keys: Vec<Bytes> = map
            .iter()
            .filter(|(k, v)| !v.is_expired(now) && SlotHasher::hash_tag(k) == tag)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn tag_of(&self, key: &[u8]) -> Bytes {
        SlotHasher::tag_bytes(key)
    }
}

/// One in-memory database.
pub struct MemoryDb {
    inner: Arc<DbInner>,
    any: TypedView,
    strings: TypedView,
    lists: TypedView,
    hashes: TypedView,
    sets: TypedView,
    zsets: TypedView,
}

impl MemoryDb {
    fn new(index: usize, hasher: SlotHasher) -> Self {
        let inner = Arc::new(DbInner {
            index,
            data: RwLock::new(HashMap::new()),
            push_signal: Arc::new(Notify::new()),
            hasher,
        });
        let view = |kind| TypedView {
            inner: Arc::clone(&inner),
            kind,
        };
        Self {
            any: view(None),
            strings: view(Some(DataType::String)),
            lists: view(Some(DataType::List)),
            hashes: view(Some(DataType::Hash)),
            sets: view(Some(DataType::Set)),
            zsets: view(Some(DataType::ZSet)),
            inner,
        }
    }

    fn stat(&self) -> Result<KeyspaceStat> {
        let map = self.inner.read()?;
        let now = now_ms();
        let live = map.values().filter(|v| !v.is_expired(now));
        let (keys, expires) = live.fold((0, 0), |(k, e), v| {
            (k + 1, e + v.expires_at.is_some() as u64)
        });
        Ok(KeyspaceStat {
            db: self.inner.index,
            keys,
            expires,
        })
    }
}

impl Db for MemoryDb {
    fn index(&self) -> usize {
        self.inner.index
    }

    fn flush(&self) -> Result<i64> {
        let mut map = self.inner.write()?;
        let n = map.len() as i64;
        map.clear();
        Ok(n)
    }

    fn keys(&self) -> &dyn KeyOps {
        &self.any
    }

    fn strings(&self) -> &dyn StringStore {
        &self.strings
    }

    fn lists(&self) -> &dyn ListStore {
        &self.lists
    }

    fn hashes(&self) -> &dyn HashStore {
        &self.hashes
    }

    fn sets(&self) -> &dyn SetStore {
        &self.sets
    }

    fn zsets(&self) -> &dyn ZSetStore {
        &self.zsets
    }

    fn bitmaps(&self) -> &dyn BitmapStore {
        &self.strings
    }

    fn slots(&self) -> Option<&dyn SlotStore> {
        Some(&self.any)
    }
}

/// In-memory backend with a fixed number of databases.
pub struct MemoryStorage {
    databases: Vec<Arc<MemoryDb>>,
}

impl MemoryStorage {
    pub fn new(db_count: usize, slot_count: u64) -> Self {
        let hasher = SlotHasher::new(slot_count);
        Self {
            databases: (0..db_count.max(1))
                .map(|i| Arc::new(MemoryDb::new(i, hasher)))
                .collect(),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(16, super::slot::DEFAULT_SLOT_COUNT)
    }
}

impl Storager for MemoryStorage {
    fn select(&self, index: usize) -> Result<Arc<dyn Db>> {
        self.databases
            .get(index)
            .map(|db| Arc::clone(db) as Arc<dyn Db>)
            .ok_or(XdisError::DbIndex)
    }

    fn flush_all(&self) -> Result<()> {
        for db in &self.databases {
            db.flush()?;
        }
        Ok(())
    }

    fn db_count(&self) -> usize {
        self.databases.len()
    }

    fn keyspace_stats(&self) -> Result<Vec<KeyspaceStat>> {
        let mut stats = Vec::new();
        for db in &self.databases {
            let stat = db.stat()?;
            if stat.keys > 0 {
                stats.push(stat);
            }
        }
        Ok(stats)
    }
}

//! Publish/subscribe bus.
//!
//! Every subscribed connection owns one bounded mpsc receiver; the bus keeps
//! a clone of its sender under each channel or pattern the connection is
//! subscribed to. Publishing never blocks: a subscriber whose queue is full
//! misses the message.

use crate::protocol::RespValue;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

/// Messages buffered per subscriber before it starts missing them.
pub const SUBSCRIBER_CAPACITY: usize = 256;

/// Longer patterns are refused; every publish has to glob-match them.
const MAX_PATTERN_LEN: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubMessage {
    pub channel: Bytes,
    pub data: Bytes,
    /// Set when delivered through a pattern subscription.
    pub pattern: Option<Bytes>,
}

impl PubMessage {
    /// `message channel data` or `pmessage pattern channel data`.
    pub fn to_frame(&self) -> RespValue {
        let mut parts = Vec::with_capacity(4);
        match &self.pattern {
            Some(pattern) => {
                parts.push(RespValue::bulk_string("pmessage"));
                parts.push(RespValue::bulk_string(pattern.clone()));
            }
            None => parts.push(RespValue::bulk_string("message")),
        }
        parts.push(RespValue::bulk_string(self.channel.clone()));
        parts.push(RespValue::bulk_string(self.data.clone()));
        RespValue::array(parts)
    }
}

type Subscribers = HashMap<u64, mpsc::Sender<PubMessage>>;

#[derive(Default)]
pub struct PubSub {
    channels: RwLock<HashMap<Bytes, Subscribers>>,
    patterns: RwLock<HashMap<Bytes, Subscribers>>,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the subscription is new.
    pub fn subscribe(&self, channel: Bytes, id: u64, tx: mpsc::Sender<PubMessage>) -> bool {
        add(&self.channels, channel, id, tx)
    }

    /// Returns whether the subscription is new. Overlong patterns are ignored.
    pub fn psubscribe(&self, pattern: Bytes, id: u64, tx: mpsc::Sender<PubMessage>) -> bool {
        if pattern.len() > MAX_PATTERN_LEN {
            debug!(len = pattern.len(), "pattern too long, ignoring psubscribe");
            return false;
        }
        add(&self.patterns, pattern, id, tx)
    }

    pub fn unsubscribe(&self, channel: &[u8], id: u64) -> bool {
        remove(&self.channels, channel, id)
    }

    pub fn punsubscribe(&self, pattern: &[u8], id: u64) -> bool {
        remove(&self.patterns, pattern, id)
    }

    /// Drops every subscription held by `id`.
    pub fn remove_subscriber(&self, id: u64) {
        for map in [&self.channels, &self.patterns] {
            let mut map = map.write().unwrap_or_else(|e| e.into_inner());
            map.retain(|_, subs| {
                subs.remove(&id);
                !subs.is_empty()
            });
        }
    }

    /// Returns the number of subscribers the message was queued for.
    pub fn publish(&self, channel: &[u8], data: Bytes) -> i64 {
        let channel = Bytes::copy_from_slice(channel);
        let mut delivered = 0;

        {
            let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
            if let Some(subs) = channels.get(&channel) {
                let msg = PubMessage {
                    channel: channel.clone(),
                    data: data.clone(),
                    pattern: None,
                };
                delivered += deliver(subs, &msg);
            }
        }

        let patterns = self.patterns.read().unwrap_or_else(|e| e.into_inner());
        for (pattern, subs) in patterns.iter() {
            if glob_match(pattern, &channel) {
                let msg = PubMessage {
                    channel: channel.clone(),
                    data: data.clone(),
                    pattern: Some(pattern.clone()),
                };
                delivered += deliver(subs, &msg);
            }
        }
        delivered
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.read().map(|m| m.len()).unwrap_or(0)
    }
}

fn add(map: &RwLock<HashMap<Bytes, Subscribers>>, key: Bytes, id: u64, tx: mpsc::Sender<PubMessage>) -> bool {
    let mut map = map.write().unwrap_or_else(|e| e.into_inner());
    map.entry(key).or_default().insert(id, tx).is_none()
}

fn remove(map: &RwLock<HashMap<Bytes, Subscribers>>, key: &[u8], id: u64) -> bool {
    let mut map = map.write().unwrap_or_else(|e| e.into_inner());
    let Some(subs) = map.get_mut(key) else {
        return false;
    };
    let removed = subs.remove(&id).is_some();
    if subs.is_empty() {
        map.remove(key);
    }
    removed
}

fn deliver(subs: &Subscribers, msg: &PubMessage) -> i64 {
    let mut n = 0;
    for (id, tx) in subs {
        match tx.try_send(msg.clone()) {
            Ok(()) => n += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(subscriber = id, "subscriber queue full, dropping message")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
    n
}

/// Byte-wise glob matching: `*`, `?`, `[set]`, `[^set]`, `[a-z]` and `\x`.
///
/// Backtracks only to the most recent `*`, so matching is linear in
/// practice.
pub fn glob_match(pattern: &[u8], input: &[u8]) -> bool {
    let (mut p, mut i) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while i < input.len() {
        let step = match pattern.get(p) {
            Some(b'*') => {
                star = Some((p, i));
                p += 1;
                continue;
            }
            Some(b'?') => Some(1),
            Some(b'\\') if p + 1 < pattern.len() => (pattern[p + 1] == input[i]).then_some(2),
            Some(b'[') => match class_match(&pattern[p..], input[i]) {
                Some((true, len)) => Some(len),
                Some((false, _)) => None,
                // Unterminated class: treat `[` literally.
                None => (input[i] == b'[').then_some(1),
            },
            Some(&c) => (c == input[i]).then_some(1),
            None => None,
        };

        match step {
            Some(len) => {
                p += len;
                i += 1;
            }
            None => match star {
                Some((sp, si)) => {
                    p = sp + 1;
                    i = si + 1;
                    star = Some((sp, si + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

/// Matches `[...]` at the start of `class` against `c`; returns the match
/// and the class length, or `None` when the bracket is unterminated.
fn class_match(class: &[u8], c: u8) -> Option<(bool, usize)> {
    let mut j = 1;
    let negate = class.get(j) == Some(&b'^');
    if negate {
        j += 1;
    }
    let mut hit = false;
    while j < class.len() && class[j] != b']' {
        if class[j] == b'\\' && j + 1 < class.len() {
            hit |= class[j + 1] == c;
            j += 2;
        } else if j + 2 < class.len() && class[j + 1] == b'-' && class[j + 2] != b']' {
            let (lo, hi) = if class[j] <= class[j + 2] {
                (class[j], class[j + 2])
            } else {
                (class[j + 2], class[j])
            };
            hit |= (lo..=hi).contains(&c);
            j += 3;
        } else {
            hit |= class[j] == c;
            j += 1;
        }
    }
    (j < class.len()).then_some((hit != negate, j + 1))
}

//! # In-Memory Store
//!
//! Backing map for the test server: byte keys, typed values (strings, lists,
//! sets, hashes, sorted sets), and optional deadlines. Expired entries are
//! hidden on access and removed lazily, or in bulk by `purge_expired`. A
//! collection whose last element is removed disappears with its key.
//!
//! Several servers may share one store to stand in for replicated endpoints
//! that all see the same data.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;

/// Failure of a typed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// The key holds a different kind of value.
    WrongType,
    /// The stored string is not a 64-bit integer, or would overflow.
    NotInteger,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// TTL state of a key, mirroring Redis semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

#[derive(Debug)]
enum Value {
    Str(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Set(HashSet<Vec<u8>>),
    Hash(HashMap<Vec<u8>, Vec<u8>>),
    /// Ordered by score, then by member bytes.
    SortedSet(Vec<(f64, Vec<u8>)>),
}

impl Value {
    fn is_drained(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::List(items) => items.is_empty(),
            Value::Set(members) => members.is_empty(),
            Value::Hash(fields) => fields.is_empty(),
            Value::SortedSet(members) => members.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    // Absolute expiration timestamp.
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

/// Thread-safe map with per-key expiry.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<HashMap<Vec<u8>, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the string value unless the key is missing, expired, or
    /// holds a collection.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.get_string(key).ok().flatten()
    }

    /// Like `get`, but reports a collection as `WrongType`.
    pub fn get_string(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let now = Instant::now();
        {
            let map = self.map.read();
            match map.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => {
                    return match &entry.value {
                        Value::Str(value) => Ok(Some(value.clone())),
                        _ => Err(StoreError::WrongType),
                    }
                }
                Some(_) => {}
            }
        }
        // Expired: upgrade to a write lock and drop it.
        self.remove_if_expired(key, now);
        Ok(None)
    }

    /// Inserts or replaces a string value of any previous kind. `ttl` of
    /// `None` clears any expiry.
    pub fn set(&self, key: Vec<u8>, value: Vec<u8>, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.map.write().insert(
            key,
            Entry {
                value: Value::Str(value),
                expires_at,
            },
        );
    }

    /// Inserts only when the key is missing or expired. Returns true when
    /// the value was stored.
    pub fn set_if_absent(&self, key: Vec<u8>, value: Vec<u8>, ttl: Option<Duration>) -> bool {
        let now = Instant::now();
        let mut map = self.map.write();
        if map.get(&key).is_some_and(|entry| !entry.is_expired(now)) {
            return false;
        }
        map.insert(
            key,
            Entry {
                value: Value::Str(value),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        true
    }

    /// Adds one to the integer stored at `key`, starting from zero. Keeps any
    /// expiry already set.
    pub fn incr(&self, key: &[u8]) -> StoreResult<i64> {
        self.update(
            key,
            || Value::Str(b"0".to_vec()),
            |value| match value {
                Value::Str(digits) => {
                    let current: i64 = std::str::from_utf8(digits)
                        .ok()
                        .and_then(|text| text.parse().ok())
                        .ok_or(StoreError::NotInteger)?;
                    let next = current.checked_add(1).ok_or(StoreError::NotInteger)?;
                    *digits = next.to_string().into_bytes();
                    Ok(next)
                }
                _ => Err(StoreError::WrongType),
            },
        )
    }

    /// Pushes each value onto the head in turn, so the last one ends up
    /// first. Returns the new length.
    pub fn lpush(&self, key: &[u8], values: &[Vec<u8>]) -> StoreResult<usize> {
        self.update(
            key,
            || Value::List(VecDeque::new()),
            |value| match value {
                Value::List(items) => {
                    for item in values {
                        items.push_front(item.clone());
                    }
                    Ok(items.len())
                }
                _ => Err(StoreError::WrongType),
            },
        )
    }

    /// Elements from `start` to `stop` inclusive; negative indexes count
    /// from the tail.
    pub fn lrange(&self, key: &[u8], start: i64, stop: i64) -> StoreResult<Vec<Vec<u8>>> {
        self.read(key, |value| match value {
            None => Ok(Vec::new()),
            Some(Value::List(items)) => {
                let len = items.len() as i64;
                let start = if start < 0 { (len + start).max(0) } else { start };
                let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
                if start > stop {
                    return Ok(Vec::new());
                }
                Ok(items
                    .iter()
                    .skip(start as usize)
                    .take((stop - start + 1) as usize)
                    .cloned()
                    .collect())
            }
            Some(_) => Err(StoreError::WrongType),
        })
    }

    /// Removes up to `|count|` elements equal to `value`, from the head when
    /// `count` is positive, from the tail when negative, all when zero.
    pub fn lrem(&self, key: &[u8], count: i64, value: &[u8]) -> StoreResult<usize> {
        let limit = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs() as usize
        };
        self.update(
            key,
            || Value::List(VecDeque::new()),
            |stored| match stored {
                Value::List(items) => {
                    let mut removed = 0;
                    if count >= 0 {
                        items.retain(|item| {
                            let hit = removed < limit && item.as_slice() == value;
                            removed += hit as usize;
                            !hit
                        });
                    } else {
                        let mut kept = VecDeque::with_capacity(items.len());
                        while let Some(item) = items.pop_back() {
                            if removed < limit && item.as_slice() == value {
                                removed += 1;
                            } else {
                                kept.push_front(item);
                            }
                        }
                        *items = kept;
                    }
                    Ok(removed)
                }
                _ => Err(StoreError::WrongType),
            },
        )
    }

    /// Returns how many members were not already present.
    pub fn sadd(&self, key: &[u8], members: &[Vec<u8>]) -> StoreResult<usize> {
        self.update(
            key,
            || Value::Set(HashSet::new()),
            |value| match value {
                Value::Set(set) => Ok(members.iter().filter(|member| set.insert(member.to_vec())).count()),
                _ => Err(StoreError::WrongType),
            },
        )
    }

    /// Members in no particular order.
    pub fn smembers(&self, key: &[u8]) -> StoreResult<Vec<Vec<u8>>> {
        self.read(key, |value| match value {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType),
        })
    }

    pub fn srem(&self, key: &[u8], members: &[Vec<u8>]) -> StoreResult<usize> {
        self.update(
            key,
            || Value::Set(HashSet::new()),
            |value| match value {
                Value::Set(set) => Ok(members.iter().filter(|member| set.remove(member.as_slice())).count()),
                _ => Err(StoreError::WrongType),
            },
        )
    }

    /// Sets every field. Returns how many fields are new.
    pub fn hset(&self, key: &[u8], fields: &[(Vec<u8>, Vec<u8>)]) -> StoreResult<usize> {
        self.update(
            key,
            || Value::Hash(HashMap::new()),
            |value| match value {
                Value::Hash(hash) => Ok(fields
                    .iter()
                    .filter(|(field, data)| hash.insert(field.clone(), data.clone()).is_none())
                    .count()),
                _ => Err(StoreError::WrongType),
            },
        )
    }

    /// Sets `field` only when the hash lacks it.
    pub fn hsetnx(&self, key: &[u8], field: &[u8], data: &[u8]) -> StoreResult<bool> {
        self.update(
            key,
            || Value::Hash(HashMap::new()),
            |value| match value {
                Value::Hash(hash) if hash.contains_key(field) => Ok(false),
                Value::Hash(hash) => {
                    hash.insert(field.to_vec(), data.to_vec());
                    Ok(true)
                }
                _ => Err(StoreError::WrongType),
            },
        )
    }

    pub fn hget(&self, key: &[u8], field: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.read(key, |value| match value {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(StoreError::WrongType),
        })
    }

    /// Field and value pairs in no particular order.
    pub fn hgetall(&self, key: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.read(key, |value| match value {
            None => Ok(Vec::new()),
            Some(Value::Hash(hash)) => Ok(hash.iter().map(|(f, v)| (f.clone(), v.clone())).collect()),
            Some(_) => Err(StoreError::WrongType),
        })
    }

    pub fn hdel(&self, key: &[u8], fields: &[Vec<u8>]) -> StoreResult<usize> {
        self.update(
            key,
            || Value::Hash(HashMap::new()),
            |value| match value {
                Value::Hash(hash) => Ok(fields.iter().filter(|field| hash.remove(field.as_slice()).is_some()).count()),
                _ => Err(StoreError::WrongType),
            },
        )
    }

    /// Adds members or updates their scores. Returns how many are new.
    pub fn zadd(&self, key: &[u8], scored: &[(f64, Vec<u8>)]) -> StoreResult<usize> {
        self.update(
            key,
            || Value::SortedSet(Vec::new()),
            |value| match value {
                Value::SortedSet(members) => {
                    let mut added = 0;
                    for (score, member) in scored {
                        match members.iter_mut().find(|(_, existing)| existing == member) {
                            Some(slot) => slot.0 = *score,
                            None => {
                                members.push((*score, member.clone()));
                                added += 1;
                            }
                        }
                    }
                    members.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                    Ok(added)
                }
                _ => Err(StoreError::WrongType),
            },
        )
    }

    pub fn zscore(&self, key: &[u8], member: &[u8]) -> StoreResult<Option<f64>> {
        self.read(key, |value| match value {
            None => Ok(None),
            Some(Value::SortedSet(members)) => Ok(members
                .iter()
                .find(|(_, existing)| existing.as_slice() == member)
                .map(|(score, _)| *score)),
            Some(_) => Err(StoreError::WrongType),
        })
    }

    /// Members with `min <= score <= max`, lowest score first.
    pub fn zrange_by_score(&self, key: &[u8], min: f64, max: f64) -> StoreResult<Vec<Vec<u8>>> {
        self.read(key, |value| match value {
            None => Ok(Vec::new()),
            Some(Value::SortedSet(members)) => Ok(members
                .iter()
                .filter(|(score, _)| *score >= min && *score <= max)
                .map(|(_, member)| member.clone())
                .collect()),
            Some(_) => Err(StoreError::WrongType),
        })
    }

    pub fn zrem(&self, key: &[u8], targets: &[Vec<u8>]) -> StoreResult<usize> {
        self.update(
            key,
            || Value::SortedSet(Vec::new()),
            |value| match value {
                Value::SortedSet(members) => {
                    let before = members.len();
                    members.retain(|(_, member)| !targets.contains(member));
                    Ok(before - members.len())
                }
                _ => Err(StoreError::WrongType),
            },
        )
    }

    pub fn zrem_range_by_score(&self, key: &[u8], min: f64, max: f64) -> StoreResult<usize> {
        self.update(
            key,
            || Value::SortedSet(Vec::new()),
            |value| match value {
                Value::SortedSet(members) => {
                    let before = members.len();
                    members.retain(|(score, _)| *score < min || *score > max);
                    Ok(before - members.len())
                }
                _ => Err(StoreError::WrongType),
            },
        )
    }

    /// Removes a key. Returns true when a live key was removed.
    pub fn delete(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        match self.map.write().remove(key) {
            Some(entry) => !entry.is_expired(now),
            None => false,
        }
    }

    /// Sets a deadline on a live key. Returns false when the key is missing.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> bool {
        let now = Instant::now();
        let mut map = self.map.write();
        if let Some(entry) = map.get_mut(key) {
            if !entry.is_expired(now) {
                entry.expires_at = Some(now + ttl);
                return true;
            }
        }
        map.remove(key);
        false
    }

    pub fn ttl(&self, key: &[u8]) -> TtlStatus {
        let now = Instant::now();
        let map = self.map.read();
        match map.get(key) {
            None => TtlStatus::Missing,
            Some(entry) => match entry.expires_at {
                None => TtlStatus::NoExpiry,
                Some(deadline) if deadline > now => TtlStatus::ExpiresIn(deadline - now),
                Some(_) => TtlStatus::Missing,
            },
        }
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        self.map.read().get(key).is_some_and(|entry| !entry.is_expired(now))
    }

    /// Drops every entry expired at `now`. Returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut map = self.map.write();
        let before = map.len();
        map.retain(|_, entry| !entry.is_expired(now));
        before - map.len()
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }

    /// Runs `op` on the live value under `key`, `None` when missing.
    fn read<T>(&self, key: &[u8], op: impl FnOnce(Option<&Value>) -> StoreResult<T>) -> StoreResult<T> {
        let now = Instant::now();
        let map = self.map.read();
        op(map
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| &entry.value))
    }

    /// Runs `op` on the live value under `key`, inserting `empty()` first
    /// when the key is missing. Collections left empty are removed.
    fn update<T>(
        &self,
        key: &[u8],
        empty: impl FnOnce() -> Value,
        op: impl FnOnce(&mut Value) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let now = Instant::now();
        let mut map = self.map.write();
        if map.get(key).is_some_and(|entry| entry.is_expired(now)) {
            map.remove(key);
        }
        let entry = map.entry(key.to_vec()).or_insert_with(|| Entry {
            value: empty(),
            expires_at: None,
        });
        let result = op(&mut entry.value);
        if entry.value.is_drained() {
            map.remove(key);
        }
        result
    }

    fn remove_if_expired(&self, key: &[u8], now: Instant) {
        let mut map = self.map.write();
        if map.get(key).is_some_and(|entry| entry.is_expired(now)) {
            map.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_roundtrip() {
        let store = MemoryStore::new();
        store.set(b"alpha".to_vec(), b"one".to_vec(), None);
        assert_eq!(store.get(b"alpha"), Some(b"one".to_vec()));
        assert_eq!(store.get(b"missing"), None);
    }

    #[test]
    fn delete_removes_key() {
        let store = MemoryStore::new();
        store.set(b"alpha".to_vec(), b"one".to_vec(), None);
        assert!(store.delete(b"alpha"));
        assert!(!store.delete(b"alpha"));
        assert_eq!(store.get(b"alpha"), None);
    }

    #[test]
    fn expire_hides_value() {
        let store = MemoryStore::new();
        store.set(b"alpha".to_vec(), b"one".to_vec(), None);
        assert!(store.expire(b"alpha", Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(store.get(b"alpha"), None);
        assert!(!store.expire(b"alpha", Duration::from_secs(1)));
    }

    #[test]
    fn set_if_absent_respects_live_and_expired_keys() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent(b"lock".to_vec(), b"a".to_vec(), Some(Duration::from_millis(5))));
        assert!(!store.set_if_absent(b"lock".to_vec(), b"b".to_vec(), None));
        std::thread::sleep(Duration::from_millis(15));
        assert!(store.set_if_absent(b"lock".to_vec(), b"b".to_vec(), None));
        assert_eq!(store.get(b"lock"), Some(b"b".to_vec()));
    }

    #[test]
    fn purge_expired_removes_entries() {
        let store = MemoryStore::new();
        store.set(b"a".to_vec(), b"1".to_vec(), Some(Duration::from_millis(1)));
        store.set(b"b".to_vec(), b"2".to_vec(), None);
        assert_eq!(store.purge_expired(Instant::now() + Duration::from_secs(1)), 1);
        assert_eq!(store.len(), 1);
    }

    fn items(words: &[&str]) -> Vec<Vec<u8>> {
        words.iter().map(|w| w.as_bytes().to_vec()).collect()
    }

    #[test]
    fn list_push_range_and_remove() {
        let store = MemoryStore::new();
        assert_eq!(store.lpush(b"q", &items(&["a", "b"])), Ok(2));
        assert_eq!(store.lpush(b"q", &items(&["a", "c"])), Ok(4));
        assert_eq!(store.lrange(b"q", 0, -1), Ok(items(&["c", "a", "b", "a"])));
        assert_eq!(store.lrange(b"q", 1, 2), Ok(items(&["a", "b"])));
        assert_eq!(store.lrange(b"q", -1, 10), Ok(items(&["a"])));
        assert_eq!(store.lrem(b"q", -1, b"a"), Ok(1));
        assert_eq!(store.lrange(b"q", 0, -1), Ok(items(&["c", "a", "b"])));
        assert_eq!(store.lrem(b"q", 0, b"a"), Ok(1));
        assert_eq!(store.lrem(b"q", 0, b"c"), Ok(1));
        assert_eq!(store.lrem(b"q", 0, b"b"), Ok(1));
        // The drained list is gone.
        assert!(!store.exists(b"q"));
        assert_eq!(store.lrem(b"missing", 0, b"a"), Ok(0));
        assert!(store.is_empty());
    }

    #[test]
    fn set_members_are_unique() {
        let store = MemoryStore::new();
        let members = vec![b"x".to_vec(), b"y".to_vec(), b"x".to_vec()];
        assert_eq!(store.sadd(b"s", &members), Ok(2));
        let mut found = store.smembers(b"s").unwrap();
        found.sort();
        assert_eq!(found, vec![b"x".to_vec(), b"y".to_vec()]);
        assert_eq!(store.srem(b"s", &[b"x".to_vec(), b"z".to_vec()]), Ok(1));
        assert_eq!(store.smembers(b"s"), Ok(vec![b"y".to_vec()]));
    }

    #[test]
    fn hash_fields() {
        let store = MemoryStore::new();
        let fields = vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())];
        assert_eq!(store.hset(b"h", &fields), Ok(2));
        assert_eq!(store.hset(b"h", &[(b"a".to_vec(), b"9".to_vec())]), Ok(0));
        assert_eq!(store.hsetnx(b"h", b"a", b"x"), Ok(false));
        assert_eq!(store.hsetnx(b"h", b"c", b"3"), Ok(true));
        assert_eq!(store.hget(b"h", b"a"), Ok(Some(b"9".to_vec())));
        assert_eq!(store.hgetall(b"h").unwrap().len(), 3);
        assert_eq!(store.hdel(b"h", &[b"a".to_vec(), b"missing".to_vec()]), Ok(1));
        assert_eq!(store.hget(b"h", b"a"), Ok(None));
    }

    #[test]
    fn sorted_set_orders_by_score() {
        let store = MemoryStore::new();
        let scored = vec![(3.0, b"c".to_vec()), (1.0, b"a".to_vec()), (2.0, b"b".to_vec())];
        assert_eq!(store.zadd(b"z", &scored), Ok(3));
        assert_eq!(store.zadd(b"z", &[(0.5, b"c".to_vec())]), Ok(0));
        assert_eq!(store.zscore(b"z", b"c"), Ok(Some(0.5)));
        assert_eq!(
            store.zrange_by_score(b"z", f64::NEG_INFINITY, f64::INFINITY),
            Ok(vec![b"c".to_vec(), b"a".to_vec(), b"b".to_vec()])
        );
        assert_eq!(store.zrange_by_score(b"z", 1.0, 2.0), Ok(vec![b"a".to_vec(), b"b".to_vec()]));
        assert_eq!(store.zrem_range_by_score(b"z", 0.0, 1.0), Ok(2));
        assert_eq!(store.zrem(b"z", &[b"b".to_vec()]), Ok(1));
        assert!(!store.exists(b"z"));
    }

    #[test]
    fn incr_counts_from_zero_and_rejects_text() {
        let store = MemoryStore::new();
        assert_eq!(store.incr(b"n"), Ok(1));
        assert_eq!(store.incr(b"n"), Ok(2));
        assert_eq!(store.get(b"n"), Some(b"2".to_vec()));
        store.set(b"t".to_vec(), b"abc".to_vec(), None);
        assert_eq!(store.incr(b"t"), Err(StoreError::NotInteger));
        store.set(b"max".to_vec(), i64::MAX.to_string().into_bytes(), None);
        assert_eq!(store.incr(b"max"), Err(StoreError::NotInteger));
    }

    #[test]
    fn typed_commands_reject_other_kinds() {
        let store = MemoryStore::new();
        store.set(b"k".to_vec(), b"v".to_vec(), None);
        assert_eq!(store.lpush(b"k", &[b"a".to_vec()]), Err(StoreError::WrongType));
        assert_eq!(store.hgetall(b"k"), Err(StoreError::WrongType));
        store.sadd(b"s", &[b"a".to_vec()]).unwrap();
        assert_eq!(store.get_string(b"s"), Err(StoreError::WrongType));
        assert_eq!(store.get(b"s"), None);
        // SET replaces any kind.
        store.set(b"s".to_vec(), b"v".to_vec(), None);
        assert_eq!(store.get(b"s"), Some(b"v".to_vec()));
    }

    #[test]
    fn ttl_reports_missing_or_expiry() {
        let store = MemoryStore::new();
        assert_eq!(store.ttl(b"missing"), TtlStatus::Missing);
        store.set(b"alpha".to_vec(), b"one".to_vec(), None);
        assert_eq!(store.ttl(b"alpha"), TtlStatus::NoExpiry);
        store.expire(b"alpha", Duration::from_secs(30));
        assert!(matches!(store.ttl(b"alpha"), TtlStatus::ExpiresIn(left) if left <= Duration::from_secs(30)));
    }
}

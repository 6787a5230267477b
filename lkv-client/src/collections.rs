//! # Collection Calls
//!
//! Purpose: List, set, hash, sorted-set, and counter operations on
//! `KVClient`, plus the command builders that batches share.
//!
//! Writes that create or grow a list, set, or hash also put the configured
//! data TTL on the key, sent in the same round trip. Sorted sets and
//! counters never expire on their own.

use std::collections::HashMap;
use std::time::Duration;

use crate::client::{check_key, expire_command, KVClient};
use crate::error::{ClientError, ClientResult};
use crate::pool::PooledConnection;
use crate::resp::{Command, RespValue};

/// Counter behind `KVClient::global_increment`.
pub const GLOBAL_COUNTER_KEY: &str = "global_id_number";

impl KVClient {
    /// Pushes `value` onto the head of the list at `key`. Returns the new
    /// length.
    pub fn push(&self, key: &[u8], value: &[u8]) -> ClientResult<u64> {
        check_key(key)?;
        let commands = with_data_ttl(lpush_command(key, value), key, self.options().data_ttl);
        self.run("LPUSH", key, |conn| count(lead_reply(conn, &commands)?))
    }

    /// Every element of the list at `key`, head first.
    pub fn list(&self, key: &[u8]) -> ClientResult<Vec<Vec<u8>>> {
        check_key(key)?;
        let command = Command::new("LRANGE").arg(key).arg("0").arg("-1");
        self.run("LRANGE", key, |conn| conn.exec(&command)?.into_bulk_array())
    }

    /// Removes every element equal to `value`. Returns how many went.
    pub fn remove_from_list(&self, key: &[u8], value: &[u8]) -> ClientResult<u64> {
        check_key(key)?;
        let command = lrem_command(key, value);
        self.run("LREM", key, |conn| count(conn.exec(&command)?))
    }

    /// Adds `members` to the set at `key`. Returns how many were new.
    pub fn add_to_set(&self, key: &[u8], members: &[&[u8]]) -> ClientResult<u64> {
        check_key(key)?;
        check_nonempty(members.len(), "no set members")?;
        let commands = with_data_ttl(sadd_command(key, members), key, self.options().data_ttl);
        self.run("SADD", key, |conn| count(lead_reply(conn, &commands)?))
    }

    /// Members of the set at `key`, in no particular order.
    pub fn set_members(&self, key: &[u8]) -> ClientResult<Vec<Vec<u8>>> {
        check_key(key)?;
        let command = Command::new("SMEMBERS").arg(key);
        self.run("SMEMBERS", key, |conn| conn.exec(&command)?.into_bulk_array())
    }

    /// Returns true when `member` was in the set.
    pub fn remove_from_set(&self, key: &[u8], member: &[u8]) -> ClientResult<bool> {
        check_key(key)?;
        let command = Command::new("SREM").arg(key).arg(member);
        self.run("SREM", key, |conn| flag(conn.exec(&command)?))
    }

    /// Writes every field of the hash at `key`.
    pub fn set_hash(&self, key: &[u8], fields: &[(&[u8], &[u8])]) -> ClientResult<()> {
        check_key(key)?;
        check_nonempty(fields.len(), "no hash fields")?;
        let commands = with_data_ttl(hset_command(key, fields), key, self.options().data_ttl);
        self.run("HSET", key, |conn| count(lead_reply(conn, &commands)?).map(|_| ()))
    }

    /// All fields of the hash at `key`; empty when it does not exist.
    pub fn hash(&self, key: &[u8]) -> ClientResult<HashMap<Vec<u8>, Vec<u8>>> {
        check_key(key)?;
        let command = Command::new("HGETALL").arg(key);
        self.run("HGETALL", key, |conn| into_hash(conn.exec(&command)?))
    }

    /// `hash` for several keys in one round trip, in key order.
    pub fn hashes(&self, keys: &[&[u8]]) -> ClientResult<Vec<HashMap<Vec<u8>, Vec<u8>>>> {
        let commands = keys
            .iter()
            .map(|key| check_key(key).map(|()| Command::new("HGETALL").arg(key)))
            .collect::<ClientResult<Vec<_>>>()?;
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        self.run("HGETALL", keys[0], |conn| conn.pipeline(&commands)?.into_iter().map(into_hash).collect())
    }

    /// Sets `field` only when the hash at `key` lacks it. Returns true when
    /// the value was stored.
    pub fn hash_set_if_absent(&self, key: &[u8], field: &[u8], value: &[u8]) -> ClientResult<bool> {
        check_key(key)?;
        let command = hsetnx_command(key, field, value);
        self.run("HSETNX", key, |conn| flag(conn.exec(&command)?))
    }

    /// `hash_set_if_absent` of one field across several hashes, pipelined.
    pub fn hash_set_if_absent_many(&self, keys: &[&[u8]], field: &[u8], value: &[u8]) -> ClientResult<Vec<bool>> {
        self.flags_for_each("HSETNX", keys, |key| hsetnx_command(key, field, value))
    }

    /// Returns true when `field` existed.
    pub fn hash_delete(&self, key: &[u8], field: &[u8]) -> ClientResult<bool> {
        check_key(key)?;
        let command = hdel_command(key, field);
        self.run("HDEL", key, |conn| flag(conn.exec(&command)?))
    }

    /// `hash_delete` of one field across several hashes, pipelined.
    pub fn hash_delete_many(&self, keys: &[&[u8]], field: &[u8]) -> ClientResult<Vec<bool>> {
        self.flags_for_each("HDEL", keys, |key| hdel_command(key, field))
    }

    /// Adds `member` with `score`, or moves it to `score`. Returns true
    /// when the member is new.
    pub fn add_scored(&self, key: &[u8], member: &[u8], score: f64) -> ClientResult<bool> {
        check_key(key)?;
        check_score(score)?;
        let command = zadd_command(key, member, score);
        self.run("ZADD", key, |conn| flag(conn.exec(&command)?))
    }

    /// Members scored within `min..=max`, lowest first.
    pub fn range_by_score(&self, key: &[u8], min: f64, max: f64) -> ClientResult<Vec<Vec<u8>>> {
        check_key(key)?;
        check_score_range(min, max)?;
        let command = Command::new("ZRANGEBYSCORE").arg(key).arg(score_arg(min)).arg(score_arg(max));
        self.run("ZRANGEBYSCORE", key, |conn| conn.exec(&command)?.into_bulk_array())
    }

    /// Returns true when `member` was in the sorted set.
    pub fn remove_scored(&self, key: &[u8], member: &[u8]) -> ClientResult<bool> {
        check_key(key)?;
        let command = Command::new("ZREM").arg(key).arg(member);
        self.run("ZREM", key, |conn| flag(conn.exec(&command)?))
    }

    /// Removes members scored within `min..=max`. Returns how many went.
    pub fn remove_score_range(&self, key: &[u8], min: f64, max: f64) -> ClientResult<u64> {
        check_key(key)?;
        check_score_range(min, max)?;
        let command = zremrange_command(key, min, max);
        self.run("ZREMRANGEBYSCORE", key, |conn| count(conn.exec(&command)?))
    }

    /// Adds one to the counter at `key` and returns the new value.
    pub fn increment(&self, key: &[u8]) -> ClientResult<i64> {
        check_key(key)?;
        let command = Command::new("INCR").arg(key);
        self.run("INCR", key, |conn| conn.exec(&command)?.into_integer())
    }

    /// Next value of the store-wide id counter.
    pub fn global_increment(&self) -> ClientResult<i64> {
        self.increment(GLOBAL_COUNTER_KEY.as_bytes())
    }

    fn flags_for_each<F>(&self, op: &'static str, keys: &[&[u8]], build: F) -> ClientResult<Vec<bool>>
    where
        F: Fn(&[u8]) -> Command,
    {
        let commands = keys
            .iter()
            .map(|key| check_key(key).map(|()| build(*key)))
            .collect::<ClientResult<Vec<_>>>()?;
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        self.run(op, keys[0], |conn| conn.pipeline(&commands)?.into_iter().map(flag).collect())
    }
}

/// Sends `commands` in one round trip and returns the first reply. A
/// rejection of any of them fails the call.
fn lead_reply(conn: &mut PooledConnection, commands: &[Command]) -> ClientResult<RespValue> {
    let mut replies = conn.pipeline(commands)?.into_iter();
    let lead = replies.next().ok_or(ClientError::UnexpectedResponse)?.into_result()?;
    for reply in replies {
        reply.into_result()?;
    }
    Ok(lead)
}

fn count(reply: RespValue) -> ClientResult<u64> {
    u64::try_from(reply.into_integer()?).map_err(|_| ClientError::UnexpectedResponse)
}

fn flag(reply: RespValue) -> ClientResult<bool> {
    Ok(reply.into_integer()? > 0)
}

fn into_hash(reply: RespValue) -> ClientResult<HashMap<Vec<u8>, Vec<u8>>> {
    let items = reply.into_bulk_array()?;
    if items.len() % 2 != 0 {
        return Err(ClientError::UnexpectedResponse);
    }
    let mut hash = HashMap::with_capacity(items.len() / 2);
    let mut items = items.into_iter();
    while let (Some(field), Some(value)) = (items.next(), items.next()) {
        hash.insert(field, value);
    }
    Ok(hash)
}

pub(crate) fn check_nonempty(len: usize, what: &'static str) -> ClientResult<()> {
    if len == 0 {
        return Err(ClientError::InvalidArgument(what));
    }
    Ok(())
}

pub(crate) fn check_score(score: f64) -> ClientResult<()> {
    if score.is_nan() {
        return Err(ClientError::InvalidArgument("score is NaN"));
    }
    Ok(())
}

pub(crate) fn check_score_range(min: f64, max: f64) -> ClientResult<()> {
    check_score(min)?;
    check_score(max)?;
    if min > max {
        return Err(ClientError::InvalidArgument("score range is inverted"));
    }
    Ok(())
}

/// `command`, followed by an expiry on `key` when a data TTL is set.
pub(crate) fn with_data_ttl(command: Command, key: &[u8], ttl: Option<Duration>) -> Vec<Command> {
    match ttl {
        Some(ttl) => vec![command, expire_command(key, ttl)],
        None => vec![command],
    }
}

pub(crate) fn lpush_command(key: &[u8], value: &[u8]) -> Command {
    Command::new("LPUSH").arg(key).arg(value)
}

pub(crate) fn lrem_command(key: &[u8], value: &[u8]) -> Command {
    Command::new("LREM").arg(key).arg("0").arg(value)
}

pub(crate) fn sadd_command(key: &[u8], members: &[&[u8]]) -> Command {
    members
        .iter()
        .fold(Command::new("SADD").arg(key), |command, member| command.arg(member))
}

pub(crate) fn hset_command(key: &[u8], fields: &[(&[u8], &[u8])]) -> Command {
    fields
        .iter()
        .fold(Command::new("HSET").arg(key), |command, (field, value)| command.arg(field).arg(value))
}

pub(crate) fn hsetnx_command(key: &[u8], field: &[u8], value: &[u8]) -> Command {
    Command::new("HSETNX").arg(key).arg(field).arg(value)
}

pub(crate) fn hdel_command(key: &[u8], field: &[u8]) -> Command {
    Command::new("HDEL").arg(key).arg(field)
}

pub(crate) fn zadd_command(key: &[u8], member: &[u8], score: f64) -> Command {
    Command::new("ZADD").arg(key).arg(score_arg(score)).arg(member)
}

pub(crate) fn zremrange_command(key: &[u8], min: f64, max: f64) -> Command {
    Command::new("ZREMRANGEBYSCORE").arg(key).arg(score_arg(min)).arg(score_arg(max))
}

fn score_arg(score: f64) -> String {
    if score.is_infinite() {
        return if score > 0.0 { "+inf".to_string() } else { "-inf".to_string() };
    }
    score.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(command: &Command) -> Vec<String> {
        command
            .args()
            .iter()
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect()
    }

    #[test]
    fn data_ttl_adds_expire_to_collection_writes() {
        let commands = with_data_ttl(lpush_command(b"q", b"v"), b"q", Some(Duration::from_secs(60)));
        assert_eq!(commands.len(), 2);
        assert_eq!(words(&commands[1]), vec!["EXPIRE", "q", "60"]);
        assert_eq!(with_data_ttl(lpush_command(b"q", b"v"), b"q", None).len(), 1);
    }

    #[test]
    fn multi_argument_commands() {
        assert_eq!(words(&sadd_command(b"s", &[b"a", b"b"])), vec!["SADD", "s", "a", "b"]);
        let fields: [(&[u8], &[u8]); 2] = [(b"f", b"1"), (b"g", b"2")];
        assert_eq!(words(&hset_command(b"h", &fields)), vec!["HSET", "h", "f", "1", "g", "2"]);
        assert_eq!(words(&lrem_command(b"q", b"v")), vec!["LREM", "q", "0", "v"]);
    }

    #[test]
    fn scores_are_formatted_for_the_wire() {
        assert_eq!(words(&zadd_command(b"z", b"m", 1.5)), vec!["ZADD", "z", "1.5", "m"]);
        assert_eq!(words(&zadd_command(b"z", b"m", 2.0)), vec!["ZADD", "z", "2", "m"]);
        assert_eq!(
            words(&zremrange_command(b"z", f64::NEG_INFINITY, f64::INFINITY)),
            vec!["ZREMRANGEBYSCORE", "z", "-inf", "+inf"]
        );
    }

    #[test]
    fn rejects_bad_scores() {
        assert!(matches!(check_score(f64::NAN), Err(ClientError::InvalidArgument(_))));
        assert!(matches!(check_score_range(2.0, 1.0), Err(ClientError::InvalidArgument(_))));
        assert!(check_score_range(1.0, 1.0).is_ok());
        assert!(matches!(check_nonempty(0, "none"), Err(ClientError::InvalidArgument(_))));
    }

    #[test]
    fn hash_replies_pair_up() {
        let reply = RespValue::Array(vec![
            RespValue::Bulk(Some(b"f".to_vec())),
            RespValue::Bulk(Some(b"1".to_vec())),
        ]);
        let hash = into_hash(reply).unwrap();
        assert_eq!(hash.get(b"f".as_slice()), Some(&b"1".to_vec()));
        let odd = RespValue::Array(vec![RespValue::Bulk(Some(b"f".to_vec()))]);
        assert!(matches!(into_hash(odd), Err(ClientError::UnexpectedResponse)));
    }
}

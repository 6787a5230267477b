//! # TCP Server
//!
//! Accept RESP2 connections, parse commands, and dispatch them to the shared
//! in-memory store. Strings, lists, sets, hashes, sorted sets, and counters
//! are understood; anything else is an unknown command. Replies for every request parsed from one read are
//! written back together, so pipelined batches cost one write.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::{RespError, RespParser};
use crate::store::{MemoryStore, StoreError, StoreResult, TtlStatus};

/// Per-connection state.
pub(crate) struct Session {
    password: Option<Arc<str>>,
    authenticated: bool,
}

impl Session {
    pub(crate) fn new(password: Option<Arc<str>>) -> Self {
        let authenticated = password.is_none();
        Session {
            password,
            authenticated,
        }
    }
}

/// Handles a single TCP client connection.
pub(crate) async fn handle_connection(
    mut stream: TcpStream,
    store: Arc<MemoryStore>,
    mut session: Session,
) -> std::io::Result<()> {
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut out = Vec::with_capacity(1024);
    let mut parser = RespParser::new();

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        out.clear();
        loop {
            match parser.parse(&mut buffer) {
                Ok(Some(args)) => dispatch_command(&args, &store, &mut session, &mut out),
                Ok(None) => break,
                Err(RespError::Protocol) => {
                    out.extend_from_slice(&resp_error("protocol error"));
                    stream.write_all(&out).await?;
                    return Ok(());
                }
            }
        }
        if !out.is_empty() {
            stream.write_all(&out).await?;
        }
    }

    Ok(())
}

pub(crate) fn dispatch_command(args: &[Vec<u8>], store: &MemoryStore, session: &mut Session, out: &mut Vec<u8>) {
    let reply = dispatch(args, store, session);
    out.extend_from_slice(&reply);
}

fn dispatch(args: &[Vec<u8>], store: &MemoryStore, session: &mut Session) -> Vec<u8> {
    if args.is_empty() {
        return resp_error("empty command");
    }

    let cmd = &args[0];
    if eq_ignore_ascii_case(cmd, b"AUTH") {
        return handle_auth(args, session);
    }
    if !session.authenticated {
        return b"-NOAUTH Authentication required.\r\n".to_vec();
    }
    if eq_ignore_ascii_case(cmd, b"PING") {
        return handle_ping(args);
    }
    if eq_ignore_ascii_case(cmd, b"GET") {
        return handle_get(args, store);
    }
    if eq_ignore_ascii_case(cmd, b"SET") {
        return handle_set(args, store);
    }
    if eq_ignore_ascii_case(cmd, b"SETNX") {
        return handle_setnx(args, store);
    }
    if eq_ignore_ascii_case(cmd, b"DEL") {
        return handle_del(args, store);
    }
    if eq_ignore_ascii_case(cmd, b"EXISTS") {
        return handle_exists(args, store);
    }
    if eq_ignore_ascii_case(cmd, b"EXPIRE") {
        return handle_expire(args, store, Duration::from_secs);
    }
    if eq_ignore_ascii_case(cmd, b"PEXPIRE") {
        return handle_expire(args, store, Duration::from_millis);
    }
    if eq_ignore_ascii_case(cmd, b"TTL") {
        return handle_ttl(args, store, |left| left.as_secs() as i64);
    }
    if eq_ignore_ascii_case(cmd, b"PTTL") {
        return handle_ttl(args, store, |left| left.as_millis() as i64);
    }
    if eq_ignore_ascii_case(cmd, b"INCR") {
        return handle_incr(args, store);
    }
    if eq_ignore_ascii_case(cmd, b"LPUSH") {
        return handle_lpush(args, store);
    }
    if eq_ignore_ascii_case(cmd, b"LRANGE") {
        return handle_lrange(args, store);
    }
    if eq_ignore_ascii_case(cmd, b"LREM") {
        return handle_lrem(args, store);
    }
    if eq_ignore_ascii_case(cmd, b"SADD") {
        return handle_members(args, store, MemoryStore::sadd);
    }
    if eq_ignore_ascii_case(cmd, b"SREM") {
        return handle_members(args, store, MemoryStore::srem);
    }
    if eq_ignore_ascii_case(cmd, b"SMEMBERS") {
        return handle_smembers(args, store);
    }
    if eq_ignore_ascii_case(cmd, b"HSET") {
        return handle_hset(args, store);
    }
    if eq_ignore_ascii_case(cmd, b"HSETNX") {
        return handle_hsetnx(args, store);
    }
    if eq_ignore_ascii_case(cmd, b"HGET") {
        return handle_hget(args, store);
    }
    if eq_ignore_ascii_case(cmd, b"HGETALL") {
        return handle_hgetall(args, store);
    }
    if eq_ignore_ascii_case(cmd, b"HDEL") {
        return handle_members(args, store, MemoryStore::hdel);
    }
    if eq_ignore_ascii_case(cmd, b"ZADD") {
        return handle_zadd(args, store);
    }
    if eq_ignore_ascii_case(cmd, b"ZREM") {
        return handle_members(args, store, MemoryStore::zrem);
    }
    if eq_ignore_ascii_case(cmd, b"ZRANGEBYSCORE") {
        return handle_score_range(args, store, |store, key, min, max| reply_items(store.zrange_by_score(key, min, max)));
    }
    if eq_ignore_ascii_case(cmd, b"ZREMRANGEBYSCORE") {
        return handle_score_range(args, store, |store, key, min, max| {
            reply_count(store.zrem_range_by_score(key, min, max))
        });
    }

    resp_error("unknown command")
}

fn handle_auth(args: &[Vec<u8>], session: &mut Session) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for AUTH");
    }
    match session.password.as_deref() {
        None => resp_error("AUTH <password> called without any password configured"),
        Some(expected) if expected.as_bytes() == args[1].as_slice() => {
            session.authenticated = true;
            resp_simple("OK")
        }
        Some(_) => {
            session.authenticated = false;
            b"-WRONGPASS invalid username-password pair\r\n".to_vec()
        }
    }
}

fn handle_ping(args: &[Vec<u8>]) -> Vec<u8> {
    match args.len() {
        1 => resp_simple("PONG"),
        2 => resp_bulk(&args[1]),
        _ => resp_error("wrong number of arguments for PING"),
    }
}

fn handle_get(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for GET");
    }
    match store.get_string(&args[1]) {
        Ok(Some(value)) => resp_bulk(&value),
        Ok(None) => resp_null(),
        Err(err) => store_error(err),
    }
}

/// `SET key value [EX seconds | PX millis] [NX]`
fn handle_set(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() < 3 {
        return resp_error("wrong number of arguments for SET");
    }

    let mut ttl = None;
    let mut only_if_absent = false;
    let mut idx = 3;
    while idx < args.len() {
        let option = &args[idx];
        if eq_ignore_ascii_case(option, b"NX") {
            only_if_absent = true;
            idx += 1;
            continue;
        }
        let unit: fn(u64) -> Duration = if eq_ignore_ascii_case(option, b"EX") {
            Duration::from_secs
        } else if eq_ignore_ascii_case(option, b"PX") {
            Duration::from_millis
        } else {
            return resp_error("syntax error");
        };
        if ttl.is_some() || idx + 1 >= args.len() {
            return resp_error("syntax error");
        }
        match parse_u64(&args[idx + 1]) {
            Ok(0) => return resp_error("invalid expire time in 'set' command"),
            Ok(value) => ttl = Some(unit(value)),
            Err(resp) => return resp,
        }
        idx += 2;
    }

    let key = args[1].clone();
    let value = args[2].clone();
    if only_if_absent {
        if store.set_if_absent(key, value, ttl) {
            return resp_simple("OK");
        }
        return resp_null();
    }
    store.set(key, value, ttl);
    resp_simple("OK")
}

fn handle_setnx(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() != 3 {
        return resp_error("wrong number of arguments for SETNX");
    }
    let stored = store.set_if_absent(args[1].clone(), args[2].clone(), None);
    resp_integer(stored as i64)
}

fn handle_del(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() < 2 {
        return resp_error("wrong number of arguments for DEL");
    }
    let removed = args[1..].iter().filter(|key| store.delete(key)).count();
    resp_integer(removed as i64)
}

fn handle_exists(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() < 2 {
        return resp_error("wrong number of arguments for EXISTS");
    }
    let found = args[1..].iter().filter(|key| store.exists(key)).count();
    resp_integer(found as i64)
}

fn handle_expire(args: &[Vec<u8>], store: &MemoryStore, unit: fn(u64) -> Duration) -> Vec<u8> {
    if args.len() != 3 {
        return resp_error("wrong number of arguments for EXPIRE");
    }

    let amount = match parse_u64(&args[2]) {
        Ok(value) => value,
        Err(resp) => return resp,
    };

    resp_integer(store.expire(&args[1], unit(amount)) as i64)
}

fn handle_ttl(args: &[Vec<u8>], store: &MemoryStore, unit: fn(Duration) -> i64) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for TTL");
    }

    match store.ttl(&args[1]) {
        TtlStatus::Missing => resp_integer(-2),
        TtlStatus::NoExpiry => resp_integer(-1),
        TtlStatus::ExpiresIn(remaining) => resp_integer(unit(remaining)),
    }
}

fn handle_incr(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for INCR");
    }
    match store.incr(&args[1]) {
        Ok(value) => resp_integer(value),
        Err(err) => store_error(err),
    }
}

fn handle_lpush(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() < 3 {
        return resp_error("wrong number of arguments for LPUSH");
    }
    reply_count(store.lpush(&args[1], &args[2..]))
}

fn handle_lrange(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() != 4 {
        return resp_error("wrong number of arguments for LRANGE");
    }
    let (start, stop) = match (parse_i64(&args[2]), parse_i64(&args[3])) {
        (Ok(start), Ok(stop)) => (start, stop),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    reply_items(store.lrange(&args[1], start, stop))
}

fn handle_lrem(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() != 4 {
        return resp_error("wrong number of arguments for LREM");
    }
    match parse_i64(&args[2]) {
        Ok(count) => reply_count(store.lrem(&args[1], count, &args[3])),
        Err(resp) => resp,
    }
}

/// `CMD key member [member ...]` answered with a count.
fn handle_members(
    args: &[Vec<u8>],
    store: &MemoryStore,
    apply: fn(&MemoryStore, &[u8], &[Vec<u8>]) -> StoreResult<usize>,
) -> Vec<u8> {
    if args.len() < 3 {
        return resp_error("wrong number of arguments");
    }
    reply_count(apply(store, &args[1], &args[2..]))
}

fn handle_smembers(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for SMEMBERS");
    }
    reply_items(store.smembers(&args[1]))
}

fn handle_hset(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() < 4 || args.len() % 2 != 0 {
        return resp_error("wrong number of arguments for HSET");
    }
    let fields: Vec<(Vec<u8>, Vec<u8>)> = args[2..]
        .chunks(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    reply_count(store.hset(&args[1], &fields))
}

fn handle_hsetnx(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() != 4 {
        return resp_error("wrong number of arguments for HSETNX");
    }
    match store.hsetnx(&args[1], &args[2], &args[3]) {
        Ok(stored) => resp_integer(stored as i64),
        Err(err) => store_error(err),
    }
}

fn handle_hget(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() != 3 {
        return resp_error("wrong number of arguments for HGET");
    }
    match store.hget(&args[1], &args[2]) {
        Ok(Some(value)) => resp_bulk(&value),
        Ok(None) => resp_null(),
        Err(err) => store_error(err),
    }
}

fn handle_hgetall(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() != 2 {
        return resp_error("wrong number of arguments for HGETALL");
    }
    let flat: StoreResult<Vec<Vec<u8>>> = store
        .hgetall(&args[1])
        .map(|pairs| pairs.into_iter().flat_map(|(field, value)| [field, value]).collect());
    reply_items(flat)
}

/// `ZADD key score member [score member ...]`
fn handle_zadd(args: &[Vec<u8>], store: &MemoryStore) -> Vec<u8> {
    if args.len() < 4 || args.len() % 2 != 0 {
        return resp_error("wrong number of arguments for ZADD");
    }
    let mut scored = Vec::with_capacity((args.len() - 2) / 2);
    for pair in args[2..].chunks(2) {
        match parse_score(&pair[0]) {
            Ok(score) => scored.push((score, pair[1].clone())),
            Err(resp) => return resp,
        }
    }
    reply_count(store.zadd(&args[1], &scored))
}

fn handle_score_range(
    args: &[Vec<u8>],
    store: &MemoryStore,
    apply: fn(&MemoryStore, &[u8], f64, f64) -> Vec<u8>,
) -> Vec<u8> {
    if args.len() != 4 {
        return resp_error("wrong number of arguments");
    }
    match (parse_score(&args[2]), parse_score(&args[3])) {
        (Ok(min), Ok(max)) => apply(store, &args[1], min, max),
        (Err(resp), _) | (_, Err(resp)) => resp,
    }
}

fn reply_count(result: StoreResult<usize>) -> Vec<u8> {
    match result {
        Ok(count) => resp_integer(count as i64),
        Err(err) => store_error(err),
    }
}

fn reply_items(result: StoreResult<Vec<Vec<u8>>>) -> Vec<u8> {
    match result {
        Ok(items) => resp_array(&items),
        Err(err) => store_error(err),
    }
}

fn store_error(err: StoreError) -> Vec<u8> {
    match err {
        StoreError::WrongType => b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n".to_vec(),
        StoreError::NotInteger => resp_error("value is not an integer or out of range"),
    }
}

fn resp_simple(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 3);
    buf.extend_from_slice(b"+");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_error(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 6);
    buf.extend_from_slice(b"-ERR ");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_integer(value: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b":");
    buf.extend_from_slice(value.to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_bulk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"$");
    buf.extend_from_slice(data.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_array(items: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"*");
    buf.extend_from_slice(items.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    for item in items {
        buf.extend_from_slice(&resp_bulk(item));
    }
    buf
}

fn resp_null() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

fn eq_ignore_ascii_case(a: &[u8], b: &[u8]) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn parse_u64(arg: &[u8]) -> Result<u64, Vec<u8>> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| resp_error("value is not an integer or out of range"))
}

fn parse_i64(arg: &[u8]) -> Result<i64, Vec<u8>> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| resp_error("value is not an integer or out of range"))
}

/// Accepts decimal floats and `inf`, `+inf`, `-inf`.
fn parse_score(arg: &[u8]) -> Result<f64, Vec<u8>> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|text| text.parse::<f64>().ok())
        .filter(|score| !score.is_nan())
        .ok_or_else(|| resp_error("value is not a valid float"))
}

//! Subcommand handlers.

use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use lkv_client::{DistributedLock, KVClient, LockOptions, PoolSummary};
use lkv_common::Settings;
use serde_json::{json, Value};

pub fn ping(client: &KVClient) -> anyhow::Result<()> {
    let started = Instant::now();
    client.ping().context("PING failed")?;
    println!("PONG ({} ms)", started.elapsed().as_millis());
    Ok(())
}

pub fn lock(
    client: &KVClient,
    settings: &Settings,
    key: &str,
    owner: Option<String>,
    timeout_ms: u64,
    fixed: bool,
    hold_ms: u64,
) -> anyhow::Result<()> {
    let owner = owner.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let lock = DistributedLock::new(client.clone(), key, LockOptions::from_settings(settings))?;

    let started = Instant::now();
    if !lock.acquire(&owner, fixed, Duration::from_millis(timeout_ms))? {
        bail!("timed out after {} ms waiting for lock {}", timeout_ms, key);
    }
    println!("acquired {} as {} in {} ms", key, owner, started.elapsed().as_millis());

    if hold_ms > 0 {
        std::thread::sleep(Duration::from_millis(hold_ms));
        lock.release(&owner)?;
        println!("released {}", key);
    }
    Ok(())
}

pub fn unlock(client: &KVClient, settings: &Settings, key: &str, owner: &str) -> anyhow::Result<()> {
    let lock = DistributedLock::new(client.clone(), key, LockOptions::from_settings(settings))?;
    lock.release(owner)?;
    println!("release requested for {} by {}", key, owner);
    Ok(())
}

pub fn status(client: &KVClient) -> anyhow::Result<()> {
    let status = client.manager().status();
    let report = json!({
        "shut_down": status.shut_down,
        "current": status.current.as_ref().map(summary),
        "spares": status.spares.iter().map(summary).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn summary(pool: &PoolSummary) -> Value {
    json!({
        "id": pool.id,
        "endpoint": pool.endpoint,
        "idle": pool.status.idle,
        "in_use": pool.status.in_use,
        "max": pool.status.max,
        "utilization": pool.status.utilization(),
        "at_capacity": pool.status.is_at_capacity(),
    })
}

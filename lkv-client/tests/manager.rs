mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use lkv_client::{ClientError, ManagerOptions, PoolManager};
use lkv_testkit::{MemoryStore, TestServer};

use common::{eventually, settings_for};

fn manager_for(servers: &[&TestServer], tweak: impl FnOnce(&mut ManagerOptions)) -> PoolManager {
    let settings = settings_for(servers);
    let mut options = ManagerOptions::from_settings(&settings);
    tweak(&mut options);
    let directory = lkv_client::EndpointDirectory::new(&settings.hosts, &settings.ports).unwrap();
    PoolManager::new(Arc::new(directory), options).unwrap()
}

fn quiet(options: &mut ManagerOptions) {
    options.check_interval = Duration::from_secs(3600);
}

#[test]
fn borrowed_connections_return_to_the_pool() {
    let server = TestServer::start().unwrap();
    let manager = manager_for(&[&server], quiet);

    let mut conn = manager.borrow().unwrap();
    conn.ping().unwrap();
    let in_use = manager.status().current.unwrap().status;
    assert_eq!(in_use.in_use, 1);

    manager.release(conn);
    let after = manager.status().current.unwrap().status;
    assert_eq!(after.in_use, 0);
    assert_eq!(after.idle, 1);
}

#[test]
fn borrow_times_out_when_the_pool_is_full() {
    let server = TestServer::start().unwrap();
    let manager = manager_for(&[&server], |options| {
        quiet(options);
        options.pool.max_total = 1;
        options.pool.max_idle = 1;
        options.pool.borrow_timeout = Duration::from_millis(50);
    });

    let held = manager.borrow().unwrap();
    assert!(matches!(manager.borrow(), Err(ClientError::PoolExhausted)));
    drop(held);
    assert!(manager.borrow().is_ok());
}

#[test]
fn liveness_task_fails_over_to_a_spare() {
    let store = Arc::new(MemoryStore::new());
    let mut primary = TestServer::start_shared(Arc::clone(&store)).unwrap();
    let replica = TestServer::start_shared(Arc::clone(&store)).unwrap();
    let manager = manager_for(&[&primary, &replica], |_| {});
    assert_eq!(manager.status().current.unwrap().endpoint.port(), primary.port());

    primary.stop();
    let switched = eventually(Duration::from_secs(5), || {
        manager
            .status()
            .current
            .is_some_and(|current| current.endpoint.port() == replica.port())
    });
    assert!(switched, "manager never failed over: {:?}", manager.status());

    let mut conn = manager.borrow().unwrap();
    conn.ping().unwrap();
}

#[test]
fn borrows_during_failover_succeed_once_a_spare_is_promoted() {
    let store = Arc::new(MemoryStore::new());
    let mut primary = TestServer::start_shared(Arc::clone(&store)).unwrap();
    let replica = TestServer::start_shared(Arc::clone(&store)).unwrap();
    let manager = manager_for(&[&primary, &replica], |_| {});
    // Leave an idle connection behind in the primary pool.
    manager.borrow().unwrap().ping().unwrap();

    primary.stop();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut failures = Vec::new();
    let served_by = loop {
        assert!(Instant::now() < deadline, "no borrow succeeded: {:?}", failures);
        let attempt = manager.borrow().and_then(|mut conn| {
            conn.ping()?;
            Ok(conn.endpoint().port())
        });
        match attempt {
            Ok(port) => break port,
            Err(err) => {
                assert!(err.is_transient(), "non-transient error during failover: {}", err);
                failures.push(err.to_string());
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    };
    assert_eq!(served_by, replica.port());
}

#[test]
fn replenish_task_restores_spares_after_failover() {
    let store = Arc::new(MemoryStore::new());
    let mut primary = TestServer::start_shared(Arc::clone(&store)).unwrap();
    let replica = TestServer::start_shared(Arc::clone(&store)).unwrap();
    let manager = manager_for(&[&primary, &replica], |_| {});

    primary.stop();
    assert!(eventually(Duration::from_secs(5), || {
        let status = manager.status();
        status.current.is_some_and(|c| c.endpoint.port() == replica.port()) && status.spares.len() == 1
    }));
}

#[test]
fn reset_moves_borrows_to_another_pool() {
    let server = TestServer::start().unwrap();
    let manager = manager_for(&[&server], quiet);

    let before = manager.status().current.unwrap().id;
    manager.reset();
    let conn = manager.borrow().unwrap();
    assert_ne!(conn.pool_id(), before);
}

#[test]
fn shutdown_stops_tasks_and_refuses_borrows() {
    let server = TestServer::start().unwrap();
    let manager = manager_for(&[&server], |_| {});
    manager.borrow().unwrap();

    manager.shutdown();
    assert!(manager.is_shut_down());
    assert!(matches!(manager.borrow(), Err(ClientError::Shutdown)));
    let status = manager.status();
    assert!(status.current.is_none());
    assert!(status.spares.is_empty());
}

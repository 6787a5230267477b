#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use lkv_client::{ClientOptions, KVClient, LockOptions, ManagerOptions, PoolManager, RetryPolicy, Settings};
use lkv_testkit::TestServer;

/// Settings tuned for fast tests against the given servers.
pub fn settings_for(servers: &[&TestServer]) -> Settings {
    let endpoints: Vec<_> = servers.iter().map(|server| server.endpoint()).collect();
    let mut settings = Settings::default().with_endpoints(&endpoints);
    settings.connection_timeout = Duration::from_millis(500);
    settings.health_check_interval = Duration::from_millis(50);
    settings.pool_size = 4;
    settings.pool_count = 2;
    settings.lock_ttl = Duration::from_secs(1);
    settings.lock_poll_interval = Duration::from_millis(20);
    settings.lock_renew_interval = Duration::from_millis(300);
    settings.retry_attempts = 3;
    settings.retry_delay = Duration::from_millis(10);
    settings
}

pub fn client_for(servers: &[&TestServer]) -> KVClient {
    KVClient::connect(&settings_for(servers)).expect("connect")
}

/// Client whose manager never runs background passes on its own.
pub fn quiet_client(servers: &[&TestServer]) -> KVClient {
    let settings = settings_for(servers);
    let mut options = ManagerOptions::from_settings(&settings);
    options.check_interval = Duration::from_secs(3600);
    let manager = PoolManager::new(
        Arc::new(lkv_client::EndpointDirectory::new(&settings.hosts, &settings.ports).expect("directory")),
        options,
    )
    .expect("manager");
    KVClient::from_manager(
        Arc::new(manager),
        ClientOptions {
            retry: RetryPolicy {
                attempts: 3,
                delay: Duration::from_millis(10),
            },
            data_ttl: None,
        },
    )
}

pub fn lock_options() -> LockOptions {
    LockOptions {
        ttl: Duration::from_secs(1),
        poll_interval: Duration::from_millis(20),
        renew_interval: Duration::from_millis(300),
    }
}

pub fn owner() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Polls `check` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

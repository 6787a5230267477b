//! # Endpoint Directory
//!
//! Purpose: Hand out configured endpoints in rotation so replacement pools
//! spread across the equivalent store instances.
//!
//! The ring is fixed at construction; only the cursor moves. `clear` empties
//! it for good, after which `next` yields `None` and the pool manager stops
//! replenishing.

use lkv_common::{ConfigError, ConfigResult, Endpoint};
use parking_lot::Mutex;

struct Ring {
    endpoints: Vec<Endpoint>,
    cursor: usize,
}

/// Circular, thread-safe sequence of store endpoints.
pub struct EndpointDirectory {
    ring: Mutex<Ring>,
}

impl EndpointDirectory {
    /// Builds a directory from parallel host and port lists.
    ///
    /// # Errors
    /// Mismatched lengths or an empty list; both are fatal at startup.
    pub fn new(hosts: &[String], ports: &[u16]) -> ConfigResult<Self> {
        Self::from_endpoints(Endpoint::zip(hosts, ports)?)
    }

    /// Builds a directory from already paired endpoints.
    pub fn from_endpoints(endpoints: Vec<Endpoint>) -> ConfigResult<Self> {
        if endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        tracing::debug!(count = endpoints.len(), "endpoint directory created");
        Ok(EndpointDirectory {
            ring: Mutex::new(Ring {
                endpoints,
                cursor: 0,
            }),
        })
    }

    /// Returns the endpoint after the last one returned, wrapping around.
    ///
    /// `None` means the directory has been cleared.
    pub fn next(&self) -> Option<Endpoint> {
        let mut ring = self.ring.lock();
        if ring.endpoints.is_empty() {
            return None;
        }
        let idx = ring.cursor;
        ring.cursor = (idx + 1) % ring.endpoints.len();
        Some(ring.endpoints[idx].clone())
    }

    /// Empties the directory permanently.
    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        ring.endpoints.clear();
        ring.cursor = 0;
        tracing::debug!("endpoint directory cleared");
    }

    pub fn len(&self) -> usize {
        self.ring.lock().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn rotates_and_wraps() {
        let dir = EndpointDirectory::new(&hosts(&["a", "b", "c"]), &[1, 2, 3]).unwrap();
        let seen: Vec<u16> = (0..7).filter_map(|_| dir.next()).map(|ep| ep.port()).collect();
        assert_eq!(seen, vec![1, 2, 3, 1, 2, 3, 1]);
    }

    #[test]
    fn construction_rejects_bad_lists() {
        assert!(EndpointDirectory::new(&hosts(&["a"]), &[1, 2]).is_err());
        assert!(EndpointDirectory::new(&[], &[]).is_err());
        assert!(EndpointDirectory::from_endpoints(Vec::new()).is_err());
    }

    #[test]
    fn cleared_directory_yields_none() {
        let dir = EndpointDirectory::new(&hosts(&["a"]), &[1]).unwrap();
        dir.clear();
        assert!(dir.is_empty());
        assert_eq!(dir.next(), None);
        assert_eq!(dir.next(), None);
    }

    #[test]
    fn concurrent_callers_share_one_rotation() {
        let dir = Arc::new(EndpointDirectory::new(&hosts(&["a", "b", "c", "d"]), &[1, 2, 3, 4]).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dir = Arc::clone(&dir);
                std::thread::spawn(move || (0..100).filter_map(|_| dir.next()).count())
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 400);
        // 400 draws over 4 endpoints leave the cursor back at the start.
        assert_eq!(dir.next().map(|ep| ep.port()), Some(1));
    }

    proptest! {
        #[test]
        fn one_full_turn_visits_every_endpoint_once(ports in proptest::collection::hash_set(1u16..u16::MAX, 1..16)) {
            let ports: Vec<u16> = ports.into_iter().collect();
            let names: Vec<String> = ports.iter().map(|p| format!("h{}", p)).collect();
            let dir = EndpointDirectory::new(&names, &ports).unwrap();

            let turn: Vec<Endpoint> = (0..ports.len()).filter_map(|_| dir.next()).collect();
            let unique: HashSet<&Endpoint> = turn.iter().collect();
            prop_assert_eq!(unique.len(), ports.len());
            let order: Vec<u16> = turn.iter().map(Endpoint::port).collect();
            prop_assert_eq!(&order, &ports);
            let again = dir.next();
            prop_assert_eq!(again.as_ref(), turn.first());
        }
    }
}

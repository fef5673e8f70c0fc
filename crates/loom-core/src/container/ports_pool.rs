//! Host port leasing.
//!
//! Each container gets two host ports (client-facing, server-facing) from a
//! fixed inclusive range. Leases are disjoint across all live containers.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::ContainerConfig;
use crate::domain::errors::PortAllocationError;

/// A leased (client, server) host port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortLease {
    pub client_port: u16,
    pub server_port: u16,
}

impl PortLease {
    pub fn ports(&self) -> [u16; 2] {
        [self.client_port, self.server_port]
    }
}

#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    /// `start..=end`; callers validate the range via `EngineConfig::validate`.
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn from_config(config: &ContainerConfig) -> Self {
        Self::new(config.port_range_start, config.port_range_end)
    }

    pub fn allocate(&self) -> Result<PortLease, PortAllocationError> {
        let mut in_use = self.in_use.lock();
        let mut free = (self.start..=self.end).filter(|p| !in_use.contains(p));

        match (free.next(), free.next()) {
            (Some(client_port), Some(server_port)) => {
                in_use.insert(client_port);
                in_use.insert(server_port);
                Ok(PortLease {
                    client_port,
                    server_port,
                })
            }
            _ => Err(PortAllocationError::Exhausted {
                start: self.start,
                end: self.end,
            }),
        }
    }

    /// Return a lease to the pool. Releasing twice is a no-op.
    pub fn release(&self, lease: &PortLease) {
        let mut in_use = self.in_use.lock();
        for port in lease.ports() {
            in_use.remove(&port);
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.lock().len()
    }

    pub fn capacity(&self) -> usize {
        usize::from(self.end.saturating_sub(self.start)) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn leases_two_distinct_ports_in_range() {
        let pool = PortAllocator::new(5001, 5200);
        let lease = pool.allocate().unwrap();

        assert_ne!(lease.client_port, lease.server_port);
        for p in lease.ports() {
            assert!((5001..=5200).contains(&p));
        }
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn exhaustion_fails_loudly() {
        let pool = PortAllocator::new(5001, 5004);
        pool.allocate().unwrap();
        pool.allocate().unwrap();

        assert_eq!(
            pool.allocate(),
            Err(PortAllocationError::Exhausted {
                start: 5001,
                end: 5004
            })
        );
    }

    #[test]
    fn release_is_idempotent_and_recycles() {
        let pool = PortAllocator::new(5001, 5002);
        let lease = pool.allocate().unwrap();

        pool.release(&lease);
        pool.release(&lease);
        assert_eq!(pool.in_use(), 0);

        assert_eq!(pool.allocate().unwrap(), lease);
    }

    #[test]
    fn concurrent_allocations_are_disjoint() {
        let pool = std::sync::Arc::new(PortAllocator::new(5001, 5200));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    (0..10).map(|_| pool.allocate().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for lease in h.join().unwrap() {
                for p in lease.ports() {
                    assert!(seen.insert(p), "port {p} leased twice");
                }
            }
        }
        assert_eq!(seen.len(), 160);
    }

    proptest! {
        #[test]
        fn live_leases_stay_disjoint(ops in prop::collection::vec(any::<bool>(), 1..200)) {
            let pool = PortAllocator::new(5001, 5040);
            let mut live: Vec<PortLease> = Vec::new();

            for allocate in ops {
                if allocate || live.is_empty() {
                    if let Ok(lease) = pool.allocate() {
                        live.push(lease);
                    }
                } else {
                    let lease = live.remove(0);
                    pool.release(&lease);
                }

                let mut seen = HashSet::new();
                for lease in &live {
                    for p in lease.ports() {
                        prop_assert!(seen.insert(p));
                    }
                }
                prop_assert_eq!(pool.in_use(), live.len() * 2);
            }
        }
    }
}

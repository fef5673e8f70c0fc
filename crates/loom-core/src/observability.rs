use serde::{Deserialize, Serialize};

use crate::resilience::BreakerState;

/// Point-in-time snapshot of one orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCounts {
    pub pending: usize,
    pub generating: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub live_containers: usize,
    pub leased_ports: usize,
    pub breaker: BreakerState,
}

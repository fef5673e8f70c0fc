//! Container lifecycle: one isolated runtime per session.
//!
//! - `machine`: pure states, events and transition function
//! - `manager`: per-session supervisor task that runs entry/exit actions
//! - `ports_pool`, `logs`, `health`: resources the supervisor owns or uses

pub mod health;
pub mod logs;
pub mod machine;
pub mod manager;
pub mod ports_pool;

pub use self::health::{HealthChecker, HealthOutcome};
pub use self::logs::{LogManager, detect_build_event};
pub use self::machine::{ContainerEvent, ContainerState, transition};
pub use self::manager::{ContainerCommand, ContainerHandle, ContainerManager, ContainerRecord};
pub use self::ports_pool::{PortAllocator, PortLease};

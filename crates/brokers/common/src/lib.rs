//! Shared broker plumbing: configuration registry, call policy, and the
//! in-process simulated broker.

pub mod client;
pub mod limiter;
pub mod registry;
pub mod retry;
pub mod simulated;

pub use client::{CallReport, ExecutionClient};
pub use limiter::BrokerLimiter;
pub use registry::{
    load_broker_file, parse_brokers, BrokerMap, BrokerRegistry, ConfigFormat, LookupError,
    RegistryError,
};
pub use retry::BackoffPolicy;
pub use simulated::{ExecutedOrder, SimulatedBroker, SimulatedBrokerConfig, SimulatedStep};

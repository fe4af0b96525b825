//! credit-flow: a credit-flow-controlled asynchronous request protocol
//!
//! - `protocol`: window, registry, grant policies, phase and action vocabulary
//! - `server`: the concurrent server, its worker and cancellation tasks, DST harness
//! - `model`: Stateright model of the protocol and the conformance monitor
//! - `config`: TOML/env configuration
//! - `simulator`: seeded randomness

pub mod config;
pub mod model;
pub mod protocol;
pub mod server;
pub mod simulator;

pub use config::{ConfigError, ServerConfig};
pub use model::{ConformanceMonitor, ConformanceViolation, CreditFlowModel};
pub use protocol::{
    Command, GrantMode, Phase, ProtocolAction, ProtocolError, RequestId, Response,
    ResponseStatus,
};
pub use server::{CreditServer, LedgerSnapshot, ResponseObserver, Submission};

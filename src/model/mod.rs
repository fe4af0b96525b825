//! Protocol correctness model
//!
//! A sequential rendition of the credit-flow bookkeeping with no concurrency.
//! It serves two purposes:
//!
//! - `CreditFlowModel` implements `stateright::Model`, so the checker can
//!   explore every legal interleaving of requests, cancels and responses
//!   within a bounded id space and verify the safety properties.
//! - `ConformanceMonitor` steps the same model with actions observed from a
//!   running server, failing on the first action the model does not permit.
//!
//! ## Properties
//!
//! | Property | Kind |
//! |---|---|
//! | `window and registry disjoint` | always |
//! | `requested credits positive` | always |
//! | `granted within requested` | always |
//! | `ids within high-water mark` | always |
//! | `phase consistent` | always |
//! | `no starvation` | always (fails without the starvation guard) |
//! | `session activated` | sometimes |
//! | `cancellation resolved` | sometimes |
//! | `window grows` | sometimes |
//!
//! ## Running model checks
//!
//! ```bash
//! cargo test model_check -- --nocapture
//! cargo test model_check -- --ignored --nocapture   # larger bounds
//! ```

pub mod conformance;
pub mod credit_flow;

pub use conformance::{ConformanceMonitor, ConformanceViolation};
pub use credit_flow::{CreditFlowModel, LastResponse, ProtocolState};

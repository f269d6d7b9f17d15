//! Stateright Model Checking
//!
//! Exhaustive state-space exploration of the orchestration checkpoint
//! protocol. The DST harnesses sample interleavings with faults; the model
//! here enumerates every plan / settle / commit / crash ordering for a small
//! watermark set.
//!
//! ## Running Model Checks
//!
//! ```bash
//! # Marked #[ignore] for CI speed
//! cargo test stateright -- --ignored --nocapture
//! ```
//!
//! | Model | Key Invariants |
//! |-------|----------------|
//! | `OrchestrationModel` | completed implies settled, monotonic checkpoint, exact progress |

pub mod orchestration;

pub use orchestration::{OrchestrationModel, OrchestrationModelConfig};

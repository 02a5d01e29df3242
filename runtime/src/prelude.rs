//! Convenience re-exports for feed authors.
//!
//! ```rust
//! use outfall_runtime::prelude::*;
//! ```

// Core types
pub use outfall_core::{Envelope, Permit, PermitRule, RawRecord, Reading, Severity, Topic};

// Feeding the pipeline
pub use outfall_gateway::{Pipeline, ReadingSender, SpeciesStatus};

// Fan-out
pub use outfall_core::RelayChannel;
pub use outfall_gateway::MemoryRelay;

// Error types
pub use outfall_core::PipelineError;
pub use outfall_gateway::GatewayError;

// Runtime
pub use crate::RuntimeBuilder;

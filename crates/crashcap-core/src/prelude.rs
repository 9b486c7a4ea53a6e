//! Common module for library exports

pub use crate::config::{CaptureLimits, DumpTarget, HandlerConfig};
pub use crate::error::{CaptureError, CaptureResult};
pub use crate::snapshot::{FaultKind, FaultRecord, Incomplete};
pub use crate::types::address::Address;
pub use crate::types::process::{Architecture, ProcessId, ThreadId};
pub use crate::writer::{DumpReport, DumpStatus, Writer};

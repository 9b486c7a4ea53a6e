//! # Types
//!
//! Platform-agnostic types used throughout the capture engine.
//!
//! These types abstract away platform-specific details, so the snapshot model
//! and serializer can talk about "a thread's registers" or "an address"
//! without knowing whether they came from a Linux `ucontext_t` or a Mach
//! `thread_get_state()` call.

pub mod address;
pub mod process;
pub mod registers;

// Re-export all public types
pub use address::Address;
pub use process::{Architecture, OsFamily, ProcessId, ThreadId};
pub use registers::{Amd64Registers, Arm64Registers, ContextValidity, CpuContext, RegisterSet};

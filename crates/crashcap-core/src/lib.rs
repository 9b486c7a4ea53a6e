//! # crashcap-core
//!
//! In-process crash capture and minidump writing.
//!
//! This crate provides:
//! - Fault interception (`SIGSEGV`, `SIGBUS`, `SIGABRT`, `SIGFPE`, `SIGILL`, `SIGTRAP`)
//!   through [`handler::install`]
//! - Capture of threads, registers, stacks and loaded modules from inside the
//!   faulting process
//! - Serialization to the Microsoft/Breakpad minidump format
//! - On-demand dumps of a healthy process through [`writer::Writer`]
//!
//! ## Platform Support
//!
//! - **Linux / Android** (x86_64, aarch64): `/proc/self` and `process_vm_readv`
//! - **macOS** (x86_64, aarch64): Mach task, thread and VM APIs
//! - Anything else builds, but installing handlers or creating a writer
//!   fails with [`CaptureError::UnsupportedPlatform`]
//!
//! ## Why unsafe code is needed
//!
//! Capture talks to the kernel directly and runs inside signal handlers, where
//! the usual runtime services are off limits. Signal registration, raw
//! syscalls, Mach calls and register layouts all need `unsafe`. The unsafe
//! parts stay inside [`handler`] and [`platform`]; the snapshot model and the
//! serializer are safe code.

#![allow(unsafe_code)] // Required for signal handling, raw syscalls and Mach APIs

pub mod capture;
pub mod config;
pub mod error;
pub mod fixed;
pub mod format;
pub mod handler;
pub mod platform;
pub mod prelude;
pub mod serializer;
pub mod snapshot;
#[cfg(debug_assertions)]
pub mod triggers;
pub mod types;
pub mod writer;

pub use config::{CaptureLimits, DumpTarget, HandlerConfig};
pub use error::{CaptureError, CaptureResult};
pub use snapshot::{FaultKind, Incomplete};
pub use writer::{DumpReport, DumpStatus, Writer};

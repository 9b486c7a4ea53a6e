//! # Writer Facade
//!
//! On-demand dumps of the running process.
//!
//! A [`Writer`] captures the calling thread and everything else in the
//! process, then serializes to a file. It runs on a healthy thread, so unlike
//! the fault path it may allocate: storage is created per call and the file
//! goes through a `BufWriter`.
//!
//! ## Lifecycle
//!
//! 1. [`Writer::create`] (or [`Writer::with_limits`]) checks the platform
//! 2. [`Writer::write_dump`] / [`Writer::write_dump_with_exception`], any number of times
//! 3. [`Writer::free`], or just drop it
//!
//! ```rust,no_run
//! use crashcap_core::writer::Writer;
//!
//! let mut writer = Writer::create()?;
//! let report = writer.write_dump("/tmp/manual.dmp")?;
//! println!("{} threads, {} bytes", report.threads, report.bytes_written);
//! writer.free();
//! # Ok::<(), crashcap_core::error::CaptureError>(())
//! ```

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::capture::{capture, CaptureBackend, CaptureRequest, FaultingThread, Restricted};
use crate::config::CaptureLimits;
use crate::error::{CaptureError, CaptureResult};
use crate::platform::NativeBackend;
use crate::serializer::{serialize, IoSink};
use crate::snapshot::{FaultRecord, Incomplete, SnapshotStorage};
use crate::types::Address;

/// Where a writer is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState
{
    /// Idle, accepting dump requests
    Ready,
    /// A dump is being captured or written
    Writing,
}

/// Whether a written dump holds everything that was asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpStatus
{
    Complete,
    /// Written, but some state could not be captured
    Partial(Incomplete),
}

/// Summary of one written dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpReport
{
    pub path: PathBuf,
    pub bytes_written: u64,
    pub threads: usize,
    pub modules: usize,
    pub incomplete: Incomplete,
}

impl DumpReport
{
    pub const fn is_partial(&self) -> bool
    {
        !self.incomplete.is_empty()
    }

    pub const fn status(&self) -> DumpStatus
    {
        if self.is_partial() {
            DumpStatus::Partial(self.incomplete)
        } else {
            DumpStatus::Complete
        }
    }
}

/// One crash-capture engine instance
///
/// Move-only: [`Writer::free`] consumes it, so a released writer cannot be
/// used again.
#[derive(Debug)]
pub struct Writer
{
    limits: CaptureLimits,
    state: WriterState,
}

impl Writer
{
    /// Writer with limits from the environment (see [`CaptureLimits::from_env`])
    ///
    /// # Errors
    ///
    /// [`CaptureError::UnsupportedPlatform`] when this target has no capture backend.
    pub fn create() -> CaptureResult<Self>
    {
        Self::with_limits(CaptureLimits::from_env())
    }

    pub fn with_limits(limits: CaptureLimits) -> CaptureResult<Self>
    {
        NativeBackend::ensure_supported()?;
        limits.validate()?;
        tracing::debug!(?limits, "Writer created");
        Ok(Self {
            limits,
            state: WriterState::Ready,
        })
    }

    pub const fn state(&self) -> WriterState
    {
        self.state
    }

    pub const fn limits(&self) -> &CaptureLimits
    {
        &self.limits
    }

    /// Dump the current process to `path` without an exception stream
    pub fn write_dump(&mut self, path: impl AsRef<Path>) -> CaptureResult<DumpReport>
    {
        self.write(path.as_ref(), None)
    }

    /// Dump the current process with a synthesized exception record
    ///
    /// `kind` becomes the exception code, `code` the exception flags and the
    /// first exception parameter, `address` the exception address.
    pub fn write_dump_with_exception(
        &mut self,
        path: impl AsRef<Path>,
        kind: u32,
        code: u64,
        address: u64,
    ) -> CaptureResult<DumpReport>
    {
        let fault = FaultRecord::synthesized(kind, code, Address::new(address));
        self.write(path.as_ref(), Some(fault))
    }

    /// Release the writer
    pub fn free(self)
    {
        tracing::debug!("Writer freed");
    }

    fn write(&mut self, path: &Path, fault: Option<FaultRecord>) -> CaptureResult<DumpReport>
    {
        self.state = WriterState::Writing;
        let result = write_to(path, &self.limits, fault);
        self.state = WriterState::Ready;

        match &result {
            Ok(report) if report.is_partial() => tracing::warn!(
                path = %report.path.display(),
                incomplete = ?report.incomplete,
                "Minidump written with missing state"
            ),
            Ok(report) => tracing::info!(
                path = %report.path.display(),
                bytes = report.bytes_written,
                threads = report.threads,
                modules = report.modules,
                "Minidump written"
            ),
            Err(error) => tracing::error!(path = %path.display(), %error, "Minidump write failed"),
        }
        result
    }
}

fn write_to(path: &Path, limits: &CaptureLimits, fault: Option<FaultRecord>) -> CaptureResult<DumpReport>
{
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| CaptureError::io(parent, source))?;
    }
    let file = File::create(path).map_err(|source| CaptureError::io(path, source))?;

    let mut storage = SnapshotStorage::new(limits);
    let system = NativeBackend::system_snapshot();
    let request = CaptureRequest {
        thread: FaultingThread {
            id: NativeBackend::current_thread(),
            registers: NativeBackend::current_registers(),
        },
        fault,
        captured_at: unix_seconds(),
    };
    let snapshot = capture::<NativeBackend>(Restricted::new(&mut storage), &request, &system);

    let mut sink = IoSink(BufWriter::new(file));
    let bytes_written = serialize(&snapshot, &mut sink)?;
    let file = sink
        .into_inner()
        .into_inner()
        .map_err(|error| CaptureError::io(path, error.into_error()))?;
    file.sync_all().map_err(|source| CaptureError::io(path, source))?;

    Ok(DumpReport {
        path: path.to_path_buf(),
        bytes_written,
        threads: snapshot.threads.len(),
        modules: snapshot.modules.len(),
        incomplete: snapshot.incomplete,
    })
}

fn unix_seconds() -> u32
{
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_report_status()
    {
        let mut report = DumpReport {
            path: PathBuf::from("a.dmp"),
            bytes_written: 10,
            threads: 1,
            modules: 1,
            incomplete: Incomplete::empty(),
        };
        assert_eq!(report.status(), DumpStatus::Complete);

        report.incomplete = Incomplete::MODULES;
        assert!(report.is_partial());
        assert_eq!(report.status(), DumpStatus::Partial(Incomplete::MODULES));
    }

    #[test]
    fn test_writer_returns_to_ready()
    {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = Writer::create().unwrap();
        let report = writer.write_dump(dir.path().join("a.dmp")).unwrap();
        assert_eq!(writer.state(), WriterState::Ready);
        assert!(report.bytes_written > 32);
        assert!(report.threads >= 1);
    }

    #[test]
    fn test_parent_directories_are_created()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep/er/dump.dmp");
        Writer::create().unwrap().write_dump(&path).unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn test_unwritable_path_is_io_error()
    {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as the output file
        let result = Writer::create().unwrap().write_dump(dir.path());
        assert!(matches!(result, Err(CaptureError::Io { .. })));
    }
}

//! # Platform-Specific Implementations
//!
//! One [`CaptureBackend`](crate::capture::CaptureBackend) per supported OS:
//!
//! - **Linux / Android**: `/proc/self` for threads and mappings,
//!   `process_vm_readv` for memory
//!   - See: [proc(5)](https://man7.org/linux/man-pages/man5/proc.5.html)
//! - **macOS**: Mach APIs (`task_threads`, `thread_get_state`, `mach_vm_read_overwrite`)
//!   - See: [Apple Mach Kernel Programming](https://developer.apple.com/library/archive/documentation/Darwin/Conceptual/KernelProgramming/Mach/Mach.html)
//!
//! Everything else gets [`unsupported::UnsupportedBackend`], which refuses to
//! install handlers or write dumps. [`NativeBackend`] names whichever backend
//! this build uses.

cfg_if::cfg_if! {
    if #[cfg(all(
        any(target_os = "linux", target_os = "android"),
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))] {
        pub mod linux;

        /// Backend for the current build target
        pub type NativeBackend = linux::LinuxBackend;
    } else if #[cfg(all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64")))] {
        pub mod macos;

        /// Backend for the current build target
        pub type NativeBackend = macos::MacOsBackend;
    } else {
        /// Backend for the current build target
        pub type NativeBackend = unsupported::UnsupportedBackend;
    }
}

pub mod unsupported;

//! # Thread Enumeration and Suspension
//!
//! `task_threads()` hands back an array of send rights that the kernel
//! allocated into our address space. [`TaskThreads`] owns that array: it
//! suspends every thread except the capturing one, and on drop resumes them,
//! releases each right and frees the array.
//!
//! Suspending from inside a signal handler is safe with respect to locks
//! because nothing in capture takes a lock a suspended thread could hold.

use std::mem;

use libc::{mach_msg_type_number_t, thread_act_t, vm_address_t, vm_size_t};
use mach2::kern_return::KERN_SUCCESS;
use mach2::task::task_threads;
use mach2::traps::mach_task_self;

use super::ffi;

/// Thread ports of our own task, with every other thread suspended
pub struct TaskThreads
{
    ports: *mut thread_act_t,
    count: mach_msg_type_number_t,
    current: thread_act_t,
}

impl TaskThreads
{
    /// Enumerate our threads and suspend all of them except `current`
    ///
    /// Threads that fail to suspend (for example because they are exiting)
    /// are released immediately and left out of [`Self::ports`].
    pub fn suspend_others(current: thread_act_t) -> Option<Self>
    {
        let mut ports: *mut thread_act_t = std::ptr::null_mut();
        let mut count: mach_msg_type_number_t = 0;
        // SAFETY: out-pointers are valid; the kernel allocates the array
        let result = unsafe { task_threads(mach_task_self(), &mut ports, &mut count) };
        if result != KERN_SUCCESS || ports.is_null() {
            return None;
        }

        let threads = Self { ports, count, current };
        // SAFETY: the array holds `count` ports and is ours until drop
        for port in unsafe { std::slice::from_raw_parts_mut(ports, count as usize) } {
            if *port == current {
                continue;
            }
            // SAFETY: `port` is a live send right from task_threads
            if unsafe { ffi::thread_suspend(*port) } != KERN_SUCCESS {
                unsafe {
                    ffi::mach_port_deallocate(mach_task_self(), *port);
                }
                *port = 0;
            }
        }
        Some(threads)
    }

    /// Ports of all listed threads, the current one included
    pub fn ports(&self) -> impl Iterator<Item = thread_act_t> + '_
    {
        // SAFETY: see `suspend_others`
        unsafe { std::slice::from_raw_parts(self.ports, self.count as usize) }
            .iter()
            .copied()
            .filter(|&port| port != 0)
    }
}

impl Drop for TaskThreads
{
    fn drop(&mut self)
    {
        // Best effort resume - ignore errors
        unsafe {
            for &port in std::slice::from_raw_parts(self.ports, self.count as usize) {
                if port == 0 {
                    continue;
                }
                if port != self.current {
                    let _ = ffi::thread_resume(port);
                }
                let _ = ffi::mach_port_deallocate(mach_task_self(), port);
            }
            let size = (self.count as usize).saturating_mul(mem::size_of::<thread_act_t>()) as vm_size_t;
            let _ = ffi::vm_deallocate(mach_task_self(), self.ports as vm_address_t, size);
        }
    }
}

/// Port of the calling thread
///
/// The extra reference from `mach_thread_self()` is dropped right away: the
/// task keeps the name alive for as long as the thread exists.
pub fn current_thread_port() -> thread_act_t
{
    // SAFETY: no preconditions
    unsafe {
        let port = ffi::mach_thread_self();
        let _ = ffi::mach_port_deallocate(mach_task_self(), port);
        port
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_lists_current_thread_and_resumes_others()
    {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let worker = std::thread::spawn(move || {
            rx.recv().unwrap();
        });

        let me = current_thread_port();
        {
            let threads = TaskThreads::suspend_others(me).unwrap();
            assert!(threads.ports().any(|port| port == me));
            assert!(threads.ports().count() >= 2);
        }

        // The worker runs again once the guard is gone
        tx.send(()).unwrap();
        worker.join().unwrap();
    }
}

//! Fixed-capacity storage backing a [`Snapshot`].
//!
//! Everything here is allocated once, in [`SnapshotStorage::new`], and never
//! grows afterwards: [`Bounded`] refuses pushes past its reserved capacity and
//! [`BytePool`] is a bump buffer that hands out [`Span`]s. That is what makes
//! it usable from a signal handler.

use super::{
    FaultRecord, Incomplete, MemoryRegion, ModuleIdentity, ModuleRecord, Snapshot, SystemSnapshot, ThreadFlags,
    ThreadSnapshot,
};
use crate::config::CaptureLimits;
use crate::types::{Address, ProcessId, RegisterSet, ThreadId};

/// Bytes reserved per memory window around the fault
pub const WINDOW_BYTES: usize = 256;
/// Memory windows per capture (instruction pointer and fault address)
pub const MAX_WINDOWS: usize = 2;

/// Offset and length of a byte range inside a [`BytePool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span
{
    offset: u32,
    len: u32,
}

impl Span
{
    pub const EMPTY: Self = Self { offset: 0, len: 0 };

    pub const fn len(&self) -> usize
    {
        self.len as usize
    }

    pub const fn is_empty(&self) -> bool
    {
        self.len == 0
    }

    /// The first `len` bytes of this span
    #[must_use]
    pub const fn shortened(self, len: usize) -> Self
    {
        let len = if len < self.len as usize { len as u32 } else { self.len };
        Self {
            offset: self.offset,
            len,
        }
    }
}

/// Vector whose capacity is fixed at construction
///
/// `Vec::push` below capacity never reallocates, so `try_push` is
/// allocation-free by construction.
#[derive(Debug, Clone)]
pub struct Bounded<T>
{
    items: Vec<T>,
    limit: usize,
}

impl<T> Bounded<T>
{
    pub fn with_capacity(limit: usize) -> Self
    {
        Self {
            items: Vec::with_capacity(limit),
            limit,
        }
    }

    /// Push an item, handing it back when the storage is full
    pub fn try_push(&mut self, item: T) -> Result<&mut T, T>
    {
        if self.items.len() >= self.limit {
            return Err(item);
        }
        self.items.push(item);
        let last = self.items.len() - 1;
        Ok(&mut self.items[last])
    }

    pub fn is_full(&self) -> bool
    {
        self.items.len() >= self.limit
    }

    pub fn len(&self) -> usize
    {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.items.is_empty()
    }

    pub const fn limit(&self) -> usize
    {
        self.limit
    }

    pub fn clear(&mut self)
    {
        self.items.clear();
    }

    pub fn as_slice(&self) -> &[T]
    {
        &self.items
    }

    pub fn as_mut_slice(&mut self) -> &mut [T]
    {
        &mut self.items
    }

    /// In-place filter; never reallocates
    pub fn retain(&mut self, keep: impl FnMut(&T) -> bool)
    {
        self.items.retain(keep);
    }
}

/// Bump allocator over a fixed byte buffer
#[derive(Debug, Clone)]
pub struct BytePool
{
    bytes: Box<[u8]>,
    used: usize,
}

impl BytePool
{
    pub fn with_capacity(capacity: usize) -> Self
    {
        Self {
            bytes: vec![0; capacity].into_boxed_slice(),
            used: 0,
        }
    }

    /// Reserve `len` bytes and return them for filling
    ///
    /// Returns `None` when the pool cannot hold `len` more bytes.
    pub fn reserve(&mut self, len: usize) -> Option<(Span, &mut [u8])>
    {
        let end = self.used.checked_add(len)?;
        if end > self.bytes.len() {
            return None;
        }
        let span = Span {
            offset: u32::try_from(self.used).ok()?,
            len: u32::try_from(len).ok()?,
        };
        let start = self.used;
        self.used = end;
        Some((span, &mut self.bytes[start..end]))
    }

    /// Give back the unused tail of the most recent reservation
    ///
    /// Only valid for the last span handed out; earlier spans are left alone.
    pub fn shrink_last(&mut self, span: Span, len: usize) -> Span
    {
        let shortened = span.shortened(len);
        if span.offset as usize + span.len() == self.used {
            self.used = shortened.offset as usize + shortened.len();
        }
        shortened
    }

    /// Copy `data` into the pool
    pub fn push(&mut self, data: &[u8]) -> Option<Span>
    {
        let (span, dst) = self.reserve(data.len())?;
        dst.copy_from_slice(data);
        Some(span)
    }

    pub fn get(&self, span: Span) -> &[u8]
    {
        let start = span.offset as usize;
        self.bytes.get(start..start + span.len()).unwrap_or(&[])
    }

    pub fn remaining(&self) -> usize
    {
        self.bytes.len() - self.used
    }

    pub fn clear(&mut self)
    {
        self.used = 0;
    }
}

/// Scratch buffers used while reading `/proc` files and image headers
#[derive(Debug)]
pub struct Scratch
{
    /// Line reader buffer (must hold a `/proc/self/maps` line with a `PATH_MAX` path)
    pub io: Box<[u8]>,
    /// Image header copy for build-id / UUID extraction
    pub header: Box<[u8]>,
}

impl Scratch
{
    pub const IO_BYTES: usize = 16 * 1024;
    pub const HEADER_BYTES: usize = 16 * 1024;

    fn new() -> Self
    {
        Self {
            io: vec![0; Self::IO_BYTES].into_boxed_slice(),
            header: vec![0; Self::HEADER_BYTES].into_boxed_slice(),
        }
    }

    /// Placeholder left behind by [`SnapshotStorage::take_scratch`]; empty boxes do not allocate
    fn empty() -> Self
    {
        Self {
            io: Box::default(),
            header: Box::default(),
        }
    }
}

/// All memory a capture may use, reserved up front
///
/// The handler registry creates one at install time for fault dumps; the
/// on-demand writer creates a fresh one per call.
#[derive(Debug)]
pub struct SnapshotStorage
{
    limits: CaptureLimits,
    threads: Bounded<ThreadSnapshot>,
    modules: Bounded<ModuleRecord>,
    regions: Bounded<MemoryRegion>,
    memory: BytePool,
    names: BytePool,
    incomplete: Incomplete,
    scratch: Scratch,
}

impl SnapshotStorage
{
    /// Reserve storage for one capture under `limits`
    ///
    /// Pool memory comes from zeroed allocations, so most of it stays untouched
    /// (and unbacked) until a capture writes into it.
    pub fn new(limits: &CaptureLimits) -> Self
    {
        let memory_bytes = limits.max_threads * limits.max_stack_bytes + MAX_WINDOWS * WINDOW_BYTES;
        Self {
            limits: *limits,
            threads: Bounded::with_capacity(limits.max_threads),
            modules: Bounded::with_capacity(limits.max_modules),
            regions: Bounded::with_capacity(MAX_WINDOWS),
            memory: BytePool::with_capacity(memory_bytes),
            names: BytePool::with_capacity(limits.name_pool_bytes),
            incomplete: Incomplete::empty(),
            scratch: Scratch::new(),
        }
    }

    pub const fn limits(&self) -> &CaptureLimits
    {
        &self.limits
    }

    /// Forget the previous capture, keeping the reserved memory
    pub fn reset(&mut self)
    {
        self.threads.clear();
        self.modules.clear();
        self.regions.clear();
        self.memory.clear();
        self.names.clear();
        self.incomplete = Incomplete::empty();
    }

    /// Move the scratch buffers out, so they can be filled while records are pushed
    pub fn take_scratch(&mut self) -> Scratch
    {
        std::mem::replace(&mut self.scratch, Scratch::empty())
    }

    pub fn restore_scratch(&mut self, scratch: Scratch)
    {
        self.scratch = scratch;
    }

    pub fn mark(&mut self, missing: Incomplete)
    {
        self.incomplete |= missing;
    }

    pub const fn incomplete(&self) -> Incomplete
    {
        self.incomplete
    }

    /// Add a thread record, flagging the dump when `max_threads` is reached
    pub fn add_thread(&mut self, id: ThreadId, registers: RegisterSet) -> Option<&mut ThreadSnapshot>
    {
        match self.threads.try_push(ThreadSnapshot::new(id, registers)) {
            Ok(thread) => Some(thread),
            Err(_) => {
                self.incomplete |= Incomplete::THREAD_LIST;
                None
            }
        }
    }

    pub fn threads(&self) -> &[ThreadSnapshot]
    {
        self.threads.as_slice()
    }

    pub fn threads_mut(&mut self) -> &mut [ThreadSnapshot]
    {
        self.threads.as_mut_slice()
    }

    /// Fill the stack of thread `index`
    ///
    /// `read` receives a buffer of at most `max_stack_bytes` and returns how
    /// many bytes it filled (`None` when nothing could be read). `available`
    /// is the full distance from `start` to the end of the stack mapping.
    pub fn capture_stack(
        &mut self,
        index: usize,
        start: Address,
        available: u64,
        read: impl FnOnce(Address, &mut [u8]) -> Option<usize>,
    )
    {
        let cap = self.limits.max_stack_bytes;
        let wanted = usize::try_from(available).map_or(cap, |available| available.min(cap));

        let Some(thread) = self.threads.as_mut_slice().get_mut(index) else {
            return;
        };

        let Some((span, buffer)) = self.memory.reserve(wanted) else {
            thread.flags |= ThreadFlags::STACK_UNREADABLE;
            self.incomplete |= Incomplete::STACKS;
            return;
        };

        let filled = read(start, buffer).unwrap_or(0);
        let span = self.memory.shrink_last(span, filled);

        thread.stack.start = start;
        thread.stack.span = span;
        thread.stack.available = available;

        if filled == 0 {
            thread.flags |= ThreadFlags::STACK_UNREADABLE;
            self.incomplete |= Incomplete::STACKS;
        } else if available > filled as u64 && filled == cap {
            thread.flags |= ThreadFlags::STACK_TRUNCATED;
        }
    }

    /// Copy already-read stack bytes for thread `index` (capped like a live capture)
    pub fn set_stack_bytes(&mut self, index: usize, start: Address, bytes: &[u8])
    {
        self.capture_stack(index, start, bytes.len() as u64, |_, buffer| {
            let len = buffer.len();
            buffer.copy_from_slice(&bytes[..len]);
            Some(len)
        });
    }

    /// Add a module, copying `name` into the name pool
    ///
    /// A full name pool keeps the module with an empty name.
    pub fn add_module(&mut self, base: Address, size: u64, name: &[u8], identity: ModuleIdentity) -> Option<&mut ModuleRecord>
    {
        let name = match self.names.push(name) {
            Some(span) => span,
            None => {
                self.incomplete |= Incomplete::NAMES;
                Span::EMPTY
            }
        };
        match self.modules.try_push(ModuleRecord {
            base,
            size,
            name,
            identity,
        }) {
            Ok(module) => Some(module),
            Err(_) => {
                self.incomplete |= Incomplete::MODULES;
                None
            }
        }
    }

    pub fn modules(&self) -> &[ModuleRecord]
    {
        self.modules.as_slice()
    }

    pub fn modules_mut(&mut self) -> &mut [ModuleRecord]
    {
        self.modules.as_mut_slice()
    }

    pub fn module_name(&self, module: &ModuleRecord) -> &[u8]
    {
        self.names.get(module.name)
    }

    pub fn modules_full(&self) -> bool
    {
        self.modules.is_full()
    }

    /// Drop modules that turned out not to be code images
    pub fn retain_modules(&mut self, keep: impl FnMut(&ModuleRecord) -> bool)
    {
        self.modules.retain(keep);
    }

    /// Capture a memory window, unless it overlaps something already captured
    pub fn add_region(&mut self, start: Address, len: usize, read: impl FnOnce(Address, &mut [u8]) -> Option<usize>)
    {
        let end = start.value().saturating_add(len as u64);
        let overlaps = |begin: u64, size: usize| begin < end && start.value() < begin.saturating_add(size as u64);
        if self
            .threads
            .as_slice()
            .iter()
            .any(|thread| overlaps(thread.stack.start.value(), thread.stack.len()))
            || self
                .regions
                .as_slice()
                .iter()
                .any(|region| overlaps(region.start.value(), region.span.len()))
        {
            return;
        }

        if self.regions.is_full() {
            return;
        }
        let Some((span, buffer)) = self.memory.reserve(len) else {
            self.incomplete |= Incomplete::MEMORY;
            return;
        };
        let filled = read(start, buffer).unwrap_or(0);
        let span = self.memory.shrink_last(span, filled);
        if filled == 0 {
            self.incomplete |= Incomplete::MEMORY;
            return;
        }
        let _ = self.regions.try_push(MemoryRegion { start, span });
    }

    pub fn regions(&self) -> &[MemoryRegion]
    {
        self.regions.as_slice()
    }

    /// Borrow the captured state as a [`Snapshot`]
    pub fn snapshot<'s>(
        &'s self,
        pid: ProcessId,
        captured_at: u32,
        fault: Option<FaultRecord>,
        system: &'s SystemSnapshot,
    ) -> Snapshot<'s>
    {
        Snapshot {
            pid,
            captured_at,
            fault,
            threads: self.threads.as_slice(),
            modules: self.modules.as_slice(),
            regions: self.regions.as_slice(),
            system,
            incomplete: self.incomplete,
            max_stack_bytes: self.limits.max_stack_bytes,
            memory: &self.memory,
            names: &self.names,
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::snapshot::IdentitySource;

    fn small_limits() -> CaptureLimits
    {
        CaptureLimits::default()
            .with_max_threads(2)
            .with_max_stack_bytes(64)
            .with_max_modules(1)
    }

    #[test]
    fn test_bounded_refuses_past_capacity()
    {
        let mut bounded = Bounded::with_capacity(1);
        assert!(bounded.try_push(1u32).is_ok());
        assert_eq!(bounded.try_push(2u32), Err(2));
        assert_eq!(bounded.as_slice(), &[1]);
    }

    #[test]
    fn test_byte_pool_shrink_last_returns_space()
    {
        let mut pool = BytePool::with_capacity(16);
        let (span, _) = pool.reserve(10).unwrap();
        let span = pool.shrink_last(span, 4);
        assert_eq!(span.len(), 4);
        assert_eq!(pool.remaining(), 12);
        assert!(pool.reserve(13).is_none());
    }

    #[test]
    fn test_thread_overflow_marks_thread_list()
    {
        let mut storage = SnapshotStorage::new(&small_limits());
        assert!(storage.add_thread(ThreadId(1), RegisterSet::empty()).is_some());
        assert!(storage.add_thread(ThreadId(2), RegisterSet::empty()).is_some());
        assert!(storage.add_thread(ThreadId(3), RegisterSet::empty()).is_none());
        assert!(storage.incomplete().contains(Incomplete::THREAD_LIST));
    }

    #[test]
    fn test_stack_longer_than_cap_is_truncated()
    {
        let mut storage = SnapshotStorage::new(&small_limits());
        storage.add_thread(ThreadId(1), RegisterSet::empty());
        storage.set_stack_bytes(0, Address::new(0x1000), &[0xaa; 200]);

        let thread = &storage.threads()[0];
        assert!(thread.is_truncated());
        assert_eq!(thread.stack.len(), 64);
        assert_eq!(thread.stack.available, 200);
    }

    #[test]
    fn test_unreadable_stack_is_flagged()
    {
        let mut storage = SnapshotStorage::new(&small_limits());
        storage.add_thread(ThreadId(1), RegisterSet::empty());
        storage.capture_stack(0, Address::new(0x1000), 32, |_, _| None);

        assert!(storage.threads()[0].flags.contains(ThreadFlags::STACK_UNREADABLE));
        assert!(storage.incomplete().contains(Incomplete::STACKS));
    }

    #[test]
    fn test_region_overlapping_stack_is_skipped()
    {
        let mut storage = SnapshotStorage::new(&small_limits());
        storage.add_thread(ThreadId(1), RegisterSet::empty());
        storage.set_stack_bytes(0, Address::new(0x1000), &[1; 32]);

        storage.add_region(Address::new(0x1010), 16, |_, buf| Some(buf.len()));
        assert!(storage.regions().is_empty());

        storage.add_region(Address::new(0x2000), 16, |_, buf| {
            buf.fill(7);
            Some(buf.len())
        });
        assert_eq!(storage.regions().len(), 1);
    }

    #[test]
    fn test_module_overflow_marks_modules()
    {
        let mut storage = SnapshotStorage::new(&small_limits());
        let identity = ModuleIdentity::new(IdentitySource::ElfBuildId, &[1, 2, 3]);
        assert!(storage.add_module(Address::new(0x1000), 0x1000, b"/bin/a", identity).is_some());
        assert!(storage.add_module(Address::new(0x3000), 0x1000, b"/bin/b", identity).is_none());
        assert!(storage.incomplete().contains(Incomplete::MODULES));
        assert_eq!(storage.module_name(&storage.modules()[0]), b"/bin/a");
    }
}

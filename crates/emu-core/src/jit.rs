//! Bindings for the ARM32 dynamic recompiler.
//!
//! The recompiler is an external collaborator: the emulator configures it
//! with a page table for fast memory, a callback surface for everything the
//! page table cannot answer (implemented by [`crate::Bus`]), and an exclusive
//! monitor for LDREX/STREX. The traits here are the seam; a backend adapts a
//! concrete recompiler to [`Core`], and tests substitute a scripted double.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::bus::Bus;

/// log2 of the translator page size.
pub const PAGE_BITS: u32 = 12;
/// Translator page size in bytes.
pub const PAGE_SIZE: u32 = 1 << PAGE_BITS;
/// Number of entries covering the 32-bit guest address space.
pub const NUM_PAGE_ENTRIES: usize = 1 << (32 - PAGE_BITS);

/// ARM core register indices used by the harness.
pub mod regs {
    pub const R0: usize = 0;
    pub const SP: usize = 13;
    pub const LR: usize = 14;
    pub const PC: usize = 15;
}

/// CPSR value selecting Thumb state.
pub const CPSR_THUMB: u32 = 0x0000_0030;

/// Shared fast-path page table: guest page index to host pointer.
///
/// Entries are written only while devices are bound (startup) and read by
/// every core thereafter, so relaxed atomics are sufficient; cross-core
/// visibility of guest data itself is the responsibility of the callers
/// serialising on the master callbacks lock.
pub struct PageTable {
    entries: Box<[AtomicPtr<u8>]>,
}

impl PageTable {
    pub fn new() -> Self {
        let mut entries = Vec::with_capacity(NUM_PAGE_ENTRIES);
        entries.resize_with(NUM_PAGE_ENTRIES, || AtomicPtr::new(std::ptr::null_mut()));
        Self {
            entries: entries.into_boxed_slice(),
        }
    }

    /// Install the host pointer backing guest page `page`.
    pub fn set(&self, page: usize, ptr: *mut u8) {
        if let Some(entry) = self.entries.get(page) {
            entry.store(ptr, Ordering::Relaxed);
        }
    }

    /// Host pointer for guest page `page`, or null when unbacked.
    pub fn get(&self, page: usize) -> *mut u8 {
        self.entries
            .get(page)
            .map_or(std::ptr::null_mut(), |entry| entry.load(Ordering::Relaxed))
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque handle describing the exclusive monitor the backend must create.
///
/// The emulator only chooses the processor count; LDREX/STREX semantics are
/// the backend's business, falling back to [`Bus::write_exclusive32`] when a
/// location is not page-table backed.
pub struct ExclusiveMonitor {
    processors: usize,
}

impl ExclusiveMonitor {
    pub fn new(processors: usize) -> Self {
        Self { processors }
    }

    pub fn processors(&self) -> usize {
        self.processors
    }
}

/// Host function injected into a translated block by a translation hook.
pub type HostCall = Arc<dyn Fn() + Send + Sync>;

/// Handle to the IR under construction for one basic block.
///
/// Passed to translation hooks at lift time. A hook may emit host calls that
/// then execute every time the block runs, or perform its side effect
/// immediately (translation-time, once per lift). Hooks must be idempotent:
/// blocks can be re-translated.
pub trait BlockEmitter {
    /// Emit a call to `call` at the current position in the block.
    fn emit_call(&mut self, call: HostCall);
}

/// Exceptions a core can surface. All are fatal to the emulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreException {
    UndefinedInstruction,
    UnpredictableInstruction,
    Breakpoint,
    Other(u32),
}

/// One ARM32 execution context: register file, CPSR, FPSCR, and a `run`
/// entry that executes translated code until the backend yields.
///
/// A core is exclusively owned by one thread while running (the harness
/// enforces this with per-slot locks); the memory it touches is shared.
pub trait Core: Send {
    fn reg(&self, index: usize) -> u32;
    fn set_reg(&mut self, index: usize, value: u32);

    fn regs(&self) -> [u32; 16];
    fn set_regs(&mut self, regs: &[u32; 16]);

    fn cpsr(&self) -> u32;
    fn set_cpsr(&mut self, value: u32);

    fn fpscr(&self) -> u32;
    fn set_fpscr(&mut self, value: u32);

    /// Execute until the backend's stop condition (end of block batch,
    /// sentinel fetch, interpreter yield). The harness re-invokes in a loop.
    fn run(&mut self);
}

/// Everything a backend needs to construct one core.
pub struct CoreParams {
    /// Memory/hook surface for accesses the page table cannot satisfy.
    pub bus: Arc<Bus>,
    /// Fast-path page table shared by every core of the machine.
    pub page_table: Arc<PageTable>,
    /// Global exclusive monitor shared by every core of the machine.
    pub monitor: Arc<ExclusiveMonitor>,
}

/// Factory for [`Core`] instances; one machine uses a single builder for the
/// primary core and the whole auxiliary pool.
pub trait CoreBuilder: Send + Sync {
    fn build(&self, params: CoreParams) -> Box<dyn Core>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_table_roundtrip() {
        let table = PageTable::new();
        let mut byte = 0u8;
        let ptr: *mut u8 = &mut byte;
        table.set(3, ptr);
        assert_eq!(table.get(3), ptr);
        assert!(table.get(4).is_null());
        // Out-of-range pages read as null rather than panicking.
        assert!(table.get(NUM_PAGE_ENTRIES + 1).is_null());
    }
}

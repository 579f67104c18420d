//! Critical-section instrumentation for firmware helpers.
//!
//! The firmware guards its audio block pool with short helper functions and
//! cpsid/cpsie brackets; on real silicon those are cheap, in the emulator
//! they must become host locks so pool cores and the primary core do not
//! interleave inside them. Translation hooks at each helper's entry emit a
//! host call that acquires a recursive lock, and hooks at every code-exit
//! instruction (or cpsie) emit the release.

use std::sync::Arc;

use parking_lot::lock_api::RawReentrantMutex;
use parking_lot::{RawMutex, RawThreadId};
use tracing::debug;

use emu_core::bus::Bus;

use crate::thumb::{scan_code_exits, scan_markers, Marker};

/// A recursive lock acquired and released from separate instrumentation
/// calls. Recursion is required: the firmware helpers legitimately nest.
pub struct FirmwareLock {
    raw: RawReentrantMutex<RawMutex, RawThreadId>,
}

impl FirmwareLock {
    pub const fn new() -> Self {
        Self {
            raw: RawReentrantMutex::INIT,
        }
    }

    pub fn lock(&self) {
        self.raw.lock();
    }

    pub fn unlock(&self) {
        // SAFETY: releases are emitted only at exits of ranges whose entry
        // emitted the paired acquire, on the same (core) thread.
        unsafe { self.raw.unlock() };
    }
}

impl Default for FirmwareLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Instrument `[entry, end)` as a lock-guarded helper: acquire on entry,
/// release at every code-exit instruction.
pub fn install_range_lock(bus: &Arc<Bus>, entry: u32, end: u32, lock: Arc<FirmwareLock>) {
    let entry = entry & !1;
    let acquire = Arc::clone(&lock);
    bus.add_translation_hook(
        entry,
        Arc::new(move |_, emitter| {
            let lock = Arc::clone(&acquire);
            emitter.emit_call(Arc::new(move || lock.lock()));
        }),
    );

    let exits = scan_code_exits(|addr| bus.read16(addr), entry, end);
    debug!(
        entry = format_args!("{entry:#010x}"),
        exits = exits.len(),
        "installed range lock"
    );
    for exit in exits {
        let release = Arc::clone(&lock);
        bus.add_translation_hook(
            exit,
            Arc::new(move |_, emitter| {
                let lock = Arc::clone(&release);
                emitter.emit_call(Arc::new(move || lock.unlock()));
            }),
        );
    }
}

/// Instrument the cpsid/cpsie brackets inside `[entry, end)`: interrupts-off
/// acquires `lock`, interrupts-on releases it.
pub fn install_irq_bracket_lock(bus: &Arc<Bus>, entry: u32, end: u32, lock: Arc<FirmwareLock>) {
    let markers = scan_markers(|addr| bus.read16(addr), entry & !1, end);
    let mut installed = 0usize;
    for (addr, marker) in markers {
        match marker {
            Marker::InterruptsOff => {
                let acquire = Arc::clone(&lock);
                bus.add_translation_hook(
                    addr,
                    Arc::new(move |_, emitter| {
                        let lock = Arc::clone(&acquire);
                        emitter.emit_call(Arc::new(move || lock.lock()));
                    }),
                );
                installed += 1;
            }
            Marker::InterruptsOn => {
                let release = Arc::clone(&lock);
                bus.add_translation_hook(
                    addr,
                    Arc::new(move |_, emitter| {
                        let lock = Arc::clone(&release);
                        emitter.emit_call(Arc::new(move || lock.unlock()));
                    }),
                );
                installed += 1;
            }
            Marker::Exit => {}
        }
    }
    debug!(
        entry = format_args!("{:#010x}", entry & !1),
        installed, "installed irq bracket lock"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firmware_lock_is_recursive() {
        let lock = FirmwareLock::new();
        lock.lock();
        lock.lock();
        lock.unlock();
        lock.unlock();
    }

    #[test]
    fn firmware_lock_blocks_other_threads() {
        let lock = Arc::new(FirmwareLock::new());
        lock.lock();
        let contender = Arc::clone(&lock);
        let handle = std::thread::spawn(move || {
            contender.lock();
            contender.unlock();
        });
        // Give the contender a chance to block, then release.
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(!handle.is_finished());
        lock.unlock();
        handle.join().expect("contender");
    }
}

//! Flat 32-bit guest address space: device routing, per-address access
//! hooks, the translator page table, and the master callbacks lock.

use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use tracing::{debug, error};

use crate::error::CoreError;
use crate::jit::{BlockEmitter, CoreException, PageTable};

/// A device owning a half-open guest range `[base, base + size)`.
///
/// Implementations are shared between threads; interior mutability is the
/// device's business. Two families exist: memory devices (contiguous buffer,
/// mappable, page-table backed) and register devices (sparse 32-bit
/// registers, never mappable).
pub trait Device: Send + Sync {
    fn base(&self) -> u32;
    fn size(&self) -> u32;

    fn end(&self) -> u32 {
        self.base() + self.size() - 1
    }

    /// Byte-buffer read at `offset` into the device.
    fn read(&self, offset: u32, buf: &mut [u8]);
    /// Byte-buffer write at `offset` into the device.
    fn write(&self, offset: u32, buf: &[u8]);

    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);

    /// Direct host pointer to the byte at `offset`, when the device supports
    /// mapping (memory devices do, register devices do not).
    fn host_ptr(&self, _offset: u32) -> Option<NonNull<u8>> {
        None
    }

    /// Install fast-path page-table entries for this device. Returns whether
    /// any were installed.
    fn publish_pages(&self, _table: &PageTable) -> bool {
        false
    }
}

/// 32-bit read hook: `fn(addr) -> value`.
pub type ReadHook = Arc<dyn Fn(u32) -> u32 + Send + Sync>;
/// 32-bit write hook: `fn(addr, value)`.
pub type WriteHook = Arc<dyn Fn(u32, u32) + Send + Sync>;
/// Translation hook: `fn(pc, emitter)`, called when a basic block starting at
/// `pc` is lifted. Must be idempotent across re-lifts.
pub type TranslationHook = Arc<dyn Fn(u32, &mut dyn BlockEmitter) + Send + Sync>;

/// The guest address space and recompiler callback surface.
///
/// Also owns the master callbacks lock: a recursive mutex held while any
/// core executes on the primary path and by peripherals mutating guest
/// memory from other threads. Recursive because translation hooks and
/// host-call instrumentation re-enter the harness mid-run.
pub struct Bus {
    master: ReentrantMutex<()>,
    /// Devices keyed by both base and end address, so a reverse range lookup
    /// from any interior address lands on the owning device.
    devices: RwLock<BTreeMap<u32, Arc<dyn Device>>>,
    read_hooks: RwLock<HashMap<u32, ReadHook>>,
    write_hooks: RwLock<HashMap<u32, WriteHook>>,
    translation_hooks: RwLock<HashMap<u32, TranslationHook>>,
    page_table: Arc<PageTable>,
}

impl Bus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            master: ReentrantMutex::new(()),
            devices: RwLock::new(BTreeMap::new()),
            read_hooks: RwLock::new(HashMap::new()),
            write_hooks: RwLock::new(HashMap::new()),
            translation_hooks: RwLock::new(HashMap::new()),
            page_table: Arc::new(PageTable::new()),
        })
    }

    /// Acquire the master callbacks lock.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.master.lock()
    }

    pub fn page_table(&self) -> Arc<PageTable> {
        Arc::clone(&self.page_table)
    }

    /// Register a device and publish its pages.
    ///
    /// Overlapping ranges are a configuration error.
    pub fn bind_device(&self, device: Arc<dyn Device>) -> Result<(), CoreError> {
        let (base, end) = (device.base(), device.end());
        let mut devices = self.devices.write();
        let overlaps = devices.range(base..=end).next().is_some()
            || Self::lookup(&devices, base).is_some()
            || Self::lookup(&devices, end).is_some();
        if overlaps {
            return Err(CoreError::DeviceOverlap { base, end });
        }
        device.publish_pages(&self.page_table);
        devices.insert(base, Arc::clone(&device));
        devices.insert(end, device);
        Ok(())
    }

    fn lookup(devices: &BTreeMap<u32, Arc<dyn Device>>, addr: u32) -> Option<Arc<dyn Device>> {
        let (_, device) = devices.range(addr..).next()?;
        if addr >= device.base() && addr <= device.end() {
            Some(Arc::clone(device))
        } else {
            None
        }
    }

    /// Resolve `addr` to its owning device and in-device offset.
    pub fn resolve(&self, addr: u32) -> Option<(Arc<dyn Device>, u32)> {
        let devices = self.devices.read();
        let device = Self::lookup(&devices, addr)?;
        let offset = addr - device.base();
        Some((device, offset))
    }

    pub fn add_read_hook(&self, addr: u32, hook: ReadHook) {
        self.read_hooks.write().insert(addr, hook);
    }

    pub fn add_write_hook(&self, addr: u32, hook: WriteHook) {
        self.write_hooks.write().insert(addr, hook);
    }

    pub fn add_translation_hook(&self, pc: u32, hook: TranslationHook) {
        self.translation_hooks.write().insert(pc, hook);
    }

    /// Dispatch the translation hook for `pc`, if any. Called by the backend
    /// each time it lifts a block's IR.
    pub fn pre_translate(&self, pc: u32, emitter: &mut dyn BlockEmitter) {
        let hook = self.translation_hooks.read().get(&pc).cloned();
        if let Some(hook) = hook {
            hook(pc, emitter);
        }
    }

    /// Byte-buffer read; unmapped ranges fill with zero.
    pub fn read_bytes(&self, addr: u32, buf: &mut [u8]) {
        match self.resolve(addr) {
            Some((device, offset)) => device.read(offset, buf),
            None => {
                debug!(addr = format_args!("{addr:#010x}"), "read of unmapped memory");
                buf.fill(0);
            }
        }
    }

    /// Byte-buffer write; unmapped ranges drop the bytes.
    pub fn write_bytes(&self, addr: u32, buf: &[u8]) {
        match self.resolve(addr) {
            Some((device, offset)) => device.write(offset, buf),
            None => {
                debug!(addr = format_args!("{addr:#010x}"), "write to unmapped memory");
            }
        }
    }

    pub fn read8(&self, addr: u32) -> u8 {
        let mut b = [0u8; 1];
        self.read_bytes(addr, &mut b);
        b[0]
    }

    pub fn read16(&self, addr: u32) -> u16 {
        let mut b = [0u8; 2];
        self.read_bytes(addr, &mut b);
        u16::from_le_bytes(b)
    }

    /// 32-bit read; per-address read hooks take precedence over devices.
    pub fn read32(&self, addr: u32) -> u32 {
        let hook = self.read_hooks.read().get(&addr).cloned();
        if let Some(hook) = hook {
            return hook(addr);
        }
        match self.resolve(addr) {
            Some((device, offset)) => device.read32(offset),
            None => {
                debug!(addr = format_args!("{addr:#010x}"), "read of unmapped memory");
                0
            }
        }
    }

    pub fn read64(&self, addr: u32) -> u64 {
        let mut b = [0u8; 8];
        self.read_bytes(addr, &mut b);
        u64::from_le_bytes(b)
    }

    pub fn write8(&self, addr: u32, value: u8) {
        self.write_bytes(addr, &[value]);
    }

    pub fn write16(&self, addr: u32, value: u16) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    /// 32-bit write; per-address write hooks take precedence over devices.
    pub fn write32(&self, addr: u32, value: u32) {
        let hook = self.write_hooks.read().get(&addr).cloned();
        if let Some(hook) = hook {
            return hook(addr, value);
        }
        match self.resolve(addr) {
            Some((device, offset)) => device.write32(offset, value),
            None => {
                debug!(
                    addr = format_args!("{addr:#010x}"),
                    value = format_args!("{value:#010x}"),
                    "write to unmapped memory"
                );
            }
        }
    }

    pub fn write64(&self, addr: u32, value: u64) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    /// Exclusive 32-bit store: compare-and-exchange at the mapped location.
    /// Failing to map the address fails the exclusive operation.
    pub fn write_exclusive32(&self, addr: u32, value: u32, expected: u32) -> bool {
        let Some(ptr) = self.host_ptr(addr) else {
            return false;
        };
        debug_assert_eq!(addr & 3, 0);
        // SAFETY: the pointer comes from a live memory device covering at
        // least 4 bytes here, and guest exclusives are word-aligned.
        let atomic = unsafe { AtomicU32::from_ptr(ptr.as_ptr().cast()) };
        atomic
            .compare_exchange(expected, value, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Direct host pointer for `addr`, when the owning device supports it.
    pub fn host_ptr(&self, addr: u32) -> Option<NonNull<u8>> {
        let (device, offset) = self.resolve(addr)?;
        device.host_ptr(offset)
    }

    /// Fatal exception reported by a core. Logs and aborts the process.
    pub fn exception_raised(&self, pc: u32, exception: CoreException) -> ! {
        error!(
            pc = format_args!("{pc:#010x}"),
            ?exception,
            "guest raised a fatal exception"
        );
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryDevice;

    #[test]
    fn routes_by_range_and_translates_offsets() {
        let bus = Bus::new();
        bus.bind_device(Arc::new(MemoryDevice::new(0x2000_0000, 0x1000)))
            .expect("bind");
        bus.bind_device(Arc::new(MemoryDevice::new(0x6000_0000, 0x1000)))
            .expect("bind");

        bus.write32(0x2000_0010, 0x1234_5678);
        assert_eq!(bus.read32(0x2000_0010), 0x1234_5678);
        assert_eq!(bus.read32(0x6000_0010), 0);

        // Interior addresses resolve to the single owning device.
        let (device, offset) = bus.resolve(0x2000_0abc).expect("resolve");
        assert_eq!(device.base(), 0x2000_0000);
        assert_eq!(offset, 0xabc);
    }

    #[test]
    fn overlapping_devices_are_rejected() {
        let bus = Bus::new();
        bus.bind_device(Arc::new(MemoryDevice::new(0x1000, 0x1000)))
            .expect("bind");
        for (base, size) in [
            (0x1000u32, 0x1000u32), // identical
            (0x1800, 0x100),        // inside
            (0x0800, 0x1000),       // straddles base
            (0x1f00, 0x1000),       // straddles end
            (0x0000, 0x10000),      // encloses
        ] {
            let result = bus.bind_device(Arc::new(MemoryDevice::new(base, size)));
            assert!(
                matches!(result, Err(CoreError::DeviceOverlap { .. })),
                "{base:#x}+{size:#x} must overlap"
            );
        }
        // Adjacent is fine.
        bus.bind_device(Arc::new(MemoryDevice::new(0x2000, 0x1000)))
            .expect("adjacent bind");
    }

    #[test]
    fn unmapped_reads_zero_and_writes_drop() {
        let bus = Bus::new();
        assert_eq!(bus.read32(0xdead_0000), 0);
        bus.write32(0xdead_0000, 1);
        assert_eq!(bus.read64(0xdead_0000), 0);
        let mut buf = [0xffu8; 3];
        bus.read_bytes(0xdead_0000, &mut buf);
        assert_eq!(buf, [0, 0, 0]);
    }

    #[test]
    fn hooks_shadow_devices() {
        let bus = Bus::new();
        bus.bind_device(Arc::new(MemoryDevice::new(0, 0x1000))).expect("bind");
        bus.write32(0x40, 7);
        bus.add_read_hook(0x40, Arc::new(|_| 0xcafe));
        assert_eq!(bus.read32(0x40), 0xcafe);
        // Other addresses still reach the device.
        assert_eq!(bus.read32(0x44), 0);

        let seen = Arc::new(AtomicU32::new(0));
        let cell = Arc::clone(&seen);
        bus.add_write_hook(
            0x80,
            Arc::new(move |_, value| cell.store(value, Ordering::SeqCst)),
        );
        bus.write32(0x80, 99);
        assert_eq!(seen.load(Ordering::SeqCst), 99);
        // The hooked write did not land in memory.
        let (device, offset) = bus.resolve(0x80).expect("resolve");
        assert_eq!(device.read32(offset), 0);
    }

    #[test]
    fn exclusive_store_requires_expected_value() {
        let bus = Bus::new();
        bus.bind_device(Arc::new(MemoryDevice::new(0, 0x1000))).expect("bind");
        bus.write32(0x100, 5);
        assert!(!bus.write_exclusive32(0x100, 9, 4));
        assert_eq!(bus.read32(0x100), 5);
        assert!(bus.write_exclusive32(0x100, 9, 5));
        assert_eq!(bus.read32(0x100), 9);
        // Unmappable location fails the exclusive.
        assert!(!bus.write_exclusive32(0x9000_0000, 1, 0));
    }

    #[test]
    fn sixteen_and_eight_bit_access() {
        let bus = Bus::new();
        bus.bind_device(Arc::new(MemoryDevice::new(0, 0x100))).expect("bind");
        bus.write16(0x10, 0xbeef);
        assert_eq!(bus.read16(0x10), 0xbeef);
        assert_eq!(bus.read8(0x10), 0xef);
        bus.write8(0x11, 0x12);
        assert_eq!(bus.read16(0x10), 0x12ef);
    }
}

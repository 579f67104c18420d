//! Sparse register devices: a map of word offsets to registers, each
//! assembled from bit fields with read producers and write consumers.
//!
//! A 32-bit read ORs `(read() << offset) & mask` across the fields; a 32-bit
//! write hands `(value & mask) >> offset` to each field's consumer and then
//! fires the whole-register hook, which is where derived behaviour lives
//! (arming a timer, walking a descriptor chain, raising an interrupt).
//! Uncovered bits read as zero and ignore writes.

use std::collections::BTreeMap;
use std::ptr::NonNull;

use parking_lot::Mutex;
use tracing::debug;

use crate::bus::Device;

/// Field read producer.
pub type FieldRead = Box<dyn Fn() -> u32 + Send>;
/// Field write consumer.
pub type FieldWrite = Box<dyn FnMut(u32) + Send>;
/// Whole-register write hook, fired after field distribution.
pub type RegisterWriteHook = Box<dyn FnMut(u32) + Send>;

/// One bit field inside a 32-bit register.
pub struct Field {
    offset: u32,
    length: u32,
    read: FieldRead,
    write: FieldWrite,
}

impl Field {
    fn mask(&self) -> u32 {
        ((!0u32) >> (32 - self.length)) << self.offset
    }
}

/// A 32-bit register at a word offset inside a register device.
pub struct Register {
    addr: u32,
    write_hook: Option<RegisterWriteHook>,
    fields: BTreeMap<&'static str, Field>,
}

impl Register {
    pub fn new(addr: u32) -> Self {
        Self {
            addr,
            write_hook: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    /// Add a field. `offset + length` must stay within the 32-bit word.
    pub fn field(
        mut self,
        name: &'static str,
        offset: u32,
        length: u32,
        read: FieldRead,
        write: FieldWrite,
    ) -> Self {
        debug_assert!(length >= 1 && offset + length <= 32);
        self.fields.insert(
            name,
            Field {
                offset,
                length,
                read,
                write,
            },
        );
        self
    }

    /// Add a field whose writes are discarded.
    pub fn field_ro(self, name: &'static str, offset: u32, length: u32, read: FieldRead) -> Self {
        self.field(name, offset, length, read, Box::new(|_| {}))
    }

    /// Install the whole-register write hook.
    pub fn on_write(mut self, hook: RegisterWriteHook) -> Self {
        self.write_hook = Some(hook);
        self
    }

    pub fn read32(&self) -> u32 {
        let mut value = 0;
        for field in self.fields.values() {
            let mask = field.mask();
            value = (value & !mask) | (((field.read)() << field.offset) & mask);
        }
        value
    }

    pub fn write32(&mut self, value: u32) {
        for field in self.fields.values_mut() {
            let mask = field.mask();
            (field.write)((value & mask) >> field.offset);
        }
        if let Some(hook) = self.write_hook.as_mut() {
            hook(value);
        }
    }
}

/// Offset-keyed collection of registers.
#[derive(Default)]
pub struct RegisterBank {
    registers: BTreeMap<u32, Register>,
}

impl RegisterBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, register: Register) {
        self.registers.insert(register.addr(), register);
    }

    pub fn read32(&self, offset: u32) -> u32 {
        match self.registers.get(&offset) {
            Some(register) => register.read32(),
            None => {
                debug!(offset = format_args!("{offset:#x}"), "read of unknown register");
                0
            }
        }
    }

    pub fn write32(&mut self, offset: u32, value: u32) {
        match self.registers.get_mut(&offset) {
            Some(register) => register.write32(value),
            None => {
                debug!(
                    offset = format_args!("{offset:#x}"),
                    value = format_args!("{value:#x}"),
                    "write to unknown register"
                );
            }
        }
    }
}

/// A [`Device`] backed by a [`RegisterBank`].
///
/// Multi-word accesses decompose into aligned 32-bit operations; register
/// devices never map host pointers.
pub struct RegisterDevice {
    base: u32,
    size: u32,
    bank: Mutex<RegisterBank>,
}

impl RegisterDevice {
    pub fn new(base: u32, size: u32, bank: RegisterBank) -> Self {
        Self {
            base,
            size,
            bank: Mutex::new(bank),
        }
    }

    pub fn bank(&self) -> &Mutex<RegisterBank> {
        &self.bank
    }
}

impl Device for RegisterDevice {
    fn base(&self) -> u32 {
        self.base
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn read(&self, offset: u32, buf: &mut [u8]) {
        let bank = self.bank.lock();
        for (i, chunk) in buf.chunks_mut(4).enumerate() {
            let word = bank.read32(offset + 4 * i as u32);
            let bytes = word.to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn write(&self, offset: u32, buf: &[u8]) {
        let mut bank = self.bank.lock();
        for (i, chunk) in buf.chunks(4).enumerate() {
            let mut bytes = [0u8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            bank.write32(offset + 4 * i as u32, u32::from_le_bytes(bytes));
        }
    }

    fn read32(&self, offset: u32) -> u32 {
        self.bank.lock().read32(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        self.bank.lock().write32(offset, value);
    }

    fn host_ptr(&self, _offset: u32) -> Option<NonNull<u8>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn scratch_field(cell: &Arc<AtomicU32>) -> (FieldRead, FieldWrite) {
        let read_cell = Arc::clone(cell);
        let write_cell = Arc::clone(cell);
        (
            Box::new(move || read_cell.load(Ordering::SeqCst)),
            Box::new(move |v| write_cell.store(v, Ordering::SeqCst)),
        )
    }

    #[test]
    fn fields_assemble_and_distribute() {
        let low = Arc::new(AtomicU32::new(0));
        let high = Arc::new(AtomicU32::new(0));
        let (low_r, low_w) = scratch_field(&low);
        let (high_r, high_w) = scratch_field(&high);
        let mut reg = Register::new(0x10)
            .field("LOW", 0, 8, low_r, low_w)
            .field("HIGH", 24, 8, high_r, high_w);

        reg.write32(0xab00_12cd);
        assert_eq!(low.load(Ordering::SeqCst), 0xcd);
        assert_eq!(high.load(Ordering::SeqCst), 0xab);
        // Uncovered bits read back as zero.
        assert_eq!(reg.read32(), 0xab00_00cd);
    }

    #[test]
    fn write_hook_fires_after_fields() {
        let field_value = Arc::new(AtomicU32::new(0));
        let seen_by_hook = Arc::new(AtomicU32::new(0));
        let (read, write) = scratch_field(&field_value);
        let hook_field = Arc::clone(&field_value);
        let hook_seen = Arc::clone(&seen_by_hook);
        let mut reg = Register::new(0)
            .field("V", 0, 16, read, write)
            .on_write(Box::new(move |raw| {
                // The field consumer must already have run.
                assert_eq!(hook_field.load(Ordering::SeqCst), raw & 0xffff);
                hook_seen.store(raw, Ordering::SeqCst);
            }));
        reg.write32(0x9_1234);
        assert_eq!(seen_by_hook.load(Ordering::SeqCst), 0x9_1234);
    }

    #[test]
    fn fully_covered_register_reads_back_writes() {
        let value = Arc::new(AtomicU32::new(0));
        let (read, write) = scratch_field(&value);
        let mut reg = Register::new(0).field("ALL", 0, 32, read, write);
        for pattern in [0u32, 1, 0xffff_ffff, 0x8000_0001, 0x1234_5678] {
            reg.write32(pattern);
            assert_eq!(reg.read32(), pattern);
        }
    }

    #[test]
    fn unknown_offsets_read_zero_and_ignore_writes() {
        let device = RegisterDevice::new(0x4000_0000, 0x1000, RegisterBank::new());
        device.write32(0x40, 0x1234);
        assert_eq!(device.read32(0x40), 0);
    }

    #[test]
    fn multiword_access_decomposes() {
        let a = Arc::new(AtomicU32::new(0));
        let b = Arc::new(AtomicU32::new(0));
        let mut bank = RegisterBank::new();
        let (ar, aw) = scratch_field(&a);
        let (br, bw) = scratch_field(&b);
        bank.bind(Register::new(0x0).field("V", 0, 32, ar, aw));
        bank.bind(Register::new(0x4).field("V", 0, 32, br, bw));
        let device = RegisterDevice::new(0, 0x100, bank);

        let mut words = [0u8; 8];
        words[..4].copy_from_slice(&0x1111_2222u32.to_le_bytes());
        words[4..].copy_from_slice(&0x3333_4444u32.to_le_bytes());
        device.write(0, &words);
        assert_eq!(a.load(Ordering::SeqCst), 0x1111_2222);
        assert_eq!(b.load(Ordering::SeqCst), 0x3333_4444);

        let mut out = [0u8; 8];
        device.read(0, &mut out);
        assert_eq!(out, words);
    }
}

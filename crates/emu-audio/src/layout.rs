//! Descriptor-driven byte layouts of the firmware's audio structures.
//!
//! Firmware builds differ in how the stream object is laid out (the
//! "classic" arrangement and an alternate one with the destination list at a
//! different slot). Rather than hard-coding one, every offset the scheduler
//! dereferences comes from the firmware descriptor, with defaults matching
//! the classic arrangement.

use serde::Deserialize;

use emu_core::descriptor::FirmwareDescriptor;
use emu_core::error::CoreError;

/// Byte offsets inside a stream (pipeline node) object.
///
/// The vtable pointer is always at offset 0 and its first slot is the
/// node's update function.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct StreamLayout {
    /// Active flag (one byte, non-zero when the node participates).
    pub active: u32,
    /// Head of the outgoing connection list, classic arrangement.
    pub dest_classic: u32,
    /// Head of the outgoing connection list, alternate arrangement.
    pub dest_alt: u32,
    /// Next node in the firmware's update order.
    pub next_update: u32,
}

impl Default for StreamLayout {
    fn default() -> Self {
        Self {
            active: 4,
            dest_classic: 8,
            dest_alt: 12,
            next_update: 16,
        }
    }
}

/// Byte offsets inside a connection record.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ConnectionLayout {
    /// Source node pointer.
    pub src: u32,
    /// Destination node pointer.
    pub dst: u32,
    /// Source output index (one byte).
    pub src_index: u32,
    /// Destination input index (one byte).
    pub dst_index: u32,
    /// Next connection sharing the same source.
    pub next: u32,
}

impl Default for ConnectionLayout {
    fn default() -> Self {
        Self {
            src: 0,
            dst: 4,
            src_index: 8,
            dst_index: 9,
            next: 12,
        }
    }
}

/// Scheduler configuration, assembled from the firmware descriptor.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Worker threads executing pipeline updates; 0 selects the serial
    /// software-interrupt fallback.
    pub workers: usize,
    /// IRQ whose vector is the firmware's block-serial update entry.
    pub software_irq: u32,
    /// Skip the master callbacks lock around each tick and rely on the
    /// installed per-range firmware locks instead.
    pub fine_grained_lock: bool,
    /// Samples per tick.
    pub block_samples: u32,
    /// Emulated sample rate in Hz.
    pub sample_rate: u32,
    pub stream_layout: StreamLayout,
    pub connection_layout: ConnectionLayout,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            workers: 6,
            software_irq: 70 + 16,
            fine_grained_lock: false,
            block_samples: 64,
            sample_rate: 44_100,
            stream_layout: StreamLayout::default(),
            connection_layout: ConnectionLayout::default(),
        }
    }
}

impl AudioConfig {
    /// Read the scheduler knobs out of a firmware descriptor; absent keys
    /// keep their defaults.
    pub fn from_descriptor(descriptor: &FirmwareDescriptor) -> Result<Self, CoreError> {
        let mut config = Self::default();
        if let Some(workers) = descriptor.config_u32("audio_workers")? {
            config.workers = workers as usize;
        }
        if let Some(irq) = descriptor.config_u32("software_irq")? {
            config.software_irq = irq;
        }
        if let Some(flag) = descriptor.config_bool("fine_grained_lock")? {
            config.fine_grained_lock = flag;
        }
        if let Some(samples) = descriptor.config_u32("audio_block_samples")? {
            config.block_samples = samples;
        }
        if let Some(rate) = descriptor.config_u32("audio_sample_rate")? {
            config.sample_rate = rate;
        }
        if let Some(layout) = descriptor.config::<StreamLayout>("stream_layout")? {
            config.stream_layout = layout;
        }
        if let Some(layout) = descriptor.config::<ConnectionLayout>("connection_layout")? {
            config.connection_layout = layout;
        }
        Ok(config)
    }

    /// Tick period: one audio block at the emulated sample rate.
    pub fn tick_period(&self) -> std::time::Duration {
        let micros = u64::from(self.block_samples) * 1_000_000 / u64::from(self.sample_rate);
        std::time::Duration::from_micros(micros)
    }
}

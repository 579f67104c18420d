//! Machine assembly: the default guest memory map, peripheral wiring,
//! firmware loading, and boot sequencing.
//!
//! A [`Machine`] owns the bus, the CPU harness, and the three peripheral
//! subsystems. The caller supplies the recompiler backend through
//! [`emu_core::jit::CoreBuilder`]; everything else here is fixed by the
//! target hardware's memory map and interrupt numbers.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use emu_audio::{AudioConfig, AudioProcessor};
use emu_core::bus::{Bus, Device};
use emu_core::cpu::{CpuHarness, HarnessConfig};
use emu_core::descriptor::FirmwareDescriptor;
use emu_core::error::CoreError;
use emu_core::jit::CoreBuilder;
use emu_core::mem::MemoryDevice;
use emu_sdhc::{SdCard, SdCardError, UsdhcController};
use emu_usb::controller::UsbDeviceOps;
use emu_usb::{UsbController, UsbipServer};

// Guest physical map.
const ITCM_BASE: u32 = 0x0000_0000;
const ITCM_SIZE: u32 = 512 * 1024;
const DTCM_BASE: u32 = 0x2000_0000;
const DTCM_SIZE: u32 = 512 * 1024;
const OCRAM2_BASE: u32 = 0x2020_0000;
const OCRAM2_SIZE: u32 = 512 * 1024;
const FLASH_BASE: u32 = 0x6000_0000;
const FLASH_SIZE: u32 = 16 * 1024 * 1024;
const USB_BASE: u32 = 0x402e_0000;
const USB_SIZE: u32 = 0x4000;
const USDHC1_BASE: u32 = 0x402c_0000;
const USDHC1_SIZE: u32 = 0x4000;

// Host-side scratch: auxiliary-core stacks and audio workspace.
const JIT_POOL_SIZE: usize = 6;
const JIT_MEM_SIZE: u32 = 8 * 1024;
const AUDIO_MEM_SIZE: u32 = 256 * 1024;
const EXTRA_MEM_BASE: u32 = 0xb000_0000;
const EXTRA_MEM_SIZE: u32 = (JIT_POOL_SIZE as u32 + 1) * JIT_MEM_SIZE + AUDIO_MEM_SIZE;
const JIT_MEM_BASE: u32 = EXTRA_MEM_BASE + AUDIO_MEM_SIZE;

const SYSTICK_IRQ: u32 = 15;
const USB_IRQ: u32 = 113 + 16;
const USDHC1_IRQ: u32 = 110 + 16;

/// The 32-bit word at this flash address holds the firmware entry PC.
const HEX_ENTRY: u32 = 0x6000_1004;

const SNVS_LPCR: u32 = 0x400d_4038;

/// Hardware-status registers the firmware polls during init; each reads as
/// its "done" value so the polling loops terminate immediately.
const MAGIC_STATUS_VALUES: &[(u32, u32)] = &[
    (0x400d_8010, 0x8000_3040), // USB PLL locked
    (0x4008_0000, 1 << 31),     // DCDC regulator OK
    (0x400d_8000, 1 << 31),     // ARM PLL locked
    (0x402a_4014, 1 << 0),      // FlexSPI command done
    (0x402a_8014, 1 << 0),      // FlexSPI2 command done
    (0x400d_8070, 1 << 31),     // audio PLL locked
    (0x400c_4020, 1 << 0),      // ADC1 conversion complete
    (0x400c_8020, 1 << 0),      // ADC2 conversion complete
];

#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("firmware image: {0}")]
    Io(#[from] std::io::Error),
    #[error("firmware image: {0}")]
    Hex(String),
    #[error(transparent)]
    SdCard(#[from] SdCardError),
    #[error("descriptor file: {0}")]
    DescriptorFormat(String),
    #[error("descriptor has no entry for firmware `{0}`")]
    UnknownFirmware(String),
}

/// Knobs the CLI exposes.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub usbip_port: u16,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            usbip_port: emu_usb::usbip::server::USBIP_PORT,
        }
    }
}

/// The assembled emulated instrument.
pub struct Machine {
    bus: Arc<Bus>,
    harness: Arc<CpuHarness>,
    usb: Arc<UsbController>,
    sdhc: Arc<UsdhcController>,
    audio: Arc<AudioProcessor>,
}

impl Machine {
    /// Build the machine: memory map, peripherals, harness, hooks.
    pub fn new(
        builder: &dyn CoreBuilder,
        descriptor: &FirmwareDescriptor,
        config: MachineConfig,
    ) -> Result<Self, MachineError> {
        let bus = Bus::new();
        for (base, size) in [
            (ITCM_BASE, ITCM_SIZE),
            (DTCM_BASE, DTCM_SIZE),
            (OCRAM2_BASE, OCRAM2_SIZE),
            (FLASH_BASE, FLASH_SIZE),
            (EXTRA_MEM_BASE, EXTRA_MEM_SIZE),
        ] {
            bus.bind_device(Arc::new(MemoryDevice::new(base, size)))?;
        }

        let usb = UsbController::new(Arc::clone(&bus), USB_BASE, USB_SIZE);
        let usb_dev: Arc<dyn Device> = usb.clone();
        bus.bind_device(usb_dev)?;
        let sdhc = UsdhcController::new(Arc::clone(&bus), USDHC1_BASE, USDHC1_SIZE);
        let sdhc_dev: Arc<dyn Device> = sdhc.clone();
        bus.bind_device(sdhc_dev)?;

        install_status_hooks(&bus);

        let harness = CpuHarness::new(
            Arc::clone(&bus),
            builder,
            HarnessConfig {
                pool_size: JIT_POOL_SIZE,
                pool_stack_base: JIT_MEM_BASE,
                pool_stack_size: JIT_MEM_SIZE,
                systick_irq: SYSTICK_IRQ,
            },
        );

        let usb_irq = Arc::clone(&harness);
        usb.bind_interrupt(Box::new(move || usb_irq.trigger_interrupt(USB_IRQ)));
        let sdhc_irq = Arc::clone(&harness);
        sdhc.bind_interrupt(Box::new(move || sdhc_irq.trigger_interrupt(USDHC1_IRQ)));

        let audio_config = AudioConfig::from_descriptor(descriptor)?;
        let first_update = if audio_config.workers > 0 {
            descriptor.symbol("first_update")?
        } else {
            0
        };
        let audio = AudioProcessor::new(Arc::clone(&harness), audio_config, first_update);

        // Once the firmware reaches its setup-done point, bring up the
        // scheduler and the USB/IP bridge.
        let setup_done = descriptor.symbol("setup_done")?;
        let audio_start = Arc::clone(&audio);
        let usb_ops: Arc<dyn UsbDeviceOps> = usb.clone();
        let port = config.usbip_port;
        harness.attach_initialize_callback(Box::new(move || {
            audio_start.start();
            match UsbipServer::new(Arc::clone(&usb_ops), port).start() {
                Ok(handle) => info!(addr = %handle.local_addr(), "usbip bridge up"),
                Err(err) => error!(%err, "usbip bridge failed to start"),
            }
        }));
        harness.arm_initialize_hook(setup_done);

        Ok(Self {
            bus,
            harness,
            usb,
            sdhc,
            audio,
        })
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn harness(&self) -> &Arc<CpuHarness> {
        &self.harness
    }

    pub fn usb(&self) -> &Arc<UsbController> {
        &self.usb
    }

    pub fn audio(&self) -> &Arc<AudioProcessor> {
        &self.audio
    }

    /// Parse an Intel-HEX image into guest memory and point the primary
    /// core at the entry PC stored in flash.
    pub fn load_hex(&self, path: impl AsRef<Path>) -> Result<(), MachineError> {
        let text = std::fs::read_to_string(&path)?;
        let mut linear_base = 0u32;
        let mut segment_base = 0u32;
        let mut bytes = 0usize;
        for record in ihex::Reader::new(&text) {
            let record = record.map_err(|err| MachineError::Hex(err.to_string()))?;
            match record {
                ihex::Record::Data { offset, value } => {
                    let addr = linear_base
                        .wrapping_add(segment_base)
                        .wrapping_add(u32::from(offset));
                    bytes += value.len();
                    self.bus.write_bytes(addr, &value);
                }
                ihex::Record::ExtendedLinearAddress(upper) => {
                    linear_base = u32::from(upper) << 16;
                }
                ihex::Record::ExtendedSegmentAddress(segment) => {
                    segment_base = u32::from(segment) << 4;
                }
                ihex::Record::EndOfFile
                | ihex::Record::StartSegmentAddress { .. }
                | ihex::Record::StartLinearAddress(_) => {}
            }
        }

        let entry = self.bus.read32(HEX_ENTRY);
        self.harness.set_entry(entry);
        info!(
            bytes,
            entry = format_args!("{entry:#010x}"),
            "firmware image loaded"
        );
        Ok(())
    }

    /// Install the firmware lock instrumentation named by the descriptor.
    /// Must run after [`Machine::load_hex`]; the hooks scan guest code.
    pub fn install_firmware_hooks(
        &self,
        descriptor: &FirmwareDescriptor,
    ) -> Result<(), MachineError> {
        self.audio.install_lock_hooks(descriptor)?;
        Ok(())
    }

    /// Attach the SD card image.
    pub fn insert_sd_card(&self, path: impl AsRef<Path>) -> Result<(), MachineError> {
        let card = SdCard::open(path)?;
        self.sdhc.insert_card(Arc::new(card));
        Ok(())
    }

    /// Drive the primary core forever.
    pub fn run(&self) -> ! {
        loop {
            self.harness.run();
        }
    }
}

/// Magic-value read hooks plus the SNVS low-power control scratch register.
fn install_status_hooks(bus: &Arc<Bus>) {
    for (addr, value) in MAGIC_STATUS_VALUES {
        let value = *value;
        bus.add_read_hook(*addr, Arc::new(move |_| value));
    }

    let snvs = Arc::new(AtomicU32::new(0));
    let snvs_read = Arc::clone(&snvs);
    bus.add_read_hook(SNVS_LPCR, Arc::new(move |_| snvs_read.load(Ordering::Relaxed)));
    let snvs_write = Arc::clone(&snvs);
    bus.add_write_hook(
        SNVS_LPCR,
        Arc::new(move |_, value| snvs_write.store(value, Ordering::Relaxed)),
    );
}

/// Load a descriptor file: a JSON map keyed by firmware image name.
pub fn load_descriptor(
    path: impl AsRef<Path>,
    firmware: impl AsRef<Path>,
) -> Result<FirmwareDescriptor, MachineError> {
    let text = std::fs::read_to_string(&path)?;
    let mut map: BTreeMap<String, FirmwareDescriptor> = serde_json::from_str(&text)
        .map_err(|err| MachineError::DescriptorFormat(err.to_string()))?;
    let name = firmware
        .as_ref()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    map.remove(&name)
        .ok_or(MachineError::UnknownFirmware(name))
}

//! Boot-path behaviour: image loading, descriptor resolution, status
//! hooks, and peripheral interrupt wiring.

use std::io::Write as _;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use emu_core::bus::Device as _;
use emu_core::jit::BlockEmitter;
use emu_machine::{load_descriptor, Machine, MachineConfig, MachineError};
use emu_testing::ScriptedCoreBuilder;
use emu_usb::controller::{SetupBytes, UsbDeviceOps as _};

const ENTRY: u32 = 0x6000_2001;
const SETUP_DONE: u32 = 0x6000_3000;

fn descriptor() -> emu_core::descriptor::FirmwareDescriptor {
    serde_json::from_str(&format!(
        r#"{{
            "symbols": {{ "setup_done": {SETUP_DONE} }},
            "configs": {{ "audio_workers": 0 }}
        }}"#
    ))
    .expect("descriptor")
}

fn hex_image() -> tempfile::NamedTempFile {
    let mut entry_word = vec![0u8; 8];
    entry_word[4..8].copy_from_slice(&ENTRY.to_le_bytes());
    let records = vec![
        ihex::Record::ExtendedLinearAddress(0x6000),
        ihex::Record::Data {
            offset: 0x1000,
            value: entry_word,
        },
        ihex::Record::Data {
            offset: 0x2000,
            value: vec![0x70, 0x47], // bx lr
        },
        ihex::Record::EndOfFile,
    ];
    let text = ihex::create_object_file_representation(&records).expect("hex");
    let mut file = tempfile::NamedTempFile::new().expect("hex file");
    file.write_all(text.as_bytes()).expect("hex write");
    file
}

fn sd_image() -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().expect("sd file");
    file.as_file().set_len(1024 * 1024).expect("size");
    file
}

#[test]
fn boot_loads_firmware_and_starts_at_the_hex_entry() {
    let first_pc = Arc::new(AtomicU32::new(u32::MAX));
    let seen = Arc::clone(&first_pc);
    let builder = ScriptedCoreBuilder::new(Arc::new(move |state, _| {
        let _ = seen.compare_exchange(
            u32::MAX,
            state.pc(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        state.set_pc(0);
    }));

    let machine = Machine::new(&builder, &descriptor(), MachineConfig { usbip_port: 0 })
        .expect("machine");
    machine.load_hex(hex_image().path()).expect("hex");
    machine.insert_sd_card(sd_image().path()).expect("sd");

    // The entry word was lifted out of flash.
    assert_eq!(machine.bus().read32(0x6000_1004), ENTRY);
    assert_eq!(machine.bus().read16(0x6000_2000), 0x4770);

    machine.harness().run();
    assert_eq!(first_pc.load(Ordering::SeqCst), ENTRY);
}

#[test]
fn status_registers_read_their_done_values() {
    let machine = Machine::new(
        &ScriptedCoreBuilder::halting(),
        &descriptor(),
        MachineConfig::default(),
    )
    .expect("machine");
    let bus = machine.bus();

    assert_eq!(bus.read32(0x400d_8000), 1 << 31, "ARM PLL locked");
    assert_eq!(bus.read32(0x400d_8010), 0x8000_3040, "USB PLL");
    assert_eq!(bus.read32(0x400c_4020), 1, "ADC conversion complete");

    // SNVS scratch register holds writes.
    bus.write32(0x400d_4038, 0x2024);
    assert_eq!(bus.read32(0x400d_4038), 0x2024);
}

#[test]
fn usb_controller_interrupt_reaches_the_harness() {
    let machine = Machine::new(
        &ScriptedCoreBuilder::halting(),
        &descriptor(),
        MachineConfig::default(),
    )
    .expect("machine");

    // Give endpoint 0 a queue head to write into.
    machine.usb().write32(0x158, 0x2000_4000);
    assert_eq!(machine.harness().pending_interrupts(), 0);
    machine.usb().handle_setup_packet(
        SetupBytes::from_bytes(&[0x80, 0x06, 0, 1, 0, 0, 0x12, 0]),
        &[],
        Box::new(|_| {}),
    );
    assert_eq!(machine.harness().pending_interrupts(), 1);
}

struct NullEmitter;

impl BlockEmitter for NullEmitter {
    fn emit_call(&mut self, _call: emu_core::jit::HostCall) {}
}

#[test]
fn reaching_setup_done_brings_the_subsystems_up_once() {
    let machine = Machine::new(
        &ScriptedCoreBuilder::halting(),
        &descriptor(),
        MachineConfig { usbip_port: 0 },
    )
    .expect("machine");

    // Lifting the setup-done block (twice, as re-translation would) starts
    // the audio timer and the bridge exactly once.
    machine.bus().pre_translate(SETUP_DONE, &mut NullEmitter);
    machine.bus().pre_translate(SETUP_DONE, &mut NullEmitter);

    machine.audio().shutdown();
}

#[test]
fn descriptor_lookup_is_keyed_by_image_name() {
    let mut file = tempfile::NamedTempFile::new().expect("descriptor file");
    file.write_all(
        br#"{ "fw.hex": { "symbols": { "setup_done": 1 }, "configs": {} } }"#,
    )
    .expect("write");

    let descriptor = load_descriptor(file.path(), "some/dir/fw.hex").expect("hit");
    assert_eq!(descriptor.symbol("setup_done").expect("symbol"), 1);

    let miss = load_descriptor(file.path(), "other.hex");
    assert!(matches!(miss, Err(MachineError::UnknownFirmware(name)) if name == "other.hex"));
}

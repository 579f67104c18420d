//! USDHC register-level scenarios against a real image file.

use std::io::Write as _;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use emu_core::bus::{Bus, Device};
use emu_core::mem::MemoryDevice;
use emu_sdhc::card::SdCard;
use emu_sdhc::usdhc::UsdhcController;

const RAM_BASE: u32 = 0x2000_0000;
const SDHC_BASE: u32 = 0x402c_0000;

const DS_ADDR: u32 = 0x00;
const BLK_ATT: u32 = 0x04;
const CMD_ARG: u32 = 0x08;
const CMD_XFR_TYP: u32 = 0x0c;
const CMD_RSP0: u32 = 0x10;
const DATA_BUFF_ACC_PORT: u32 = 0x20;
const PRES_STATE: u32 = 0x24;
const INT_STATUS: u32 = 0x30;
const MIX_CTRL: u32 = 0x48;

fn image() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp image");
    let block: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
    file.write_all(&block).expect("first block");
    file.as_file().set_len(4 * 1024 * 1024).expect("size");
    file
}

fn setup() -> (Arc<Bus>, Arc<UsdhcController>, Arc<AtomicU32>, tempfile::NamedTempFile) {
    let bus = Bus::new();
    bus.bind_device(Arc::new(MemoryDevice::new(RAM_BASE, 512 * 1024)))
        .expect("ram");
    let sdhc = UsdhcController::new(Arc::clone(&bus), SDHC_BASE, 0x4000);
    let irqs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&irqs);
    sdhc.bind_interrupt(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let img = image();
    let card = SdCard::open(img.path()).expect("card");
    sdhc.insert_card(Arc::new(card));
    (bus, sdhc, irqs, img)
}

fn wait_for_tc(sdhc: &UsdhcController) {
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        if sdhc.read32(INT_STATUS) & 2 != 0 {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("transfer-complete never arrived");
}

#[test]
fn dma_block_read_lands_in_guest_memory() {
    let (bus, sdhc, irqs, _img) = setup();

    sdhc.write32(DS_ADDR, RAM_BASE + 0x1_0000);
    sdhc.write32(BLK_ATT, (1 << 16) | 512);
    sdhc.write32(CMD_ARG, 0);
    sdhc.write32(MIX_CTRL, (1 << 4) | 1); // DMA enable, card-to-memory
    sdhc.write32(CMD_XFR_TYP, (17 << 24) | (1 << 21)); // READ_SINGLE_BLOCK, data

    // Command completion is immediate.
    assert_eq!(sdhc.read32(INT_STATUS) & 1, 1, "CC set");

    wait_for_tc(&sdhc);
    assert!(irqs.load(Ordering::SeqCst) >= 1, "sdhc irq fired");

    let mut block = vec![0u8; 512];
    bus.read_bytes(RAM_BASE + 0x1_0000, &mut block);
    let expected: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(block, expected);

    // Block count self-clears after the transfer.
    assert_eq!(sdhc.read32(BLK_ATT) >> 16, 0);

    // W1C on both status bits.
    sdhc.write32(INT_STATUS, 3);
    assert_eq!(sdhc.read32(INT_STATUS) & 3, 0);
}

#[test]
fn dma_block_write_reaches_the_image() {
    let (bus, sdhc, _irqs, img) = setup();

    let payload: Vec<u8> = (0..512u32).map(|i| ((i * 7) % 256) as u8).collect();
    bus.write_bytes(RAM_BASE + 0x2_0000, &payload);

    sdhc.write32(DS_ADDR, RAM_BASE + 0x2_0000);
    sdhc.write32(BLK_ATT, (1 << 16) | 512);
    sdhc.write32(CMD_ARG, 2); // block 2
    sdhc.write32(MIX_CTRL, 1); // DMA enable, memory-to-card
    sdhc.write32(CMD_XFR_TYP, (24 << 24) | (1 << 21)); // WRITE_BLOCK, data

    wait_for_tc(&sdhc);

    let written = std::fs::read(img.path()).expect("image");
    assert_eq!(&written[1024..1536], payload.as_slice());
}

#[test]
fn command_without_data_leaves_dma_idle() {
    let (_bus, sdhc, _irqs, _img) = setup();

    sdhc.write32(CMD_ARG, 0x1aa);
    sdhc.write32(CMD_XFR_TYP, 8 << 24); // SEND_IF_COND, no data phase

    assert_eq!(sdhc.read32(INT_STATUS) & 1, 1, "CC set");
    assert_eq!(sdhc.read32(CMD_RSP0), 0x1aa, "R7 echoes the pattern");

    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(sdhc.read32(INT_STATUS) & 2, 0, "no transfer completes");
}

#[test]
fn pio_port_streams_words() {
    let (_bus, sdhc, _irqs, _img) = setup();

    sdhc.write32(CMD_ARG, 0);
    sdhc.write32(CMD_XFR_TYP, 17 << 24); // seek to block 0, PIO path

    let word = sdhc.read32(DATA_BUFF_ACC_PORT);
    assert_eq!(word.to_le_bytes(), [0, 1, 2, 3]);
    let word = sdhc.read32(DATA_BUFF_ACC_PORT);
    assert_eq!(word.to_le_bytes(), [4, 5, 6, 7]);
    assert_eq!(sdhc.read32(INT_STATUS) & 2, 2, "TC via PIO");
}

#[test]
fn present_state_reports_card_and_lines() {
    let (_bus, sdhc, _irqs, _img) = setup();
    let present = sdhc.read32(PRES_STATE);
    assert_eq!(present & (1 << 16), 1 << 16, "card inserted");
    assert_eq!(present & (1 << 3), 1 << 3, "clock stable");
    assert_eq!((present >> 24) & 0xff, 7, "data lines");
}

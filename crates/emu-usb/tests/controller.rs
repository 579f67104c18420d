//! Controller behaviour driven the way firmware and the bridge drive it:
//! register writes on one side, `UsbDeviceOps` on the other, with queue
//! heads and transfer descriptors living in guest RAM.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use emu_core::bus::{Bus, Device};
use emu_core::mem::MemoryDevice;
use emu_usb::controller::{SetupBytes, UsbController, UsbDeviceOps, ENDPOINT_BUFFER_SIZE};

const USB_BASE: u32 = 0x402e_0000;
const RAM_BASE: u32 = 0x2000_0000;

const USBSTS: u32 = 0x144;
const ENDPTLISTADDR: u32 = 0x158;
const ENDPTSETUPSTAT: u32 = 0x1ac;
const ENDPTPRIME: u32 = 0x1b0;
const ENDPTCOMPLETE: u32 = 0x1bc;
const ENDPTCTRL0: u32 = 0x1c0;

const LIST: u32 = RAM_BASE + 0x1000;
const TD0: u32 = RAM_BASE + 0x2000;
const BUF0: u32 = RAM_BASE + 0x3000;

fn setup() -> (Arc<Bus>, Arc<UsbController>, Arc<AtomicU32>) {
    let bus = Bus::new();
    bus.bind_device(Arc::new(MemoryDevice::new(RAM_BASE, 512 * 1024)))
        .expect("ram");
    let usb = UsbController::new(Arc::clone(&bus), USB_BASE, 0x4000);
    let irqs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&irqs);
    usb.bind_interrupt(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    usb.write32(ENDPTLISTADDR, LIST);
    (bus, usb, irqs)
}

/// Park one active TD at `td`, pointing at `buf`, and link it into the
/// endpoint's queue head.
fn install_td(bus: &Bus, ep: u32, tx: bool, td: u32, buf: u32, total: u16) {
    let qh = LIST + (2 * ep + u32::from(tx)) * 64;
    bus.write32(qh + 8, td); // next descriptor
    bus.write32(td, 1); // terminate bit: end of chain
    bus.write32(td + 4, (u32::from(total) << 16) | 0x80); // active, total bytes
    bus.write32(td + 8, buf);
}

#[test]
fn setup_packet_reaches_queue_head_and_fires_irq() {
    let (bus, usb, irqs) = setup();
    let setup = SetupBytes::from_bytes(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);

    let (reply_tx, reply_rx) = mpsc::channel();
    usb.handle_setup_packet(
        setup,
        &[],
        Box::new(move |data| {
            reply_tx.send(data.to_vec()).expect("reply channel");
        }),
    );

    // Setup bytes land in endpoint 0's queue head; status bits announce it.
    assert_eq!(bus.read32(LIST + 40), setup.bytes0);
    assert_eq!(bus.read32(LIST + 44), setup.bytes1);
    assert_eq!(usb.read32(ENDPTSETUPSTAT) & 1, 1);
    let sts = usb.read32(USBSTS);
    assert_eq!(sts & 1, 1, "UI set");
    assert_eq!(sts & 4, 4, "PCI set");
    assert!(irqs.load(Ordering::SeqCst) >= 1);

    // Firmware answers: 18 descriptor bytes through an EP0 TX descriptor.
    let descriptor: Vec<u8> = (0..18u8).collect();
    bus.write_bytes(BUF0, &descriptor);
    install_td(&bus, 0, true, TD0, BUF0, 18);
    usb.write32(ENDPTPRIME, 1 << 16);

    let reply = reply_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("completion");
    assert_eq!(reply, descriptor);

    // The descriptor was retired.
    assert_eq!(bus.read32(TD0 + 4) & 0xff, 0, "status cleared");
    assert_eq!(bus.read32(TD0 + 4) >> 16, 0, "total cleared");

    // W1C on the setup status bit.
    usb.write32(ENDPTSETUPSTAT, 1);
    assert_eq!(usb.read32(ENDPTSETUPSTAT) & 1, 0);
}

#[test]
fn setup_out_data_is_consumed_by_rx_prime() {
    let (bus, usb, _irqs) = setup();
    let payload = [0xa0u8, 0xa1, 0xa2, 0xa3];
    usb.handle_setup_packet(
        SetupBytes::from_bytes(&[0x21, 0x09, 0, 0, 0, 0, 4, 0]),
        &payload,
        Box::new(|_| {}),
    );

    install_td(&bus, 0, false, TD0, BUF0, 4);
    usb.write32(ENDPTPRIME, 1);

    let mut landed = [0u8; 4];
    bus.read_bytes(BUF0, &mut landed);
    assert_eq!(landed, payload);
}

#[test]
fn bulk_read_drains_fifo_synchronously() {
    let (bus, usb, irqs) = setup();
    usb.write32(ENDPTCTRL0 + 4 * 2, 2 << 18); // EP2 TX bulk

    let pattern: Vec<u8> = (0..200u8).collect();
    bus.write_bytes(BUF0, &pattern);
    install_td(&bus, 2, true, TD0, BUF0, 200);
    usb.write32(ENDPTPRIME, 1 << (16 + 2));

    irqs.store(0, Ordering::SeqCst);
    let (reply_tx, reply_rx) = mpsc::channel();
    usb.handle_data_read(
        2,
        0,
        64,
        Box::new(move |data| {
            reply_tx.send(data.to_vec()).expect("reply channel");
        }),
    );
    let first = reply_rx.recv_timeout(Duration::from_secs(1)).expect("read");
    assert_eq!(first, pattern[..64].to_vec());
    assert_eq!((usb.read32(ENDPTCOMPLETE) >> 16) & 0xff, 1 << 2);
    assert!(irqs.load(Ordering::SeqCst) >= 1);
}

#[test]
fn endpoint_fifo_caps_at_64k_dropping_oldest() {
    let (bus, usb, _irqs) = setup();
    usb.write32(ENDPTCTRL0 + 4 * 3, 2 << 18); // EP3 TX bulk

    // Three 30000-byte descriptors: 90000 bytes total, 24464 over the cap.
    let mut offset = 0u32;
    for _ in 0..3 {
        let chunk: Vec<u8> = (0..30000u32).map(|i| ((offset + i) % 251) as u8).collect();
        bus.write_bytes(BUF0 + offset, &chunk);
        install_td(&bus, 3, true, TD0, BUF0 + offset, 30000);
        usb.write32(ENDPTPRIME, 1 << (16 + 3));
        offset += 30000;
    }

    let (reply_tx, reply_rx) = mpsc::channel();
    usb.handle_data_read(
        3,
        0,
        ENDPOINT_BUFFER_SIZE + 1,
        Box::new(move |data| {
            reply_tx.send(data.to_vec()).expect("reply channel");
        }),
    );
    let drained = reply_rx.recv_timeout(Duration::from_secs(1)).expect("read");
    assert_eq!(drained.len(), ENDPOINT_BUFFER_SIZE);
    // The head of the FIFO is byte 90000 - 65536 of the original stream.
    let first_kept = 90_000 - ENDPOINT_BUFFER_SIZE as u32;
    assert_eq!(drained[0], (first_kept % 251) as u8);
    assert_eq!(*drained.last().expect("tail"), ((90_000 - 1) % 251) as u8);
}

#[test]
fn data_write_lands_in_rx_descriptor() {
    let (bus, usb, irqs) = setup();
    install_td(&bus, 2, false, TD0, BUF0, 64);

    irqs.store(0, Ordering::SeqCst);
    let data: Vec<u8> = (0..32u8).collect();
    usb.handle_data_write(2, 0, &data);

    let mut landed = [0u8; 32];
    bus.read_bytes(BUF0, &mut landed);
    assert_eq!(landed.to_vec(), data);
    assert_eq!(usb.read32(ENDPTCOMPLETE) & 0xff, 1 << 2);
    // 32 of the descriptor's 64 bytes remain open; the chain advanced.
    assert_eq!(bus.read32(TD0 + 4) >> 16, 32);
    let qh = LIST + 2 * 2 * 64;
    assert_eq!(bus.read32(qh + 8), 1, "qh.next follows td.next");
    assert_eq!(bus.read32(qh + 4), TD0, "qh.current records the td");
    assert!(irqs.load(Ordering::SeqCst) >= 1);
}

#[test]
fn isochronous_read_is_paced_by_the_timer() {
    let (bus, usb, _irqs) = setup();
    usb.write32(ENDPTCTRL0 + 4 * 3, 1 << 18); // EP3 TX isochronous

    // Backlog of 384 bytes.
    let pattern: Vec<u8> = (0..384u32).map(|i| (i % 256) as u8).collect();
    bus.write_bytes(BUF0, &pattern);
    install_td(&bus, 3, true, TD0, BUF0, 384);
    usb.write32(ENDPTPRIME, 1 << (16 + 3));

    let (reply_tx, reply_rx) = mpsc::channel();
    for _ in 0..2 {
        let tx = reply_tx.clone();
        usb.handle_data_read(
            3,
            1,
            192,
            Box::new(move |data| {
                tx.send(data.to_vec()).expect("reply channel");
            }),
        );
    }

    // Deliveries are timer-paced, one completion per expiry.
    let first = reply_rx.recv_timeout(Duration::from_secs(1)).expect("slot 1");
    let second = reply_rx.recv_timeout(Duration::from_secs(1)).expect("slot 2");
    assert_eq!(first, pattern[..192].to_vec());
    assert_eq!(second, pattern[192..].to_vec());

    // No third read pending: the next expiry is an underrun no-op.
    assert!(reply_rx.recv_timeout(Duration::from_millis(20)).is_err());
}

#[test]
fn gp_timer_sets_status_and_fires_irq() {
    let (_bus, usb, irqs) = setup();
    irqs.store(0, Ordering::SeqCst);

    usb.write32(0x80, 999); // 1 ms load value
    usb.write32(0x84, (1 << 31) | (1 << 24)); // enable, periodic

    std::thread::sleep(Duration::from_millis(30));
    usb.write32(0x84, 0);
    assert_eq!((usb.read32(USBSTS) >> 24) & 1, 1, "TI0 set");
    assert!(irqs.load(Ordering::SeqCst) >= 1);

    usb.write32(USBSTS, 1 << 24);
    assert_eq!((usb.read32(USBSTS) >> 24) & 1, 0, "TI0 w1c");
}

//! Device-side model of the i.MX RT USB controller.
//!
//! The firmware talks to the register file exactly as it would on silicon:
//! it parks an endpoint queue-head array in RAM, latches its address into
//! `ENDPTLISTADDR`, and primes transfer descriptors through `ENDPTPRIME`.
//! The host side (the USB/IP bridge) drives the three `UsbDeviceOps`
//! operations, which translate host URBs into queue-head traffic and
//! interrupts.
//!
//! Lock order: master callbacks lock, then the register bank, then
//! [`UsbShared::regs`], then [`UsbShared::eps`]. Transfer completions are
//! always invoked with none of the controller's own locks held.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use emu_core::bus::{Bus, Device};
use emu_core::cqueue::ByteQueue;
use emu_core::reg::{FieldRead, FieldWrite, Register, RegisterBank, RegisterDevice};
use emu_core::timer::Timer;

pub const NUM_ENDPOINTS: usize = 8;
pub const NUM_GPTIMERS: usize = 2;
/// Per-endpoint FIFO cap; overflowing drops the oldest bytes.
pub const ENDPOINT_BUFFER_SIZE: usize = 64 * 1024;
/// Upper bound on one prime's descriptor walk.
const MAX_TD_CHAIN: usize = 64;

// Register offsets within the USB block.
const USBCMD: u32 = 0x140;
const USBSTS: u32 = 0x144;
const ENDPTLISTADDR: u32 = 0x158;
const PORTSC1: u32 = 0x184;
const ENDPTSETUPSTAT: u32 = 0x1ac;
const ENDPTPRIME: u32 = 0x1b0;
const ENDPTSTAT: u32 = 0x1b8;
const ENDPTCOMPLETE: u32 = 0x1bc;
const ENDPTCTRL0: u32 = 0x1c0;
const GPTIMER0LD: u32 = 0x80;

// Endpoint queue head field offsets (64-byte record per endpoint direction).
const QH_SIZE: u32 = 64;
const QH_CURRENT: u32 = 4;
const QH_NEXT: u32 = 8;
const QH_SETUP0: u32 = 40;
const QH_SETUP1: u32 = 44;

/// Endpoint-direction transfer type, as written to `ENDPTCTRLn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointType {
    #[default]
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl From<u32> for EndpointType {
    fn from(value: u32) -> Self {
        match value & 3 {
            1 => Self::Isochronous,
            2 => Self::Bulk,
            3 => Self::Interrupt,
            _ => Self::Control,
        }
    }
}

/// The 8 setup bytes of a control transfer, in wire order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetupBytes {
    pub bytes0: u32,
    pub bytes1: u32,
}

impl SetupBytes {
    pub fn from_bytes(raw: &[u8; 8]) -> Self {
        Self {
            bytes0: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            bytes1: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut raw = [0u8; 8];
        raw[..4].copy_from_slice(&self.bytes0.to_le_bytes());
        raw[4..].copy_from_slice(&self.bytes1.to_le_bytes());
        raw
    }

    /// bmRequestType | bRequest << 8.
    pub fn request_and_type(self) -> u16 {
        (self.bytes0 & 0xffff) as u16
    }

    pub fn w_value(self) -> u16 {
        (self.bytes0 >> 16) as u16
    }

    pub fn w_length(self) -> u16 {
        (self.bytes1 >> 16) as u16
    }
}

/// Completion for a device-to-host transfer: receives the produced bytes.
pub type TransferCompletion = Box<dyn FnOnce(&[u8]) + Send>;

/// Host-side operations the USB/IP bridge drives.
pub trait UsbDeviceOps: Send + Sync {
    /// Deliver a control setup packet on endpoint 0, with optional OUT
    /// payload. `completion` fires with the device's answer once the
    /// firmware primes endpoint-0 TX.
    fn handle_setup_packet(&self, setup: SetupBytes, data: &[u8], completion: TransferCompletion);

    /// Host-to-device data on `ep`: lands in the endpoint's active RX
    /// transfer descriptor.
    fn handle_data_write(&self, ep: usize, interval: u32, data: &[u8]);

    /// Device-to-host data on `ep`: drains up to `limit` bytes from the
    /// endpoint FIFO. Isochronous endpoints deliver on a `interval × 125 µs`
    /// cadence; everything else completes synchronously.
    fn handle_data_read(&self, ep: usize, interval: u32, limit: usize, completion: TransferCompletion);
}

/// Interrupt sink wired up by the machine assembly.
pub type IrqHandler = Box<dyn Fn() + Send + Sync>;

/// A transfer descriptor, read field-wise out of guest memory.
struct TransferDescriptor {
    addr: u32,
    next: u32,
    status: u8,
    mult_ioc: u8,
    total_bytes: u16,
    buffer0: u32,
}

impl TransferDescriptor {
    const ACTIVE: u8 = 1 << 7;

    fn load(bus: &Bus, addr: u32) -> Self {
        let token = bus.read32(addr + 4);
        Self {
            addr,
            next: bus.read32(addr),
            status: (token & 0xff) as u8,
            mult_ioc: ((token >> 8) & 0xff) as u8,
            total_bytes: (token >> 16) as u16,
            buffer0: bus.read32(addr + 8),
        }
    }

    fn is_active(&self) -> bool {
        self.status & Self::ACTIVE != 0
    }

    fn store_token(&self, bus: &Bus) {
        let token = u32::from(self.status)
            | (u32::from(self.mult_ioc) << 8)
            | (u32::from(self.total_bytes) << 16);
        bus.write32(self.addr + 4, token);
    }
}

#[derive(Default)]
struct UsbRegs {
    setup_trip_wire: bool,
    add_dtd_trip_wire: bool,
    port_change_detect: bool,
    interrupt: bool,
    gp_timer_interrupts: [bool; NUM_GPTIMERS],
    prime_tx: u8,
    prime_rx: u8,
    ready_tx: u8,
    ready_rx: u8,
    complete_tx: u8,
    complete_rx: u8,
    list_address: u32,
    setup_status: u32,
    tx_types: [EndpointType; NUM_ENDPOINTS],
    rx_types: [EndpointType; NUM_ENDPOINTS],
}

/// FIFOs and pending completions; the single mutex shared between the
/// translator thread and the host-side operations.
struct EndpointState {
    fifos: Vec<ByteQueue>,
    tx_callbacks: Vec<VecDeque<TransferCompletion>>,
    setup_fifo: ByteQueue,
    setup_callback: Option<TransferCompletion>,
}

struct UsbShared {
    bus: Arc<Bus>,
    irq: Mutex<Option<IrqHandler>>,
    regs: Mutex<UsbRegs>,
    eps: Mutex<EndpointState>,
    gp_timers: Vec<Timer>,
    isoc_timers: Mutex<Vec<Option<Arc<Timer>>>>,
}

impl UsbShared {
    fn raise_irq(&self) {
        let irq = self.irq.lock();
        if let Some(handler) = irq.as_ref() {
            handler();
        }
    }

    /// Raise the interrupt line if any enabled status bit is set.
    fn update_interrupts(&self) {
        let fire = {
            let regs = self.regs.lock();
            regs.interrupt || regs.gp_timer_interrupts.iter().any(|b| *b)
        };
        if fire {
            self.raise_irq();
        }
    }

    fn queue_head(&self, ep: usize, tx: bool) -> u32 {
        let list = self.regs.lock().list_address;
        list + (2 * ep as u32 + u32::from(tx)) * QH_SIZE
    }

    /// Walk the primed TX descriptor chains. Endpoint 0 answers the pending
    /// setup transaction; other endpoints feed their FIFO.
    fn prime_tx(&self, mask: u8) {
        self.regs.lock().prime_tx = mask;
        for ep in 0..NUM_ENDPOINTS {
            if mask & (1 << ep) == 0 {
                continue;
            }
            let qh = self.queue_head(ep, true);
            let mut addr = self.bus.read32(qh + QH_NEXT);
            let mut walked = 0;
            while addr & 1 == 0 {
                // A descriptor chain that never reaches a terminate bit is
                // firmware corruption; stop rather than spin.
                walked += 1;
                if walked > MAX_TD_CHAIN {
                    warn!(ep, "transfer descriptor chain does not terminate");
                    break;
                }
                let mut td = TransferDescriptor::load(&self.bus, addr);
                if td.is_active() {
                    let mut data = vec![0u8; usize::from(td.total_bytes)];
                    self.bus.read_bytes(td.buffer0, &mut data);
                    if ep == 0 {
                        let completion = self.eps.lock().setup_callback.take();
                        match completion {
                            Some(completion) => completion(&data),
                            None => warn!("endpoint 0 primed with no pending setup"),
                        }
                    } else {
                        let mut eps = self.eps.lock();
                        let fifo = &mut eps.fifos[ep];
                        fifo.push(&data);
                        if fifo.len() > ENDPOINT_BUFFER_SIZE {
                            let excess = fifo.len() - ENDPOINT_BUFFER_SIZE;
                            fifo.discard(excess);
                        }
                    }
                    td.status = 0;
                    td.total_bytes = 0;
                    td.store_token(&self.bus);
                }
                addr = td.next;
            }
            self.regs.lock().prime_tx &= !(1 << ep);
        }
    }

    /// Accept primed RX buffers. Endpoint 0 consumes queued setup OUT data
    /// into the descriptor's buffer.
    fn prime_rx(&self, mask: u8) {
        self.regs.lock().prime_rx = mask;
        for ep in 0..NUM_ENDPOINTS {
            if mask & (1 << ep) == 0 {
                continue;
            }
            self.regs.lock().ready_rx |= 1 << ep;
            if ep == 0 {
                let qh = self.queue_head(ep, false);
                let addr = self.bus.read32(qh + QH_NEXT);
                if addr & 1 == 0 {
                    let mut td = TransferDescriptor::load(&self.bus, addr);
                    if td.is_active() {
                        let wanted = usize::from(td.total_bytes);
                        let data = {
                            let mut eps = self.eps.lock();
                            if eps.setup_fifo.len() < wanted {
                                warn!(
                                    wanted,
                                    queued = eps.setup_fifo.len(),
                                    "endpoint 0 RX primed beyond queued setup data"
                                );
                            }
                            eps.setup_fifo.pop_vec(wanted)
                        };
                        self.bus.write_bytes(td.buffer0, &data);
                        td.status = 0;
                        td.store_token(&self.bus);
                    }
                }
            }
            self.regs.lock().prime_rx &= !(1 << ep);
        }
    }

    fn set_list_address(&self, address: u32) {
        let mut regs = self.regs.lock();
        regs.ready_tx = 0;
        regs.ready_rx = 0;
        regs.list_address = address;
        info!(address = format_args!("{address:#010x}"), "endpoint list installed");
    }
}

/// The USB controller device.
pub struct UsbController {
    device: RegisterDevice,
    shared: Arc<UsbShared>,
}

impl UsbController {
    pub fn new(bus: Arc<Bus>, base: u32, size: u32) -> Arc<Self> {
        let shared = Arc::new(UsbShared {
            bus,
            irq: Mutex::new(None),
            regs: Mutex::new(UsbRegs::default()),
            eps: Mutex::new(EndpointState {
                fifos: (0..NUM_ENDPOINTS).map(|_| ByteQueue::new()).collect(),
                tx_callbacks: (0..NUM_ENDPOINTS).map(|_| VecDeque::new()).collect(),
                setup_fifo: ByteQueue::new(),
                setup_callback: None,
            }),
            gp_timers: (0..NUM_GPTIMERS).map(|_| Timer::new()).collect(),
            isoc_timers: Mutex::new((0..NUM_ENDPOINTS).map(|_| None).collect()),
        });
        let bank = build_bank(&shared);
        Arc::new(Self {
            device: RegisterDevice::new(base, size, bank),
            shared,
        })
    }

    /// Wire the controller's interrupt output.
    pub fn bind_interrupt(&self, handler: IrqHandler) {
        *self.shared.irq.lock() = Some(handler);
    }
}

impl Device for UsbController {
    fn base(&self) -> u32 {
        self.device.base()
    }

    fn size(&self) -> u32 {
        self.device.size()
    }

    fn read(&self, offset: u32, buf: &mut [u8]) {
        self.device.read(offset, buf);
    }

    fn write(&self, offset: u32, buf: &[u8]) {
        self.device.write(offset, buf);
    }

    fn read32(&self, offset: u32) -> u32 {
        self.device.read32(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        self.device.write32(offset, value);
    }

    fn host_ptr(&self, _offset: u32) -> Option<NonNull<u8>> {
        None
    }
}

impl UsbDeviceOps for UsbController {
    fn handle_setup_packet(&self, setup: SetupBytes, data: &[u8], completion: TransferCompletion) {
        let shared = &self.shared;
        {
            let _master = shared.bus.lock();
            let qh = shared.queue_head(0, false);
            shared.bus.write32(qh + QH_SETUP0, setup.bytes0);
            shared.bus.write32(qh + QH_SETUP1, setup.bytes1);
            {
                let mut regs = shared.regs.lock();
                regs.setup_status = 1;
                regs.port_change_detect = true;
                regs.interrupt = true;
            }
            let mut eps = shared.eps.lock();
            if eps.setup_callback.is_some() {
                warn!("overlapping setup transactions; dropping previous completion");
            }
            if !data.is_empty() {
                eps.setup_fifo.push(data);
            }
            eps.setup_callback = Some(completion);
        }
        shared.update_interrupts();
    }

    fn handle_data_write(&self, ep: usize, _interval: u32, data: &[u8]) {
        if ep >= NUM_ENDPOINTS {
            warn!(ep, "data write to endpoint out of range");
            return;
        }
        let shared = &self.shared;
        {
            let _master = shared.bus.lock();
            shared.regs.lock().complete_rx |= 1 << ep;
            let qh = shared.queue_head(ep, false);
            let addr = shared.bus.read32(qh + QH_NEXT);
            if addr & 1 == 0 {
                let mut td = TransferDescriptor::load(&shared.bus, addr);
                let len = data.len().min(usize::from(td.total_bytes));
                td.status = 0;
                td.total_bytes -= len as u16;
                shared.bus.write_bytes(td.buffer0, &data[..len]);
                td.store_token(&shared.bus);
                shared.bus.write32(qh + QH_NEXT, td.next);
                shared.bus.write32(qh + QH_CURRENT, addr);
            }
            shared.regs.lock().interrupt = true;
        }
        shared.update_interrupts();
    }

    fn handle_data_read(&self, ep: usize, interval: u32, limit: usize, completion: TransferCompletion) {
        if ep >= NUM_ENDPOINTS {
            warn!(ep, "data read from endpoint out of range");
            completion(&[]);
            return;
        }
        let shared = Arc::clone(&self.shared);
        if shared.regs.lock().tx_types[ep] == EndpointType::Isochronous {
            let mut timers = shared.isoc_timers.lock();
            if timers[ep].is_none() {
                let timer = Arc::new(Timer::new());
                let tick_shared = Arc::clone(&shared);
                timer.set_interval(
                    Duration::from_micros(u64::from(interval.max(1)) * 125),
                    Box::new(move || isoc_tick(&tick_shared, ep, limit)),
                );
                timer.start();
                timers[ep] = Some(timer);
            }
            drop(timers);
            shared.eps.lock().tx_callbacks[ep].push_back(completion);
        } else {
            {
                let mut regs = shared.regs.lock();
                regs.complete_tx |= 1 << ep;
                regs.interrupt = true;
            }
            shared.update_interrupts();
            let buffer = {
                let mut eps = shared.eps.lock();
                let avail = eps.fifos[ep].len();
                eps.fifos[ep].pop_vec(limit.min(avail))
            };
            completion(&buffer);
        }
    }
}

/// One expiry of an isochronous TX timer: deliver one pending read, if any.
fn isoc_tick(shared: &Arc<UsbShared>, ep: usize, limit: usize) {
    // Underrun (no reader queued) is a silent skip.
    if shared.eps.lock().tx_callbacks[ep].is_empty() {
        return;
    }
    {
        let mut regs = shared.regs.lock();
        regs.complete_tx |= 1 << ep;
        regs.interrupt = true;
    }
    shared.update_interrupts();
    let (completion, buffer) = {
        let mut eps = shared.eps.lock();
        let completion = eps.tx_callbacks[ep].pop_front();
        let avail = eps.fifos[ep].len();
        let buffer = eps.fifos[ep].pop_vec(limit.min(avail));
        (completion, buffer)
    };
    if let Some(completion) = completion {
        completion(&buffer);
    }
}

fn flag_read(shared: &Arc<UsbShared>, get: fn(&UsbRegs) -> bool) -> FieldRead {
    let shared = Arc::clone(shared);
    Box::new(move || u32::from(get(&shared.regs.lock())))
}

fn flag_write(shared: &Arc<UsbShared>, set: fn(&mut UsbRegs, bool)) -> FieldWrite {
    let shared = Arc::clone(shared);
    Box::new(move |v| set(&mut shared.regs.lock(), v != 0))
}

/// Write-one-to-clear semantics over a boolean flag.
fn flag_w1c(shared: &Arc<UsbShared>, field: fn(&mut UsbRegs) -> &mut bool) -> FieldWrite {
    let shared = Arc::clone(shared);
    Box::new(move |v| {
        if v != 0 {
            *field(&mut shared.regs.lock()) = false;
        }
    })
}

fn word_read(shared: &Arc<UsbShared>, get: fn(&UsbRegs) -> u32) -> FieldRead {
    let shared = Arc::clone(shared);
    Box::new(move || get(&shared.regs.lock()))
}

/// Write-one-to-clear over a bitmask byte.
fn mask_w1c(shared: &Arc<UsbShared>, field: fn(&mut UsbRegs) -> &mut u8) -> FieldWrite {
    let shared = Arc::clone(shared);
    Box::new(move |v| {
        let mut regs = shared.regs.lock();
        let slot = field(&mut regs);
        *slot &= !(v as u8);
    })
}

fn build_bank(shared: &Arc<UsbShared>) -> RegisterBank {
    let mut bank = RegisterBank::new();

    for i in 0..NUM_GPTIMERS {
        let load_shared = Arc::clone(shared);
        let load = Register::new(GPTIMER0LD + (i as u32) * 8).field(
            "GPTLD",
            0,
            24,
            Box::new(|| 0),
            Box::new(move |v| {
                let tick = Arc::clone(&load_shared);
                load_shared.gp_timers[i].set_interval(
                    Duration::from_micros(u64::from(v) + 1),
                    Box::new(move || {
                        tick.regs.lock().gp_timer_interrupts[i] = true;
                        tick.update_interrupts();
                    }),
                );
            }),
        );
        bank.bind(load);

        let ctrl_shared = Arc::clone(shared);
        let ctrl = Register::new(GPTIMER0LD + 4 + (i as u32) * 8).on_write(Box::new(move |v| {
            let timer = &ctrl_shared.gp_timers[i];
            timer.set_oneshot(v & (1 << 24) == 0);
            if v & (1 << 31) != 0 {
                timer.start();
            } else {
                timer.stop();
            }
        }));
        bank.bind(ctrl);
    }

    bank.bind(
        Register::new(USBCMD)
            .field(
                "SUTW",
                13,
                1,
                flag_read(shared, |r| r.setup_trip_wire),
                flag_write(shared, |r, v| r.setup_trip_wire = v),
            )
            .field(
                "ATDTW",
                14,
                1,
                flag_read(shared, |r| r.add_dtd_trip_wire),
                flag_write(shared, |r, v| r.add_dtd_trip_wire = v),
            ),
    );

    let sts_shared = Arc::clone(shared);
    bank.bind(
        Register::new(USBSTS)
            .field(
                "UI",
                0,
                1,
                flag_read(shared, |r| r.interrupt),
                flag_w1c(shared, |r| &mut r.interrupt),
            )
            .field(
                "PCI",
                2,
                1,
                flag_read(shared, |r| r.port_change_detect),
                flag_w1c(shared, |r| &mut r.port_change_detect),
            )
            .field(
                "TI0",
                24,
                1,
                flag_read(shared, |r| r.gp_timer_interrupts[0]),
                flag_w1c(shared, |r| &mut r.gp_timer_interrupts[0]),
            )
            .field(
                "TI1",
                25,
                1,
                flag_read(shared, |r| r.gp_timer_interrupts[1]),
                flag_w1c(shared, |r| &mut r.gp_timer_interrupts[1]),
            )
            .on_write(Box::new(move |_| sts_shared.update_interrupts())),
    );

    let list_shared = Arc::clone(shared);
    bank.bind(Register::new(ENDPTLISTADDR).field(
        "EPBASE",
        11,
        21,
        word_read(shared, |r| r.list_address >> 11),
        Box::new(move |v| list_shared.set_list_address(v << 11)),
    ));

    // Port always reports an attached high-speed peer.
    bank.bind(
        Register::new(PORTSC1)
            .field_ro("PSPD", 26, 2, Box::new(|| 2))
            .field_ro("HSP", 9, 1, Box::new(|| 1)),
    );

    let setup_w1c = Arc::clone(shared);
    bank.bind(Register::new(ENDPTSETUPSTAT).field(
        "ENDPTSETUPSTAT",
        0,
        16,
        word_read(shared, |r| r.setup_status),
        Box::new(move |v| {
            setup_w1c.regs.lock().setup_status &= !v;
        }),
    ));

    let prime_tx_shared = Arc::clone(shared);
    let prime_rx_shared = Arc::clone(shared);
    bank.bind(
        Register::new(ENDPTPRIME)
            .field(
                "PETB",
                16,
                8,
                word_read(shared, |r| u32::from(r.prime_tx)),
                Box::new(move |v| prime_tx_shared.prime_tx(v as u8)),
            )
            .field(
                "PERB",
                0,
                8,
                word_read(shared, |r| u32::from(r.prime_rx)),
                Box::new(move |v| prime_rx_shared.prime_rx(v as u8)),
            ),
    );

    bank.bind(
        Register::new(ENDPTSTAT)
            .field_ro("ETBR", 16, 8, word_read(shared, |r| u32::from(r.ready_tx)))
            .field_ro("ERBR", 0, 8, word_read(shared, |r| u32::from(r.ready_rx))),
    );

    bank.bind(
        Register::new(ENDPTCOMPLETE)
            .field(
                "ETCE",
                16,
                8,
                word_read(shared, |r| u32::from(r.complete_tx)),
                mask_w1c(shared, |r| &mut r.complete_tx),
            )
            .field(
                "ERCE",
                0,
                8,
                word_read(shared, |r| u32::from(r.complete_rx)),
                mask_w1c(shared, |r| &mut r.complete_rx),
            ),
    );

    for ep in 0..NUM_ENDPOINTS {
        let tx_r = Arc::clone(shared);
        let tx_w = Arc::clone(shared);
        let rx_r = Arc::clone(shared);
        let rx_w = Arc::clone(shared);
        bank.bind(
            Register::new(ENDPTCTRL0 + 4 * ep as u32)
                .field(
                    "TXT",
                    18,
                    2,
                    Box::new(move || tx_r.regs.lock().tx_types[ep] as u32),
                    Box::new(move |v| tx_w.regs.lock().tx_types[ep] = EndpointType::from(v)),
                )
                .field(
                    "RXT",
                    2,
                    2,
                    Box::new(move || rx_r.regs.lock().rx_types[ep] as u32),
                    Box::new(move |v| rx_w.regs.lock().rx_types[ep] = EndpointType::from(v)),
                ),
        );
    }

    debug!("usb register bank assembled");
    bank
}

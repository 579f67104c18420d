//! USDHC register front-end.
//!
//! A write to `CMD_XFR_TYP` forwards the command to the card and latches the
//! response words. Data moves either by DMA (a 100 µs one-shot copies
//! `BLKCNT × BLKSIZE` bytes between the card and `DS_ADDR`, then raises
//! transfer-complete) or word-at-a-time through the buffer access port.

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use emu_core::bus::{Bus, Device};
use emu_core::reg::{FieldRead, FieldWrite, Register, RegisterBank, RegisterDevice};
use emu_core::timer::Timer;

use crate::card::SdCard;

const DS_ADDR: u32 = 0x00;
const BLK_ATT: u32 = 0x04;
const CMD_ARG: u32 = 0x08;
const CMD_XFR_TYP: u32 = 0x0c;
const CMD_RSP0: u32 = 0x10;
const DATA_BUFF_ACC_PORT: u32 = 0x20;
const PRES_STATE: u32 = 0x24;
const SYS_CTRL: u32 = 0x2c;
const INT_STATUS: u32 = 0x30;
const INT_STATUS_EN: u32 = 0x34;
const WTMK_LVL: u32 = 0x44;
const MIX_CTRL: u32 = 0x48;

const DMA_DELAY: Duration = Duration::from_micros(100);

/// Interrupt sink wired up by the machine assembly.
pub type IrqHandler = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct UsdhcState {
    dma_address: u32,
    block_size: u32,
    block_count: u32,
    cmd_argument: u32,
    resp_type: u32,
    cmd_type: u32,
    cmd_index: u32,
    data_present: bool,
    command_complete: bool,
    transfer_complete: bool,
    read_watermark: u32,
    dma_enable: bool,
    data_direction: bool,
    cmd_resp: [u32; 4],
}

struct UsdhcShared {
    bus: Arc<Bus>,
    irq: Mutex<Option<IrqHandler>>,
    state: Mutex<UsdhcState>,
    card: Mutex<Option<Arc<SdCard>>>,
    dma_timer: Timer,
}

impl UsdhcShared {
    fn update_interrupts(&self) {
        let fire = self.state.lock().transfer_complete;
        if fire {
            let irq = self.irq.lock();
            if let Some(handler) = irq.as_ref() {
                handler();
            }
        }
    }

    /// Forward the command to the card; arm the DMA one-shot when a data
    /// phase with DMA was requested.
    fn send_command(&self) {
        let card = self.card.lock().clone();
        let Some(card) = card else {
            return;
        };
        let mut state = self.state.lock();
        let mut response = [0u32; 4];
        let len = card.handle_command(state.cmd_index as u8, state.cmd_argument, &mut response);
        match len {
            4 => state.cmd_resp[0] = response[0],
            16 => state.cmd_resp = response,
            _ => {}
        }
        state.command_complete = true;
        let start_dma = state.data_present && state.dma_enable;
        drop(state);
        if start_dma {
            self.dma_timer.set_oneshot(true);
            self.dma_timer.start();
        }
    }

    /// The deferred DMA transfer between the card and guest memory.
    fn run_dma(&self) {
        let card = self.card.lock().clone();
        let Some(card) = card else {
            return;
        };
        let (address, bytes, card_to_memory) = {
            let state = self.state.lock();
            (
                state.dma_address,
                (state.block_count * state.block_size) as usize,
                state.data_direction,
            )
        };
        let mut buffer = vec![0u8; bytes];
        if card_to_memory {
            card.read_data(&mut buffer);
            self.bus.write_bytes(address, &buffer);
        } else {
            self.bus.read_bytes(address, &mut buffer);
            card.write_data(&buffer);
        }
        debug!(
            address = format_args!("{address:#010x}"),
            bytes, card_to_memory, "sdhc dma complete"
        );
        let mut state = self.state.lock();
        state.block_count = 0;
        state.transfer_complete = true;
    }

    /// PIO read: one word from the card through the buffer port.
    fn read_data_port(&self) -> u32 {
        let card = self.card.lock().clone();
        let Some(card) = card else {
            return 0;
        };
        let mut word = [0u8; 4];
        card.read_data(&mut word);
        self.state.lock().transfer_complete = true;
        u32::from_le_bytes(word)
    }

    /// PIO write: one word to the card through the buffer port.
    fn write_data_port(&self, value: u32) {
        let card = self.card.lock().clone();
        let Some(card) = card else {
            return;
        };
        card.write_data(&value.to_le_bytes());
        self.state.lock().transfer_complete = true;
    }

    fn reset_data_line(&self) {
        let mut state = self.state.lock();
        state.block_count = 0;
        state.block_size = 0;
    }
}

/// The USDHC controller device.
pub struct UsdhcController {
    device: RegisterDevice,
    shared: Arc<UsdhcShared>,
}

impl UsdhcController {
    pub fn new(bus: Arc<Bus>, base: u32, size: u32) -> Arc<Self> {
        let shared = Arc::new(UsdhcShared {
            bus,
            irq: Mutex::new(None),
            state: Mutex::new(UsdhcState::default()),
            card: Mutex::new(None),
            dma_timer: Timer::new(),
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

    /// Insert a card and arm the deferred-DMA worker.
    pub fn insert_card(&self, card: Arc<SdCard>) {
        *self.shared.card.lock() = Some(card);
        let shared = Arc::clone(&self.shared);
        self.shared.dma_timer.set_interval(
            DMA_DELAY,
            Box::new(move || {
                let bus = Arc::clone(&shared.bus);
                let _master = bus.lock();
                shared.run_dma();
                shared.update_interrupts();
            }),
        );
    }
}

impl Device for UsdhcController {
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

fn state_read(shared: &Arc<UsdhcShared>, get: fn(&UsdhcState) -> u32) -> FieldRead {
    let shared = Arc::clone(shared);
    Box::new(move || get(&shared.state.lock()))
}

fn state_write(shared: &Arc<UsdhcShared>, set: fn(&mut UsdhcState, u32)) -> FieldWrite {
    let shared = Arc::clone(shared);
    Box::new(move |v| set(&mut shared.state.lock(), v))
}

fn flag_w1c(shared: &Arc<UsdhcShared>, field: fn(&mut UsdhcState) -> &mut bool) -> FieldWrite {
    let shared = Arc::clone(shared);
    Box::new(move |v| {
        if v != 0 {
            *field(&mut shared.state.lock()) = false;
        }
    })
}

fn build_bank(shared: &Arc<UsdhcShared>) -> RegisterBank {
    let mut bank = RegisterBank::new();

    bank.bind(Register::new(DS_ADDR).field(
        "DS_ADDR",
        0,
        32,
        state_read(shared, |s| s.dma_address),
        state_write(shared, |s, v| s.dma_address = v),
    ));

    bank.bind(
        Register::new(BLK_ATT)
            .field(
                "BLKSIZE",
                0,
                12,
                state_read(shared, |s| s.block_size),
                state_write(shared, |s, v| s.block_size = v),
            )
            .field(
                "BLKCNT",
                16,
                16,
                state_read(shared, |s| s.block_count),
                state_write(shared, |s, v| s.block_count = v),
            ),
    );

    bank.bind(Register::new(CMD_ARG).field(
        "CMD_ARG",
        0,
        32,
        state_read(shared, |s| s.cmd_argument),
        state_write(shared, |s, v| s.cmd_argument = v),
    ));

    let send = Arc::clone(shared);
    bank.bind(
        Register::new(CMD_XFR_TYP)
            .field(
                "CMDINX",
                24,
                6,
                state_read(shared, |s| s.cmd_index),
                state_write(shared, |s, v| s.cmd_index = v),
            )
            .field(
                "CMDTYP",
                22,
                2,
                state_read(shared, |s| s.cmd_type),
                state_write(shared, |s, v| s.cmd_type = v),
            )
            .field(
                "DPSEL",
                21,
                1,
                state_read(shared, |s| u32::from(s.data_present)),
                state_write(shared, |s, v| s.data_present = v != 0),
            )
            .field(
                "RSPTYP",
                16,
                2,
                state_read(shared, |s| s.resp_type),
                state_write(shared, |s, v| s.resp_type = v),
            )
            .on_write(Box::new(move |_| send.send_command())),
    );

    for i in 0..4usize {
        let resp = Arc::clone(shared);
        bank.bind(Register::new(CMD_RSP0 + (i as u32) * 4).field_ro(
            "CMD_RSP",
            0,
            32,
            Box::new(move || resp.state.lock().cmd_resp[i]),
        ));
    }

    let port_read = Arc::clone(shared);
    let port_write = Arc::clone(shared);
    bank.bind(Register::new(DATA_BUFF_ACC_PORT).field(
        "DATCONT",
        0,
        32,
        Box::new(move || port_read.read_data_port()),
        Box::new(move |v| port_write.write_data_port(v)),
    ));

    let present = Arc::clone(shared);
    bank.bind(
        Register::new(PRES_STATE)
            .field_ro("SDSTB", 3, 1, Box::new(|| 1))
            .field_ro("BWEN", 10, 1, Box::new(|| 1))
            .field_ro("BREN", 11, 1, Box::new(|| 1))
            .field_ro(
                "CINST",
                16,
                1,
                Box::new(move || u32::from(present.card.lock().is_some())),
            )
            .field_ro("CLSL", 23, 1, Box::new(|| 1))
            .field_ro("DLSL", 24, 8, Box::new(|| 7)),
    );

    let reset = Arc::clone(shared);
    bank.bind(Register::new(SYS_CTRL).field(
        "RSTD",
        26,
        1,
        Box::new(|| 0),
        Box::new(move |v| {
            if v != 0 {
                reset.reset_data_line();
            }
        }),
    ));

    let int_hook = Arc::clone(shared);
    bank.bind(
        Register::new(INT_STATUS)
            .field(
                "CC",
                0,
                1,
                state_read(shared, |s| u32::from(s.command_complete)),
                flag_w1c(shared, |s| &mut s.command_complete),
            )
            .field(
                "TC",
                1,
                1,
                state_read(shared, |s| u32::from(s.transfer_complete)),
                flag_w1c(shared, |s| &mut s.transfer_complete),
            )
            .on_write(Box::new(move |_| int_hook.update_interrupts())),
    );

    let en_hook = Arc::clone(shared);
    bank.bind(Register::new(INT_STATUS_EN).on_write(Box::new(move |_| en_hook.update_interrupts())));

    bank.bind(Register::new(WTMK_LVL).field(
        "RD_WML",
        0,
        8,
        state_read(shared, |s| s.read_watermark),
        state_write(shared, |s, v| s.read_watermark = v),
    ));

    bank.bind(
        Register::new(MIX_CTRL)
            .field(
                "DMAEN",
                0,
                1,
                state_read(shared, |s| u32::from(s.dma_enable)),
                state_write(shared, |s, v| s.dma_enable = v != 0),
            )
            .field(
                "DTDSEL",
                4,
                1,
                state_read(shared, |s| u32::from(s.data_direction)),
                state_write(shared, |s, v| s.data_direction = v != 0),
            ),
    );

    bank
}

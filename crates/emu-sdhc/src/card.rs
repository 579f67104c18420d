//! SDHC card protocol handler over a raw disk image.
//!
//! Decodes the command subset the firmware's SD stack issues during
//! initialisation and steady-state block I/O. Data moves as a byte stream at
//! the offset established by the addressed read/write commands. Commands
//! outside the subset answer with no payload and log the raw opcode; their
//! semantics are not guessed.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use emu_core::reg::Register;

const HIGH_CAPACITY_BLOCK_SIZE: u64 = 512;
/// READ_BL_LEN / WRITE_BL_LEN encoding of 512-byte blocks.
const BLOCK_LEN_512: u32 = 9;
/// CSD_STRUCTURE value for the version-2 (high capacity) layout.
const CSD_VERSION_2: u32 = 1;

#[derive(Debug, Error)]
pub enum SdCardError {
    #[error("sd image: {0}")]
    Io(#[from] std::io::Error),
}

/// Card state machine, per the SD physical layer specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdState {
    Idle,
    Identification,
    Standby,
    Transfer,
    SendingData,
    ReceivingData,
    Programming,
}

/// Response class of a command; determines how many words reach the host
/// controller's response registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SdResponse {
    R0,
    R1,
    R1b,
    R2Identification,
    R2Specific,
    R3,
    R6,
    R7,
}

struct CardInner {
    file: File,
    state: SdState,
    waiting_acmd: bool,
    high_capacity: bool,
    card_address: u16,
    check_pattern: u32,
    operating_condition: u32,
    erase_begin: u32,
    erase_end: u32,
}

/// The card's identification and status register files, assembled from
/// read-only fields.
struct CardRegisters {
    status: Register,
    cid: [Register; 4],
    csd: [Register; 4],
}

/// An emulated SDHC card.
pub struct SdCard {
    inner: Arc<Mutex<CardInner>>,
    regs: Mutex<CardRegisters>,
}

impl SdCard {
    /// Open `path` as the card's backing image.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SdCardError> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let image_bytes = file.metadata()?.len();
        let high_capacity = true;

        let mut operating_condition = 0x8000_0000u32; // power-up complete
        if high_capacity {
            operating_condition |= 0x4000_0000; // card capacity status
        }

        let inner = Arc::new(Mutex::new(CardInner {
            file,
            state: SdState::Idle,
            waiting_acmd: false,
            high_capacity,
            card_address: 0,
            check_pattern: 0,
            operating_condition,
            erase_begin: 0,
            erase_end: 0,
        }));

        let acmd = Arc::clone(&inner);
        let status = Register::new(0)
            .field_ro("APP_CMD", 5, 1, Box::new(move || u32::from(acmd.lock().waiting_acmd)))
            .field_ro("READY_FOR_DATA", 8, 1, Box::new(|| 1));

        // Product name bytes, newest-first across the CID words.
        let cid = [
            Register::new(0).field_ro("MDT", 0, 12, Box::new(|| (24 << 4) | 12)),
            Register::new(1).field_ro("PNM0", 24, 8, Box::new(|| u32::from(b'x'))),
            Register::new(2)
                .field_ro("PNM4", 24, 8, Box::new(|| u32::from(b't')))
                .field_ro("PNM3", 16, 8, Box::new(|| u32::from(b'r')))
                .field_ro("PNM2", 8, 8, Box::new(|| u32::from(b'k')))
                .field_ro("PNM1", 0, 8, Box::new(|| u32::from(b'b'))),
            Register::new(3),
        ];

        // CSD v2 encodes capacity in 512 KiB units, minus one.
        let device_size = (image_bytes / 1024 / HIGH_CAPACITY_BLOCK_SIZE).saturating_sub(1) as u32;
        let csd = [
            Register::new(0).field_ro("WRITE_BL_LEN", 14, 4, Box::new(|| BLOCK_LEN_512)),
            Register::new(1).field_ro("C_SIZE", 8, 22, Box::new(move || device_size)),
            Register::new(2)
                .field_ro("TRAN_SPEED", 24, 8, Box::new(|| 0x32))
                .field_ro("READ_BL_LEN", 8, 4, Box::new(|| BLOCK_LEN_512)),
            Register::new(3).field_ro("CSD_STRUCTURE", 22, 2, Box::new(|| CSD_VERSION_2)),
        ];

        Ok(Self {
            inner,
            regs: Mutex::new(CardRegisters { status, cid, csd }),
        })
    }

    /// Execute one command; fills `response` and returns the number of
    /// response bytes (0, 4, or 16).
    pub fn handle_command(&self, cmd: u8, arg: u32, response: &mut [u32; 4]) -> usize {
        let resp = {
            let mut inner = self.inner.lock();
            if inner.waiting_acmd {
                inner.waiting_acmd = false;
                Self::handle_app_command(&mut inner, cmd, arg)
            } else {
                Self::handle_normal_command(&mut inner, cmd, arg)
            }
        };

        match resp {
            SdResponse::R0 => 0,
            SdResponse::R1 | SdResponse::R1b => {
                response[0] = self.regs.lock().status.read32();
                4
            }
            SdResponse::R2Identification => {
                let regs = self.regs.lock();
                for (slot, reg) in response.iter_mut().zip(regs.cid.iter()) {
                    *slot = reg.read32();
                }
                16
            }
            SdResponse::R2Specific => {
                let regs = self.regs.lock();
                for (slot, reg) in response.iter_mut().zip(regs.csd.iter()) {
                    *slot = reg.read32();
                }
                16
            }
            SdResponse::R3 => {
                response[0] = self.inner.lock().operating_condition;
                4
            }
            SdResponse::R6 => {
                response[0] = u32::from(self.inner.lock().card_address);
                4
            }
            SdResponse::R7 => {
                response[0] = self.inner.lock().check_pattern;
                4
            }
        }
    }

    /// Stream `buf.len()` bytes out of the image at the current offset.
    pub fn read_data(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        match inner.file.read(buf) {
            Ok(n) => n,
            Err(err) => {
                warn!(%err, "sd image read failed");
                0
            }
        }
    }

    /// Stream `buf` into the image at the current offset.
    pub fn write_data(&self, buf: &[u8]) -> usize {
        let mut inner = self.inner.lock();
        match inner.file.write(buf) {
            Ok(n) => n,
            Err(err) => {
                warn!(%err, "sd image write failed");
                0
            }
        }
    }

    fn handle_app_command(_inner: &mut CardInner, cmd: u8, arg: u32) -> SdResponse {
        match cmd {
            6 => SdResponse::R1, // SET_BUS_WIDTH
            41 => SdResponse::R3, // SD_SEND_OP_COND
            _ => {
                warn!(cmd, arg = format_args!("{arg:#010x}"), "unhandled sd app command");
                SdResponse::R0
            }
        }
    }

    fn handle_normal_command(inner: &mut CardInner, cmd: u8, arg: u32) -> SdResponse {
        match cmd {
            0 => {
                // GO_IDLE_STATE
                inner.state = SdState::Idle;
                SdResponse::R0
            }
            2 => {
                // ALL_SEND_CID
                inner.state = SdState::Identification;
                SdResponse::R2Identification
            }
            3 => {
                // SEND_RELATIVE_ADDR
                inner.state = SdState::Standby;
                SdResponse::R6
            }
            6 => SdResponse::R1, // SWITCH_FUNC
            7 => {
                // SELECT/DESELECT_CARD
                inner.state = match inner.state {
                    SdState::Standby => SdState::Transfer,
                    SdState::Transfer | SdState::Programming => SdState::Standby,
                    other => other,
                };
                SdResponse::R1b
            }
            8 => {
                // SEND_IF_COND: echo the voltage/check pattern.
                inner.check_pattern = arg;
                SdResponse::R7
            }
            9 => SdResponse::R2Specific, // SEND_CSD
            10 => SdResponse::R2Identification, // SEND_CID
            12 => {
                // STOP_TRANSMISSION
                inner.state = match inner.state {
                    SdState::SendingData => SdState::Transfer,
                    SdState::ReceivingData => SdState::Programming,
                    other => other,
                };
                SdResponse::R1b
            }
            13 => SdResponse::R1, // SEND_STATUS
            17 | 18 => {
                // READ_SINGLE_BLOCK / READ_MULTIPLE_BLOCK
                if inner.state == SdState::Transfer {
                    inner.state = SdState::SendingData;
                }
                Self::seek(inner, arg);
                SdResponse::R1
            }
            24 | 25 => {
                // WRITE_BLOCK / WRITE_MULTIPLE_BLOCK
                if inner.state == SdState::Transfer {
                    inner.state = SdState::ReceivingData;
                }
                Self::seek(inner, arg);
                SdResponse::R1
            }
            32 => {
                inner.erase_begin = arg;
                SdResponse::R1
            }
            33 => {
                inner.erase_end = arg;
                SdResponse::R1
            }
            38 => {
                // ERASE: accepted; the image is left untouched.
                debug!(
                    begin = inner.erase_begin,
                    end = inner.erase_end,
                    "sd erase acknowledged"
                );
                SdResponse::R1b
            }
            55 => {
                // APP_CMD: the next command is application-specific.
                inner.waiting_acmd = true;
                SdResponse::R1
            }
            _ => {
                warn!(cmd, arg = format_args!("{arg:#010x}"), "unhandled sd command");
                SdResponse::R0
            }
        }
    }

    fn seek(inner: &mut CardInner, arg: u32) {
        let offset = if inner.high_capacity {
            u64::from(arg) * HIGH_CAPACITY_BLOCK_SIZE
        } else {
            u64::from(arg)
        };
        if let Err(err) = inner.file.seek(SeekFrom::Start(offset)) {
            warn!(%err, offset, "sd image seek failed");
        }
    }
}

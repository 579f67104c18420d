//! USB/IP TCP server.
//!
//! One dedicated thread accepts clients (a single client at a time) and
//! drives a byte-streamed parser over the connection. URB completions may
//! fire from other threads (the CPU thread answering a control transfer, an
//! isochronous timer worker), so replies go through a shared writer guarded
//! by a mutex and are written synchronously.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use emu_core::cqueue::ByteQueue;

use crate::controller::UsbDeviceOps;
use crate::usbip::wire::{
    decode_isoc_array, fill_isoc_actual, CmdSubmit, HeaderBasic, IsocDesc, OpRepImport,
    OpReqHeader, OpReqImport, RetSubmit, DIR_OUT, OP_REQ_IMPORT, USBIP_CMD_SUBMIT,
    USBIP_CMD_UNLINK,
};

/// Default USB/IP port.
pub const USBIP_PORT: u16 = 3240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    WaitCommand,
    WaitCommandImport,
    WaitHeader,
    WaitUrb,
    WaitUnlink,
    WaitTransferBuffer,
}

/// The USB/IP bridge for one emulated device.
pub struct UsbipServer {
    device: Arc<dyn UsbDeviceOps>,
    port: u16,
}

/// Running server; keeps the accept thread alive and reports the bound
/// address (useful when constructed with port 0).
pub struct UsbipServerHandle {
    local_addr: SocketAddr,
    _accept_thread: thread::JoinHandle<()>,
}

impl UsbipServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl UsbipServer {
    pub fn new(device: Arc<dyn UsbDeviceOps>, port: u16) -> Self {
        Self { device, port }
    }

    /// Bind and start accepting. Clients are served sequentially; a client
    /// error or disconnect returns the server to accepting.
    pub fn start(self) -> std::io::Result<UsbipServerHandle> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "usbip server listening");

        let device = self.device;
        let accept_thread = thread::Builder::new()
            .name("usbip-server".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            if let Err(err) = serve_client(&device, stream) {
                                debug!(%err, "usbip client ended");
                            }
                        }
                        Err(err) => warn!(%err, "usbip accept failed"),
                    }
                }
            })?;

        Ok(UsbipServerHandle {
            local_addr,
            _accept_thread: accept_thread,
        })
    }
}

fn serve_client(device: &Arc<dyn UsbDeviceOps>, mut stream: TcpStream) -> std::io::Result<()> {
    info!(peer = ?stream.peer_addr().ok(), "usbip client connected");
    let writer = Arc::new(Mutex::new(stream.try_clone()?));
    let mut connection = Connection {
        device: Arc::clone(device),
        writer,
        buffer: ByteQueue::new(),
        state: ParserState::WaitCommand,
        current_urb: CmdSubmit::default(),
    };

    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            info!("usbip client disconnected");
            return Ok(());
        }
        connection.feed(&chunk[..n]);
    }
}

struct Connection {
    device: Arc<dyn UsbDeviceOps>,
    writer: Arc<Mutex<TcpStream>>,
    buffer: ByteQueue,
    state: ParserState,
    current_urb: CmdSubmit,
}

impl Connection {
    fn feed(&mut self, bytes: &[u8]) {
        self.buffer.push(bytes);
        loop {
            let before = (self.state, self.buffer.len());
            self.step();
            if before == (self.state, self.buffer.len()) {
                break;
            }
        }
    }

    fn step(&mut self) {
        match self.state {
            ParserState::WaitCommand => {
                let mut raw = [0u8; OpReqHeader::SIZE];
                if self.buffer.peek(&mut raw) < raw.len() {
                    return;
                }
                let header = OpReqHeader::decode(&raw);
                if header.command == OP_REQ_IMPORT {
                    self.state = ParserState::WaitCommandImport;
                } else {
                    debug!(command = format_args!("{:#06x}", header.command), "unknown op; resyncing");
                    self.buffer.discard(OpReqHeader::SIZE);
                }
            }
            ParserState::WaitCommandImport => {
                let mut raw = [0u8; OpReqImport::SIZE];
                if self.buffer.len() < raw.len() {
                    return;
                }
                self.buffer.pop_into(&mut raw);
                let request = OpReqImport::decode(&raw);
                info!("usbip client attached device");
                self.reply_import(&request);
                self.state = ParserState::WaitHeader;
            }
            ParserState::WaitHeader => {
                let mut raw = [0u8; HeaderBasic::SIZE];
                if self.buffer.peek(&mut raw) < raw.len() {
                    return;
                }
                let header = HeaderBasic::decode(&raw);
                match header.command {
                    USBIP_CMD_SUBMIT => self.state = ParserState::WaitUrb,
                    USBIP_CMD_UNLINK => self.state = ParserState::WaitUnlink,
                    other => {
                        debug!(command = other, "unknown urb command; resyncing");
                        self.buffer.discard(4);
                    }
                }
            }
            ParserState::WaitUrb => {
                let mut raw = [0u8; CmdSubmit::SIZE];
                if self.buffer.len() < raw.len() {
                    return;
                }
                self.buffer.pop_into(&mut raw);
                self.current_urb = CmdSubmit::decode(&raw);
                self.state = ParserState::WaitTransferBuffer;
            }
            ParserState::WaitTransferBuffer => {
                let needed = self.current_urb.trailing_len();
                if self.buffer.len() < needed {
                    return;
                }
                let payload = self.buffer.pop_vec(needed);
                self.dispatch_urb(self.current_urb, &payload);
                self.state = ParserState::WaitHeader;
            }
            ParserState::WaitUnlink => {
                if self.buffer.len() < CmdSubmit::SIZE {
                    return;
                }
                self.buffer.discard(CmdSubmit::SIZE);
                self.state = ParserState::WaitHeader;
            }
        }
    }

    fn reply_import(&self, request: &OpReqImport) {
        let reply = OpRepImport {
            version: request.header.version,
            busid: request.busid,
            speed: 3, // high speed
            ..Default::default()
        };
        write_reply(&self.writer, &reply.encode());
    }

    fn dispatch_urb(&self, urb: CmdSubmit, payload: &[u8]) {
        let ep = urb.header.ep as usize;
        debug!(
            seqnum = urb.header.seqnum,
            ep,
            direction = urb.header.direction,
            length = urb.transfer_buffer_length,
            "urb submit"
        );
        if ep == 0 {
            let writer = Arc::clone(&self.writer);
            self.device.handle_setup_packet(
                urb.setup,
                payload,
                Box::new(move |data| {
                    reply_submit(&writer, &urb, data.len(), data, &[]);
                }),
            );
        } else if urb.header.direction != DIR_OUT {
            // Device to host: the tail of the payload is the isoc array.
            let isoc = decode_isoc_array(payload, urb.number_of_packets as usize);
            let writer = Arc::clone(&self.writer);
            self.device.handle_data_read(
                ep,
                urb.interval,
                urb.transfer_buffer_length as usize,
                Box::new(move |data| {
                    let mut isoc = isoc;
                    fill_isoc_actual(&mut isoc, data.len());
                    reply_submit(&writer, &urb, data.len(), data, &isoc);
                }),
            );
        } else {
            // Host to device: payload is data then isoc descriptors.
            let data_len = (urb.transfer_buffer_length as usize).min(payload.len());
            self.device
                .handle_data_write(ep, urb.interval, &payload[..data_len]);
            let mut isoc =
                decode_isoc_array(&payload[data_len..], urb.number_of_packets as usize);
            fill_isoc_actual(&mut isoc, 0);
            let actual = if urb.number_of_packets > 0 {
                0
            } else {
                urb.transfer_buffer_length as usize
            };
            reply_submit(&self.writer, &urb, actual, &[], &isoc);
        }
    }
}

/// Serialise and emit exactly one `USBIP_RET_SUBMIT` for `urb`:
/// `header || payload || isoc`.
fn reply_submit(
    writer: &Arc<Mutex<TcpStream>>,
    urb: &CmdSubmit,
    actual_length: usize,
    data: &[u8],
    isoc: &[IsocDesc],
) {
    let mut reply = RetSubmit::for_request(urb);
    reply.actual_length = actual_length as u32;

    let mut frame = Vec::with_capacity(RetSubmit::SIZE + data.len() + isoc.len() * IsocDesc::SIZE);
    frame.extend_from_slice(&reply.encode());
    frame.extend_from_slice(data);
    for desc in isoc {
        frame.extend_from_slice(&desc.encode());
    }
    write_reply(writer, &frame);
}

fn write_reply(writer: &Arc<Mutex<TcpStream>>, frame: &[u8]) {
    let mut stream = writer.lock();
    if let Err(err) = stream.write_all(frame) {
        warn!(%err, "usbip reply write failed");
    }
}

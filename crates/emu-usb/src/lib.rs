//! USB device-controller emulation and the USB/IP bridge that exposes it to
//! a host operating system over TCP.
//!
//! The controller models the register subset of the i.MX RT USB block the
//! firmware actually drives; the bridge speaks enough of the USB/IP protocol
//! for `usbip attach` to mount the emulated instrument as a real peripheral.

pub mod controller;
pub mod usbip;

pub use controller::{
    EndpointType, SetupBytes, TransferCompletion, UsbController, UsbDeviceOps,
    ENDPOINT_BUFFER_SIZE, NUM_ENDPOINTS,
};
pub use usbip::server::UsbipServer;

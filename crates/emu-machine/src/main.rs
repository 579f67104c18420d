//! CLI entry point for the emulated instrument.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use emu_core::jit::CoreBuilder;
use emu_machine::{load_descriptor, Machine, MachineConfig};

#[derive(Parser)]
#[command(name = "trackbox-emu")]
#[command(about = "Host-side emulator for the tracker instrument", long_about = None)]
#[command(version)]
struct Cli {
    /// Intel-HEX firmware image.
    firmware: PathBuf,
    /// Raw SD-card disk image.
    sdcard: PathBuf,
    /// Firmware descriptor (JSON map keyed by image name).
    #[arg(long)]
    descriptor: PathBuf,
    /// TCP port for the USB/IP bridge.
    #[arg(long, default_value_t = 3240)]
    usbip_port: u16,
}

/// The ARM32 recompiler is an external collaborator linked in by downstream
/// builds; this tree carries only the bindings.
fn native_core_builder() -> Option<Box<dyn CoreBuilder>> {
    None
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let descriptor = load_descriptor(&cli.descriptor, &cli.firmware)
        .context("loading firmware descriptor")?;

    let Some(builder) = native_core_builder() else {
        bail!(
            "this build carries no ARM recompiler backend; link one and \
             provide it via emu_core::jit::CoreBuilder"
        );
    };

    let machine = Machine::new(
        builder.as_ref(),
        &descriptor,
        MachineConfig {
            usbip_port: cli.usbip_port,
        },
    )
    .context("assembling machine")?;

    machine.load_hex(&cli.firmware).context("loading firmware")?;
    machine
        .install_firmware_hooks(&descriptor)
        .context("installing firmware hooks")?;
    machine.insert_sd_card(&cli.sdcard).context("attaching sd image")?;

    machine.run();
}

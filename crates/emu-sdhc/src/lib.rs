//! SD-host controller emulation: the USDHC register front-end and the SD
//! card protocol handler it drives, backed by a raw disk image.

pub mod card;
pub mod usdhc;

pub use card::{SdCard, SdCardError};
pub use usdhc::UsdhcController;

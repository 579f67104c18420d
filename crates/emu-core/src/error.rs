use thiserror::Error;

/// Errors surfaced while assembling or configuring the emulated machine.
///
/// Guest-visible failures (unmapped access, protocol desync) are not errors;
/// they degrade per the component contracts. These variants are boot-time
/// configuration problems and end up reported by the CLI.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A device registration collides with an already-bound address range.
    #[error("device range {base:#010x}..={end:#010x} overlaps an existing device")]
    DeviceOverlap { base: u32, end: u32 },

    /// The firmware descriptor does not resolve a required symbol.
    #[error("firmware descriptor is missing symbol `{0}`")]
    MissingSymbol(String),

    /// The firmware descriptor does not name a required code range.
    #[error("firmware descriptor is missing code range `{0}`")]
    MissingRange(String),

    /// A descriptor config entry exists but cannot be decoded as requested.
    #[error("firmware descriptor config `{key}` is malformed: {message}")]
    BadConfig { key: String, message: String },
}

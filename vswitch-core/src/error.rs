use thiserror::Error;

/// Errors surfaced out of the switch's lifecycle. Everything else (decode
/// failures, rejected peer-table writes, transient TAP read errors) is
/// logged in place and never reaches this type.
#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("failed to open or configure the TAP device: {0}")]
    Tap(std::io::Error),

    #[error("failed to bind the UDP socket: {0}")]
    Bind(std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SwitchError>;

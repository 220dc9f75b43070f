use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    /// Nothing to capture from. The host should stop and ask for operator help.
    #[error("no capture devices found; is libpcap/Npcap installed and are we privileged?")]
    NoDevices,

    #[error("capture device not found: {0}")]
    DeviceNotFound(String),

    #[error("capture backend error: {0}")]
    Capture(#[from] pcap::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("model training failed: {0}")]
    Training(String),
}

pub type Result<T> = std::result::Result<T, SensorError>;

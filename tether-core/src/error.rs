use thiserror::Error;

/// Errors returned by the public sharing operations.
///
/// Every variant has a stable numeric [`code`](ShareError::code) that an IPC layer can forward
/// unchanged.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShareError {
    #[error("sharing is not supported")]
    NotSupported,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("wifi sharing failed")]
    WifiSharing,
    #[error("usb sharing failed")]
    UsbSharing,
    #[error("bluetooth sharing failed")]
    BluetoothSharing,
    #[error("interface configuration failed")]
    IfaceCfg,
    #[error("enabling forwarding failed")]
    EnableForwarding,
    #[error("internal error")]
    InternalError,
    #[error("too many listeners registered")]
    ListenerLimit,
}

impl ShareError {
    pub const fn code(&self) -> i32 {
        match self {
            Self::NotSupported => 2202101,
            Self::InvalidParam => 2202102,
            Self::WifiSharing => 2202104,
            Self::UsbSharing => 2202105,
            Self::BluetoothSharing => 2202106,
            Self::IfaceCfg => 2202107,
            Self::EnableForwarding => 2202108,
            Self::InternalError => 2202109,
            Self::ListenerLimit => 2202110,
        }
    }
}

pub type Result<T> = std::result::Result<T, ShareError>;

/// A session-wide failure. Moves the main state machine to `Error`, which forwards it to
/// every known link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionError {
    IpForwardingEnable,
    IpForwardingDisable,
    /// The DNS proxy could not be started.
    StartSharing,
    /// The DNS proxy could not be stopped while the session was still alive.
    StopSharing,
    SetDnsForwarders,
}

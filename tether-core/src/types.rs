use std::fmt;

use crate::ShareError;

/// A downstream transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SharingType {
    Wifi,
    Usb,
    Bluetooth,
}

impl SharingType {
    pub const ALL: [SharingType; 3] = [Self::Wifi, Self::Usb, Self::Bluetooth];

    /// The error reported when this technology's backend fails.
    pub const fn sharing_error(&self) -> ShareError {
        match self {
            Self::Wifi => ShareError::WifiSharing,
            Self::Usb => ShareError::UsbSharing,
            Self::Bluetooth => ShareError::BluetoothSharing,
        }
    }
}

impl fmt::Display for SharingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wifi => f.write_str("wifi"),
            Self::Usb => f.write_str("usb"),
            Self::Bluetooth => f.write_str("bluetooth"),
        }
    }
}

/// Per-interface state as seen by listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharingIfaceState {
    /// Ready to share.
    CanServe,
    /// Sharing.
    Serving,
    /// Down, or the last attempt failed.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficKind {
    Rx,
    Tx,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WifiApState {
    Idle,
    Starting,
    Started,
    Closing,
    #[default]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BtPanState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UsbFunctionState {
    #[default]
    Disabled,
    RndisEnabling,
    RndisEnabled,
    Disabling,
}

/// Last reported state of one technology's backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendState {
    Wifi(WifiApState),
    Bluetooth(BtPanState),
    Usb(UsbFunctionState),
}

impl BackendState {
    pub fn initial(ty: SharingType) -> Self {
        match ty {
            SharingType::Wifi => Self::Wifi(WifiApState::default()),
            SharingType::Usb => Self::Usb(UsbFunctionState::default()),
            SharingType::Bluetooth => Self::Bluetooth(BtPanState::default()),
        }
    }

    pub fn technology(&self) -> SharingType {
        match self {
            Self::Wifi(_) => SharingType::Wifi,
            Self::Usb(_) => SharingType::Usb,
            Self::Bluetooth(_) => SharingType::Bluetooth,
        }
    }

    /// True while the backend is bringing its interface up. Interface-up events for this
    /// technology only matter in these states.
    pub fn accepts_up(&self) -> bool {
        matches!(
            self,
            Self::Wifi(WifiApState::Starting | WifiApState::Started)
                | Self::Bluetooth(BtPanState::Connecting | BtPanState::Connected)
                | Self::Usb(UsbFunctionState::RndisEnabling | UsbFunctionState::RndisEnabled)
        )
    }

    /// True while the backend is tearing its interface down, or has done so.
    pub fn accepts_down(&self) -> bool {
        matches!(
            self,
            Self::Wifi(WifiApState::Idle | WifiApState::Closing | WifiApState::Closed)
                | Self::Bluetooth(BtPanState::Disconnecting | BtPanState::Disconnected)
                | Self::Usb(UsbFunctionState::Disabling | UsbFunctionState::Disabled)
        )
    }

    /// True once the backend has shut down and its links should be torn down.
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            Self::Wifi(WifiApState::Idle | WifiApState::Closed)
                | Self::Bluetooth(BtPanState::Disconnected)
                | Self::Usb(UsbFunctionState::Disabled)
        )
    }

    /// True once the backend is serving and its link should be requested.
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            Self::Wifi(WifiApState::Started)
                | Self::Bluetooth(BtPanState::Connected)
                | Self::Usb(UsbFunctionState::RndisEnabling | UsbFunctionState::RndisEnabled)
        )
    }
}

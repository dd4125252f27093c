//! GSM modem protocol stack: command rendering, reply parsing, and the
//! coordinator that pairs them over the UART.

pub mod command;
pub mod coordinator;
pub mod extract;
pub mod modules;
pub mod reply;

pub use command::{Command, CommandKind};
pub use coordinator::{Coordinator, CoordinatorHandle, LinkState};
pub use reply::Reply;

/// Phone functionality levels for `AT+CFUN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfunType {
    Minimum,
    Full,
    DisableTxRx,
}

impl CfunType {
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Minimum => 0,
            Self::Full => 1,
            Self::DisableTxRx => 4,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Minimum),
            1 => Some(Self::Full),
            4 => Some(Self::DisableTxRx),
            _ => None,
        }
    }
}

/// SIM PIN states reported by `+CPIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinStatus {
    Ready,
    AwaitingPin,
    AwaitingPuk,
}

/// `+CMEE` verbosity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorVerbosity {
    Disable,
    Code,
    Verbose,
}

impl ErrorVerbosity {
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Disable => 0,
            Self::Code => 1,
            Self::Verbose => 2,
        }
    }
}

/// Bearer context profiles. The modem numbers them 1-3 on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerProfile {
    Profile0,
    Profile1,
    Profile2,
}

impl BearerProfile {
    #[must_use]
    pub fn cid(self) -> u8 {
        match self {
            Self::Profile0 => 1,
            Self::Profile1 => 2,
            Self::Profile2 => 3,
        }
    }

    #[must_use]
    pub fn from_cid(cid: u8) -> Option<Self> {
        match cid {
            1 => Some(Self::Profile0),
            2 => Some(Self::Profile1),
            3 => Some(Self::Profile2),
            _ => None,
        }
    }
}

/// Bearer context states reported by `+SAPBR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerStatus {
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// HTTP request methods the modem's HTTP stack supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Head,
}

impl HttpMethod {
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Get => 0,
            Self::Post => 1,
            Self::Head => 2,
        }
    }
}

/// A passive listener registered with the coordinator. Sees every parsed
/// reply, solicited or not.
pub trait GsmModule: Send + Sync {
    fn incoming_reply(&self, reply: &Reply);
}

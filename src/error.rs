// Copyright © 2026 Rudis Laboratories LLC

use num_derive::FromPrimitive;
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::fmt;
use thiserror::Error;

/// SMP v1 return codes, reported by the device in the `rc` field.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize_repr, Deserialize_repr)]
pub enum ReturnCode {
    Ok = 0,
    Unknown = 1,
    NoMemory = 2,
    InValue = 3,
    Timeout = 4,
    NoEntry = 5,
    BadState = 6,
    TooLarge = 7,
    NotSupported = 8,
    Corrupt = 9,
    Busy = 10,
    AccessDenied = 11,
    UnsupportedTooOld = 12,
    UnsupportedTooNew = 13,
    PerUser = 256,
}

impl ReturnCode {
    pub fn from_raw(rc: i32) -> Option<ReturnCode> {
        num::FromPrimitive::from_i32(rc)
    }
}

/// SMP v2 group return code, reported in the `err` map as `{group, rc}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupReturnCode {
    pub group: u16,
    pub rc: i32,
}

impl fmt::Display for GroupReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group {} rc {}", self.group, self.rc)
    }
}

fn device_error_message(rc: &i32, group_rc: &Option<GroupReturnCode>) -> String {
    let name = match ReturnCode::from_raw(*rc) {
        Some(code) => format!("{code:?}"),
        None => "unrecognized".to_string(),
    };
    match group_rc {
        Some(g) => format!("rc={rc} ({name}), {g}"),
        None => format!("rc={rc} ({name})"),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for a response")]
    Timeout,

    #[error("device disconnected")]
    Disconnected,

    #[error("malformed header: expected 8 bytes, got {0}")]
    MalformedHeader(usize),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("CBOR codec error: {0}")]
    Codec(#[from] serde_cbor::Error),

    #[error("device error: {}", device_error_message(.rc, .group_rc))]
    Device {
        rc: i32,
        group_rc: Option<GroupReturnCode>,
    },

    #[error("insufficient MTU: packet needs {required} bytes, link allows {mtu}")]
    InsufficientMtu { required: usize, mtu: usize },

    #[error("operation aborted by user")]
    Aborted,

    #[error("image is not pending after test request")]
    ImageNotPending,

    #[error("image is not confirmed after confirm request")]
    ImageNotConfirmed,

    #[error("device state did not settle after {0} reset/validate cycles")]
    RevalidationLimitExceeded(u32),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Device-reported error with the given raw return code.
    pub fn device(rc: i32) -> Error {
        Error::Device { rc, group_rc: None }
    }

    /// The SMP v1 return code, if this is a device error with a known code.
    pub fn return_code(&self) -> Option<ReturnCode> {
        match self {
            Error::Device { rc, .. } => ReturnCode::from_raw(*rc),
            _ => None,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Io(_) | Error::Timeout | Error::Disconnected
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

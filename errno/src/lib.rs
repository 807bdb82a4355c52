// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Stable error codes for the datapath control channel.
//!
//! Replies carry one of these codes in their `error` field; the daemon side
//! translates them to its own error type. The numeric values are part of the
//! wire contract and must not change.

/// Error codes returned on the control channel.
///
/// Values follow the classic errno numbering so that a daemon written against
/// the C conventions decodes them without a translation table. `Eof` is the
/// dump-iterator exhaustion marker, not an error in the usual sense.
#[repr(i16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrCode {
    /// Referenced flow or vport does not exist.
    #[error("no such entry")]
    NoEnt = 2,
    /// Table full or ring saturated.
    #[error("no space left")]
    NoSpc = 28,
    /// Malformed message, unknown action, or invalid key.
    #[error("invalid argument")]
    Inval = 22,
    /// Unknown vport type or pipeline unavailable.
    #[error("no such device")]
    NoDev = 19,
    /// Requested physical port is in use.
    #[error("device busy")]
    Busy = 16,
    /// Flow key already present when CREATE-only was requested.
    #[error("entry exists")]
    Exist = 17,
    /// Ring saturated; the buffer was dropped.
    #[error("no buffer space")]
    NoBufs = 105,
    /// Dump iterator exhausted.
    #[error("end of dump")]
    Eof = 255,
}

impl ErrCode {
    /// Wire representation used in the `error` field of replies.
    #[must_use]
    pub const fn as_wire(self) -> i16 {
        self as i16
    }

    /// Decode a reply `error` field. Zero means success and decodes to `None`;
    /// unknown non-zero values collapse to `Inval`.
    #[must_use]
    pub fn from_wire(raw: i16) -> Option<ErrCode> {
        match raw {
            0 => None,
            2 => Some(ErrCode::NoEnt),
            16 => Some(ErrCode::Busy),
            17 => Some(ErrCode::Exist),
            19 => Some(ErrCode::NoDev),
            28 => Some(ErrCode::NoSpc),
            105 => Some(ErrCode::NoBufs),
            255 => Some(ErrCode::Eof),
            _ => Some(ErrCode::Inval),
        }
    }
}

/// Shorthand for control-path results that report an [`ErrCode`] on failure.
pub type CtlResult<T> = Result<T, ErrCode>;

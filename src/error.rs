//! Error types and codes for the bootloader core.
//!
//! Errors travel as values through `Result`; the numeric codes mirror
//! the wire-facing convention where failures are reported as negated
//! integers (e.g. `InvalidState` surfaces as -10001).

/// Top level error type for the bootloader core.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The storage backend failed mid-operation.
    Storage(&'static str),
    /// The requested operation is not permitted in the current boot state.
    InvalidState,
    /// A download would grow the image past the configured maximum.
    ImageTooLarge,
    /// The storage backend acknowledged fewer bytes than requested.
    StorageWriteFailure,
    /// The CAN driver reported a fault.
    DriverError,
    /// The field protocol was violated or timed out beyond recovery.
    ProtocolError,
    /// The transfer was cancelled before completion.
    TransferCancelledByRemote,
    /// The file server reported a filesystem error for the requested path.
    RemoteRefusedToProvideFile,
}

impl Error {
    /// The numeric code for this error, already negated for reporting.
    ///
    /// Backend faults carry no protocol-assigned number and map to -1.
    pub const fn code(self) -> i16 {
        match self {
            Error::Storage(_) => -1,
            Error::InvalidState => -10001,
            Error::ImageTooLarge => -10002,
            Error::StorageWriteFailure => -10003,
            Error::DriverError => -30002,
            Error::ProtocolError => -30003,
            Error::TransferCancelledByRemote => -30004,
            Error::RemoteRefusedToProvideFile => -30005,
        }
    }
}

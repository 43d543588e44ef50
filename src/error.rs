//! Crate-wide error taxonomy.
//!
//! Each layer defines its own error enum; [`ProtoserialError`] composes them
//! for callers that don't want to match on the specific layer. Parse-time
//! framing errors are *not* part of this taxonomy: they are recovered
//! silently by the link layer's byte-at-a-time resync and never reach a
//! caller (see [`crate::link`]).

use thiserror::Error;

/// Errors raised by [`crate::container::Bytes`]'s checked accessors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ContainerError {
    /// Index was outside `0..len()`.
    #[error("index {idx} out of range for buffer of length {len}")]
    OutOfRange {
        /// Rejected index.
        idx: usize,
        /// Buffer's payload length at the time of access.
        len: usize,
    },
}

/// Errors raised while transmitting through the link layer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// Payload was empty or exceeded `max_payload`.
    #[error("bad payload: length {len} outside 1..={max}")]
    BadPayload {
        /// Length of the rejected payload.
        len: usize,
        /// Configured `max_payload` for the link.
        max: usize,
    },
    /// Destination address was 0, or equal to the source address.
    #[error("no destination (dest={dest}, src={src})")]
    NoDestination {
        /// Rejected destination address.
        dest: u8,
        /// Local source address.
        src: u8,
    },
    /// The transmit queue is at `max_queue_size`.
    #[error("transmit queue full")]
    NotWritable,
}

/// Errors raised by the transfer layer's synchronous entry points.
///
/// Completion outcomes (`DONE`/`UNREACHABLE`/`TIMEDOUT`/`DROPPED`) are not
/// errors; they are delivered through [`crate::transfer::TransferComplete`]
/// events, per the propagation policy.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// `submit` was called with an empty payload.
    #[error("empty payload")]
    EmptyPayload,
    /// `submit` was called with a payload too large to fragment with the
    /// configured `max_fragment_size` and an 8-bit fragment index.
    #[error("payload too large: {len} bytes needs more than 255 fragments at size {max_fragment_size}")]
    PayloadTooLarge {
        /// Rejected payload length.
        len: usize,
        /// Configured fragment size.
        max_fragment_size: usize,
    },
}

/// Errors raised by the port multiplexer's registry.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    /// A service or interface was already registered under this key.
    #[error("already registered")]
    AlreadyRegistered,
    /// Port 0 was used, which is reserved.
    #[error("invalid port")]
    InvalidPort,
}

/// Union of every layer's error type.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtoserialError {
    /// See [`ContainerError`].
    #[error(transparent)]
    Container(#[from] ContainerError),
    /// See [`LinkError`].
    #[error(transparent)]
    Link(#[from] LinkError),
    /// See [`TransferError`].
    #[error(transparent)]
    Transfer(#[from] TransferError),
    /// See [`PortError`].
    #[error(transparent)]
    Port(#[from] PortError),
}

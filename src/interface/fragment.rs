//! The link-layer [`Fragment`] type.

use web_time::Instant;

use crate::container::Bytes;
use crate::interface::InterfaceId;

/// Identifies one specific, ephemeral fragment instance, used to correlate
/// a `tx_complete` notification from the byte transport back to the
/// transfer handler that produced the fragment (since the transport only
/// knows about bytes, not transfer state).
///
/// Monotonically increasing per process; wraparound is not a practical
/// concern (`u64`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    pub(crate) fn next(counter: &mut u64) -> Self {
        *counter += 1;
        Self(*counter)
    }
}

/// One framed unit on the wire, belonging to exactly one transfer.
///
/// `data` holds exactly the payload delivered to/received from the peer in
/// one framed unit: on transmit, everything above the link-layer preamble
/// (transfer header, port header, application bytes); on receive, the
/// validated payload between the link header and the footer.
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Peer address this fragment came from (incoming) or is addressed to
    /// (outgoing). Never 0.
    pub source: u8,
    /// Local address (outgoing) or the matched local/broadcast address
    /// (incoming). Never 0.
    pub destination: u8,
    /// Which interface this fragment was received from / will be sent on.
    pub interface_id: InterfaceId,
    /// When this fragment was constructed.
    pub created_at: Instant,
    /// Fragment payload (link-layer payload, i.e. everything the footer
    /// covers besides the link header).
    pub data: Bytes,
    /// Ephemeral identity used to correlate `tx_complete`. Assigned when
    /// the fragment is hand off to the transmit queue; `None` for an
    /// incoming fragment.
    pub object_id: Option<ObjectId>,
}

impl Fragment {
    /// Creates a fragment with no ephemeral identity assigned yet.
    #[must_use]
    pub fn new(
        source: u8,
        destination: u8,
        interface_id: InterfaceId,
        created_at: Instant,
        data: Bytes,
    ) -> Self {
        Self {
            source,
            destination,
            interface_id,
            created_at,
            data,
            object_id: None,
        }
    }
}

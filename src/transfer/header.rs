//! Transfer-layer header encode/decode.

/// Transfer fragment kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Carries a slice of the transfer's payload.
    Fragment,
    /// Acknowledges a bordering fragment, carries no payload.
    Ack,
    /// Requests retransmission of a specific fragment index.
    Req,
}

impl TransferKind {
    fn to_byte(self) -> u8 {
        match self {
            Self::Fragment => 1,
            Self::Ack => 2,
            Self::Req => 3,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Fragment),
            2 => Some(Self::Ack),
            3 => Some(Self::Req),
            _ => None,
        }
    }
}

/// Per-fragment transfer header: `type, fragment_index, fragments_total,
/// id, prev_id, check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHeader {
    /// What this fragment carries.
    pub kind: TransferKind,
    /// 1-based index of this fragment within the transfer.
    pub fragment_index: u8,
    /// Total fragment count of the transfer.
    pub fragments_total: u8,
    /// Transfer identifier, non-zero.
    pub id: u8,
    /// The request this transfer is a response to, or 0.
    pub prev_id: u8,
}

impl TransferHeader {
    /// Encoded size in bytes.
    pub const ENCODED_LEN: usize = 6;

    fn checksum(&self) -> u8 {
        self.kind
            .to_byte()
            .wrapping_add(self.fragment_index)
            .wrapping_add(self.fragments_total)
            .wrapping_add(self.id)
            .wrapping_add(self.prev_id)
    }

    /// Encodes this header.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        [
            self.kind.to_byte(),
            self.fragment_index,
            self.fragments_total,
            self.id,
            self.prev_id,
            self.checksum(),
        ]
    }

    /// Decodes a header, verifying the checksum and that `fragment_index`
    /// falls within `1..=fragments_total`.
    #[must_use]
    pub fn decode(buf: &[u8; Self::ENCODED_LEN]) -> Option<Self> {
        let kind = TransferKind::from_byte(buf[0])?;
        let header = Self {
            kind,
            fragment_index: buf[1],
            fragments_total: buf[2],
            id: buf[3],
            prev_id: buf[4],
        };
        if header.checksum() != buf[5] {
            return None;
        }
        if header.fragment_index == 0 || header.fragment_index > header.fragments_total {
            return None;
        }
        if header.id == 0 {
            return None;
        }
        Some(header)
    }
}

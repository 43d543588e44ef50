//! Incoming transfer state machine.
//!
//! A transfer is admitted only via its first fragment; the worst-case
//! payload buffer is sized from that fragment's length times
//! `fragments_total` and shrunk to the exact size once the last fragment
//! arrives, mirroring `transfer_handler`'s receive constructor.

use std::time::Duration;

use bit_vec::BitVec;
use web_time::Instant;

use crate::container::Bytes;

/// Lifecycle state of an incoming transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingState {
    /// Still waiting on one or more fragments.
    Collecting,
    /// Complete; absorbing duplicates until `until`.
    Holding {
        /// When the hold window ends and this transfer should be erased.
        until: Instant,
    },
}

/// One incoming transfer being reassembled from fragments.
pub struct IncomingTransfer {
    pub(super) id: u8,
    pub(super) prev_id: u8,
    pub(super) source: u8,
    pub(super) destination: u8,
    fragments_total: u8,
    max_fragment_data_size: usize,
    payload: Bytes,
    received: BitVec,
    received_count: u8,
    state: IncomingState,
    pub(super) last_rx_time: Instant,
    pub(super) created_at: Instant,
    ack_emitted: bool,
    delivered: bool,
    earliest_missing_since: Option<(u8, Instant)>,
    last_req_sent_for: Option<u8>,
}

impl IncomingTransfer {
    /// Admits a new incoming transfer from its first fragment.
    /// `first_fragment_data` is the transfer-layer payload slice carried by
    /// fragment index 1 (excludes the transfer header).
    pub(super) fn admit(
        id: u8,
        prev_id: u8,
        fragments_total: u8,
        source: u8,
        destination: u8,
        first_fragment_data: &[u8],
        now: Instant,
    ) -> Self {
        let max_fragment_data_size = first_fragment_data.len();
        let worst_case_back = usize::from(fragments_total.saturating_sub(1)) * max_fragment_data_size;
        let payload = Bytes::copy_from_slice_with_slack(first_fragment_data, 0, worst_case_back);

        let mut received = BitVec::from_elem(usize::from(fragments_total), false);
        if fragments_total > 0 {
            received.set(0, true);
        }

        Self {
            id,
            prev_id,
            source,
            destination,
            fragments_total,
            max_fragment_data_size: max_fragment_data_size.max(1),
            payload,
            received,
            received_count: 1,
            state: IncomingState::Collecting,
            last_rx_time: now,
            created_at: now,
            ack_emitted: false,
            delivered: false,
            earliest_missing_since: None,
            last_req_sent_for: None,
        }
    }

    #[must_use]
    pub(super) fn is_complete(&self) -> bool {
        self.received_count == self.fragments_total
    }

    #[must_use]
    pub(super) fn fragments_total(&self) -> u8 {
        self.fragments_total
    }

    #[must_use]
    pub(super) fn state(&self) -> IncomingState {
        self.state
    }

    /// Inserts fragment `pos`'s data. Idempotent on an already-received
    /// index (duplicate, harmless).
    pub(super) fn put_fragment(&mut self, pos: u8, data: &[u8], now: Instant) -> bool {
        if pos == 0 || pos > self.fragments_total {
            return false;
        }
        if data.len() > self.max_fragment_data_size {
            return false;
        }
        self.last_rx_time = now;
        let idx = usize::from(pos - 1);
        if self.received[idx] {
            return true;
        }
        let start = idx * self.max_fragment_data_size;
        self.payload.as_mut_slice()[start..start + data.len()].copy_from_slice(data);
        self.received.set(idx, true);
        self.received_count += 1;

        if pos == self.fragments_total {
            let shrink_back = self.max_fragment_data_size - data.len();
            self.payload.shrink(0, shrink_back);
        }
        if self.is_complete() {
            self.earliest_missing_since = None;
        }
        true
    }

    /// Takes the reassembled payload once complete. Panics if called
    /// before [`Self::is_complete`].
    pub(super) fn take_payload(&mut self) -> Bytes {
        assert!(self.is_complete(), "take_payload before reassembly complete");
        self.delivered = true;
        std::mem::take(&mut self.payload)
    }

    /// True once [`Self::take_payload`] has been called.
    #[must_use]
    pub(super) fn is_delivered(&self) -> bool {
        self.delivered
    }

    /// True once complete and ready to send the final ACK (fires once).
    #[must_use]
    pub(super) fn is_ack_ready(&self) -> bool {
        self.is_complete() && !self.ack_emitted && matches!(self.state, IncomingState::Collecting)
    }

    pub(super) fn mark_ack_emitted(&mut self, now: Instant, hold_duration: Duration) {
        self.ack_emitted = true;
        self.state = IncomingState::Holding {
            until: now + hold_duration,
        };
    }

    /// True if `now` is past this transfer's hold window.
    #[must_use]
    pub(super) fn hold_expired(&self, now: Instant) -> bool {
        matches!(self.state, IncomingState::Holding { until } if now >= until)
    }

    /// True if any fragment is unfilled for longer than `holdoff`, in which
    /// case a `FRAGMENT_REQ` for the earliest missing index should be
    /// (re-)sent.
    pub(super) fn retransmit_request_due(&mut self, now: Instant, holdoff: Duration) -> Option<u8> {
        let missing = (1..=self.fragments_total).find(|&i| !self.received[usize::from(i - 1)])?;

        match self.earliest_missing_since {
            Some((idx, since)) if idx == missing => {
                if now.saturating_duration_since(since) >= holdoff
                    && self.last_req_sent_for != Some(missing)
                {
                    self.last_req_sent_for = Some(missing);
                    Some(missing)
                } else {
                    None
                }
            }
            _ => {
                self.earliest_missing_since = Some((missing, now));
                self.last_req_sent_for = None;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_and_reassembles() {
        let now = Instant::now();
        let mut t = IncomingTransfer::admit(1, 0, 3, 9, 1, &[0x01, 0x02], now);
        assert!(!t.is_complete());
        assert!(t.put_fragment(2, &[0x03, 0x04], now));
        assert!(!t.is_complete());
        assert!(t.put_fragment(3, &[0x05], now));
        assert!(t.is_complete());
        let payload = t.take_payload();
        assert_eq!(payload.as_slice(), &[0x01, 0x02, 0x03, 0x04, 0x05]);
    }

    #[test]
    fn duplicate_fragment_is_idempotent() {
        let now = Instant::now();
        let mut t = IncomingTransfer::admit(1, 0, 1, 9, 1, &[0xAA], now);
        assert!(t.is_complete());
        assert!(t.put_fragment(1, &[0xAA], now));
        assert!(t.is_complete());
    }

    #[test]
    fn retransmit_request_waits_out_holdoff() {
        let now = Instant::now();
        let mut t = IncomingTransfer::admit(1, 0, 3, 9, 1, &[0x01], now);
        assert_eq!(t.retransmit_request_due(now, Duration::from_millis(50)), None);
        let later = now + Duration::from_millis(60);
        assert_eq!(
            t.retransmit_request_due(later, Duration::from_millis(50)),
            Some(2)
        );
        // Doesn't re-fire for the same missing index immediately after.
        assert_eq!(
            t.retransmit_request_due(later, Duration::from_millis(50)),
            None
        );
    }
}

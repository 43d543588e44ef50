//! Transfer layer: fragmentation, per-fragment ACK/REQ, retransmission,
//! duplicate suppression, per-peer rate control, and bordering-fragment
//! RTT.

mod header;
mod id;
mod incoming;
mod outgoing;
mod rate;
mod rtt;

pub use header::{TransferHeader, TransferKind};
pub use id::IdAllocator;
pub use outgoing::TransferOutcome;
pub use rate::{PeerState, PeerTable};
pub use rtt::RttEstimator;

use std::time::Duration;

use web_time::Instant;

use crate::container::Bytes;
use crate::error::{LinkError, TransferError};
use crate::interface::{Fragment, InterfaceId, ObjectId};
use crate::observer::Subject;

use incoming::IncomingTransfer;
use outgoing::OutgoingTransfer;

/// Per-link transfer layer configuration.
#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    /// Upper bound on framed link payload bytes; the transfer header
    /// (6 bytes) is carved out of this to get the per-fragment payload
    /// budget for outgoing transfers.
    pub max_fragment_size: usize,
    /// Nominal link transmit bitrate, used to size outgoing drop timeouts.
    pub tx_rate: f64,
    /// Nominal link receive bitrate, used to size incoming drop timeouts
    /// and the retransmit-request holdoff.
    pub rx_rate: f64,
    /// Initial assumed per-peer transmit rate (bits/s) before any samples.
    pub peer_rate: f64,
    /// Scales the minimum gap before a `FRAGMENT_REQ` is issued (incoming
    /// side) or a bordering fragment whose ACK never arrived is re-sent
    /// (outgoing side).
    pub retransmit_holdoff_multiplier: f64,
    /// Bounds how many times an unacknowledged bordering fragment is
    /// re-sent, as a multiple of the transfer's fragment count, before the
    /// transfer is left to the inactivity timeout.
    pub retransmit_limit_multiplier: f64,
    /// Scales drop timeouts (`max_fragment_size / rate * multiplier`).
    pub inactivity_timeout_multiplier: f64,
    /// Lower bound on the duplicate-absorb window after a transfer
    /// completes.
    pub minimum_incoming_hold_time: Duration,
    /// Per-peer rate divisor on an unfavourable signal (missing ACK, REQ on
    /// a bordering fragment).
    pub tr_decrease: f64,
    /// Per-peer rate multiplier on a favourable completion.
    pub tr_increase: f64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_fragment_size: 64,
            tx_rate: 9600.0,
            rx_rate: 9600.0,
            peer_rate: 9600.0,
            retransmit_holdoff_multiplier: 2.0,
            retransmit_limit_multiplier: 4.0,
            inactivity_timeout_multiplier: 8.0,
            minimum_incoming_hold_time: Duration::from_millis(50),
            tr_decrease: 2.0,
            tr_increase: 1.1,
        }
    }
}

impl TransferConfig {
    fn max_fragment_data_size(&self) -> usize {
        self.max_fragment_size.saturating_sub(TransferHeader::ENCODED_LEN)
    }
}

/// What the transfer layer hands its fragments to. Implemented by
/// [`crate::link::LinkLayer`]. Passed in per call rather than stored, so
/// the transfer layer holds no back-reference to its link.
pub trait LinkSink {
    /// Queues a fragment for transmission.
    fn transmit(&mut self, fragment: Fragment) -> Result<ObjectId, LinkError>;
    /// Whether another fragment may currently be queued.
    fn transmit_ready(&self) -> bool;
}

impl LinkSink for crate::link::LinkLayer {
    fn transmit(&mut self, fragment: Fragment) -> Result<ObjectId, LinkError> {
        Self::transmit(self, fragment)
    }

    fn transmit_ready(&self) -> bool {
        Self::transmit_ready(self)
    }
}

/// A fully reassembled (incoming) or about-to-be-fragmented (outgoing)
/// application-level message.
#[derive(Debug, Clone)]
pub struct Transfer {
    /// This transfer's identifier.
    pub id: u8,
    /// The request this is a response to, or 0.
    pub prev_id: u8,
    /// Peer address.
    pub source: u8,
    /// Local address.
    pub destination: u8,
    /// Full reassembled payload.
    pub payload: Bytes,
}

/// Fires exactly once per outgoing transfer, terminating its lifetime.
#[derive(Debug, Clone, Copy)]
pub struct TransferComplete {
    /// The transfer this outcome belongs to.
    pub id: u8,
    /// The peer it was addressed to.
    pub destination: u8,
    /// What happened to it.
    pub outcome: TransferOutcome,
}

/// Drives fragmentation, reassembly and reliability for one link.
pub struct TransferLayer {
    config: TransferConfig,
    local_address: u8,
    interface_id: InterfaceId,
    ids: IdAllocator,
    outgoing: std::collections::HashMap<u8, OutgoingTransfer>,
    incoming: std::collections::HashMap<u8, IncomingTransfer>,
    peers: PeerTable,
    /// Fires once per fully reassembled incoming transfer.
    pub received: Subject<Transfer>,
    /// Fires once per outgoing transfer, on completion/drop.
    pub complete: Subject<TransferComplete>,
}

impl TransferLayer {
    /// Creates a transfer layer for one link.
    #[must_use]
    pub fn new(config: TransferConfig, local_address: u8, interface_id: InterfaceId) -> Self {
        Self {
            config,
            local_address,
            interface_id,
            ids: IdAllocator::new(),
            outgoing: std::collections::HashMap::new(),
            incoming: std::collections::HashMap::new(),
            peers: PeerTable::new(),
            received: Subject::new(),
            complete: Subject::new(),
        }
    }

    /// Read-only access to per-peer bookkeeping, for diagnostics.
    #[must_use]
    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Submits `payload` as a new outgoing transfer to `destination`.
    /// Returns the allocated transfer ID.
    pub fn submit(
        &mut self,
        destination: u8,
        prev_id: u8,
        payload: Bytes,
        now: Instant,
    ) -> Result<u8, TransferError> {
        if payload.is_empty() {
            return Err(TransferError::EmptyPayload);
        }
        let max_fragment_data_size = self.config.max_fragment_data_size();
        let fragments_needed =
            payload.len() / max_fragment_data_size + usize::from(payload.len() % max_fragment_data_size != 0);
        if fragments_needed > 255 {
            return Err(TransferError::PayloadTooLarge {
                len: payload.len(),
                max_fragment_size: self.config.max_fragment_size,
            });
        }

        let id = self.ids.next();
        let transfer = OutgoingTransfer::new(
            id,
            prev_id,
            destination,
            self.local_address,
            payload,
            max_fragment_data_size,
            now,
        );
        self.outgoing.insert(id, transfer);
        self.peers.entry(destination, self.config.peer_rate, now);
        Ok(id)
    }

    /// Feeds a received link-layer fragment into the transfer state
    /// machine. `fragment.data` is the transfer header followed by its
    /// payload (or nothing, for ACK/REQ).
    pub fn handle_fragment(&mut self, fragment: &Fragment, now: Instant) {
        let data = fragment.data.as_slice();
        if data.len() < TransferHeader::ENCODED_LEN {
            tracing::trace!("fragment too short for a transfer header, dropped");
            return;
        }
        let mut hdr_bytes = [0u8; TransferHeader::ENCODED_LEN];
        hdr_bytes.copy_from_slice(&data[..TransferHeader::ENCODED_LEN]);
        let Some(header) = TransferHeader::decode(&hdr_bytes) else {
            tracing::trace!("bad transfer header checksum, dropped");
            return;
        };
        let rest = &data[TransferHeader::ENCODED_LEN..];

        self.peers
            .entry(fragment.source, self.config.peer_rate, now)
            .mark_activity(now);

        match header.kind {
            TransferKind::Fragment => {
                self.handle_incoming_fragment(header, fragment.source, fragment.destination, rest, now);
            }
            TransferKind::Ack => self.handle_ack(header, fragment.source, now),
            TransferKind::Req => self.handle_req(header, fragment.source, now),
        }
    }

    fn handle_incoming_fragment(
        &mut self,
        header: TransferHeader,
        source: u8,
        destination: u8,
        data: &[u8],
        now: Instant,
    ) {
        if let Some(existing) = self.incoming.get_mut(&header.id) {
            if existing.source != source || existing.fragments_total() != header.fragments_total {
                tracing::trace!(id = header.id, "stale transfer id reused by another peer, ignored");
                return;
            }
            existing.put_fragment(header.fragment_index, data, now);
            if existing.is_complete() && !existing.is_delivered() {
                let payload = existing.take_payload();
                self.received.emit(&Transfer {
                    id: existing.id,
                    prev_id: existing.prev_id,
                    source: existing.source,
                    destination: existing.destination,
                    payload,
                });
            }
        } else if header.fragment_index == 1 {
            let transfer = IncomingTransfer::admit(
                header.id,
                header.prev_id,
                header.fragments_total,
                source,
                destination,
                data,
                now,
            );
            let delivered_now = transfer.is_complete();
            self.incoming.insert(header.id, transfer);
            if delivered_now {
                let existing = self.incoming.get_mut(&header.id).expect("just inserted");
                let payload = existing.take_payload();
                self.received.emit(&Transfer {
                    id: existing.id,
                    prev_id: existing.prev_id,
                    source: existing.source,
                    destination: existing.destination,
                    payload,
                });
            }
        } else {
            tracing::trace!(
                id = header.id,
                fragment = header.fragment_index,
                "non-first fragment of unknown transfer, ignored"
            );
        }
    }

    fn handle_ack(&mut self, header: TransferHeader, source: u8, now: Instant) {
        let Some(out) = self.outgoing.get(&header.id) else {
            return;
        };
        if out.destination != source || !out.on_ack(header.fragment_index) {
            return;
        }
        if let Some(last_tx) = out.last_tx_time {
            self.peers
                .entry(source, self.config.peer_rate, now)
                .sample_rtt(now.saturating_duration_since(last_tx));
        }
        self.peers
            .entry(source, self.config.peer_rate, now)
            .on_favourable(self.config.tr_increase);

        let id = header.id;
        let destination = source;
        self.outgoing.remove(&header.id);
        self.complete.emit(&TransferComplete {
            id,
            destination,
            outcome: TransferOutcome::Done,
        });
    }

    fn handle_req(&mut self, header: TransferHeader, source: u8, now: Instant) {
        let Some(out) = self.outgoing.get_mut(&header.id) else {
            return;
        };
        if out.destination != source {
            return;
        }
        if out.on_retransmit_request(header.fragment_index, now) {
            self.peers
                .entry(source, self.config.peer_rate, now)
                .on_unfavourable(self.config.tr_decrease);
        }
    }

    /// Drives the transfer layer's main loop for one tick: walks incoming
    /// transfers first (deliver completions, request retransmits, drop
    /// timed-out ones), then outgoing transfers (drop timed-out ones, send
    /// the highest-priority ready one's current fragment).
    pub fn tick(&mut self, link: &mut impl LinkSink, now: Instant) {
        self.tick_incoming(link, now);
        self.tick_outgoing(link, now);
    }

    fn incoming_drop_timeout(&self) -> Duration {
        Duration::from_secs_f64(
            self.config.max_fragment_data_size() as f64 * 8.0 / self.config.rx_rate
                * self.config.inactivity_timeout_multiplier,
        )
    }

    fn outgoing_drop_timeout(&self) -> Duration {
        Duration::from_secs_f64(
            self.config.max_fragment_data_size() as f64 * 8.0 / self.config.tx_rate
                * self.config.inactivity_timeout_multiplier,
        )
    }

    fn tick_incoming(&mut self, link: &mut impl LinkSink, now: Instant) {
        let drop_timeout = self.incoming_drop_timeout();
        let req_holdoff = Duration::from_secs_f64(
            self.config.max_fragment_data_size() as f64 * 8.0 / self.config.rx_rate
                * self.config.retransmit_holdoff_multiplier,
        );
        let hold_duration = self.config.minimum_incoming_hold_time;

        let mut to_erase = Vec::new();
        let mut to_ack = Vec::new();
        let mut to_req = Vec::new();

        for (&id, transfer) in &mut self.incoming {
            if transfer.hold_expired(now) {
                to_erase.push(id);
                continue;
            }
            if transfer.is_complete() {
                if transfer.is_ack_ready() {
                    to_ack.push(id);
                }
                continue;
            }
            if now.saturating_duration_since(transfer.last_rx_time) >= drop_timeout {
                to_erase.push(id);
                continue;
            }
            if let Some(missing) = transfer.retransmit_request_due(now, req_holdoff) {
                to_req.push((id, missing));
            }
        }

        for id in to_ack {
            let transfer = self.incoming.get_mut(&id).expect("iterated above");
            let header = TransferHeader {
                kind: TransferKind::Ack,
                fragment_index: transfer.fragments_total(),
                fragments_total: transfer.fragments_total(),
                id,
                prev_id: transfer.prev_id,
            };
            let ack_data = Bytes::from_vec(header.encode().to_vec());
            let fragment = Fragment::new(self.local_address, transfer.source, self.interface_id, now, ack_data);
            if link.transmit(fragment).is_ok() {
                transfer.mark_ack_emitted(now, hold_duration);
            }
        }

        for (id, missing) in to_req {
            if let Some(transfer) = self.incoming.get(&id) {
                let header = TransferHeader {
                    kind: TransferKind::Req,
                    fragment_index: missing,
                    fragments_total: transfer.fragments_total(),
                    id,
                    prev_id: transfer.prev_id,
                };
                let req_data = Bytes::from_vec(header.encode().to_vec());
                let fragment =
                    Fragment::new(self.local_address, transfer.source, self.interface_id, now, req_data);
                tracing::debug!(id, missing, "requesting retransmit");
                let _ = link.transmit(fragment);
            }
        }

        for id in to_erase {
            self.incoming.remove(&id);
        }
    }

    fn tick_outgoing(&mut self, link: &mut impl LinkSink, now: Instant) {
        let drop_timeout = self.outgoing_drop_timeout();

        let mut to_drop = Vec::new();
        for (&id, transfer) in &self.outgoing {
            let since_activity = now.saturating_duration_since(transfer.last_activity);
            if since_activity >= drop_timeout {
                to_drop.push(id);
            }
        }
        for id in to_drop {
            let transfer = self.outgoing.remove(&id).expect("iterated above");
            let outcome = if transfer.last_tx_time.is_none() {
                TransferOutcome::Unreachable
            } else {
                TransferOutcome::TimedOut
            };
            self.complete.emit(&TransferComplete {
                id,
                destination: transfer.destination,
                outcome,
            });
        }

        let retransmit_time = Duration::from_secs_f64(
            self.config.max_fragment_data_size() as f64 * 8.0 / self.config.tx_rate
                * self.config.retransmit_holdoff_multiplier,
        );
        for transfer in self.outgoing.values_mut() {
            if transfer.retransmit_due(now, retransmit_time, self.config.retransmit_limit_multiplier) {
                let fragments_total = transfer.fragments_total();
                tracing::debug!(id = transfer.id, "bordering fragment unacked, retransmitting");
                transfer.on_retransmit_request(fragments_total, now);
            }
        }

        if !link.transmit_ready() {
            return;
        }

        let candidate = self
            .outgoing
            .values()
            .filter(|t| {
                t.is_transmit_ready()
                    && self
                        .peers
                        .get(t.destination)
                        .is_none_or(|p| p.is_ready(now))
            })
            .min_by(|a, b| {
                a.last_activity
                    .cmp(&b.last_activity)
                    .then_with(|| a.remaining_fragments().cmp(&b.remaining_fragments()))
            })
            .map(|t| t.id);

        let Some(id) = candidate else {
            return;
        };
        let transfer = self.outgoing.get_mut(&id).expect("candidate came from this map");
        let Some(fragment_data) = transfer.build_next_fragment() else {
            return;
        };
        let fragment_bits = fragment_data.len() as f64 * 8.0;
        let destination = transfer.destination;
        let source = transfer.source;

        let fragment = Fragment::new(source, destination, self.interface_id, now, fragment_data);
        match link.transmit(fragment) {
            Ok(_) => {
                let transfer = self.outgoing.get_mut(&id).expect("still present");
                transfer.mark_handed_to_link(now);
                transfer.advance_after_sent();
                self.peers
                    .entry(destination, self.config.peer_rate, now)
                    .hold_off_for(fragment_bits, 1.0, now);
            }
            Err(_) => {
                tracing::trace!(id, "link not writable this tick, retrying next tick");
            }
        }
    }
}

//! Link layer: framing, addressing, integrity checking, and the circular
//! receive buffer.

mod buffer;
mod footer;
mod header;

pub use buffer::RxRingBuffer;
pub use footer::FooterKind;
pub use header::LinkHeader;

use crate::error::LinkError;
use crate::interface::{ByteSink, Fragment, InterfaceId, ObjectId, WriteOutcome};
use crate::observer::Subject;

/// Repeated to form the preamble. The parser only needs to find one
/// occurrence of this byte to attempt a resync; extra preamble bytes are
/// self-correcting through the header-checksum retry loop.
const PREAMBLE_BYTE: u8 = 0x55;
/// Preamble bytes written on transmit. The receiver tolerates any `P >= 1`.
const PREAMBLE_LEN: usize = 2;

/// Per-link configuration.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// Address this link matches on incoming fragments. Never 0.
    pub local_address: u8,
    /// Secondary address incoming fragments may match (optional).
    pub broadcast_address: Option<u8>,
    /// Bound on pending transmit fragments.
    pub max_queue_size: usize,
    /// Upper bound on framed payload bytes (the wire `size` field, a `u8`,
    /// caps this at 255 regardless of the configured value).
    pub max_fragment_size: usize,
    /// Circular receive buffer size in bytes.
    pub rx_buffer_size: usize,
    /// CRC-16 or CRC-32 footer.
    pub footer_kind: FooterKind,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            local_address: 1,
            broadcast_address: Some(255),
            max_queue_size: 8,
            max_fragment_size: 64,
            rx_buffer_size: 512,
            footer_kind: FooterKind::Crc16,
        }
    }
}

/// Framing, addressing, integrity checking and the receive-side circular
/// buffer for one link.
pub struct LinkLayer {
    config: LinkConfig,
    interface_id: InterfaceId,
    rx: RxRingBuffer,
    last_reported_overruns: u64,
    tx_queue: std::collections::VecDeque<Fragment>,
    next_object_id: u64,

    /// Fires for a fragment addressed to `local_address` or
    /// `broadcast_address`.
    pub receive: Subject<Fragment>,
    /// Fires for a validated fragment addressed elsewhere (diagnostic).
    pub other_receive: Subject<Fragment>,
    /// Fires once per detected buffer overrun.
    pub buffer_overrun: Subject<()>,
}

impl LinkLayer {
    /// Creates a link layer for the given interface.
    #[must_use]
    pub fn new(config: LinkConfig, interface_id: InterfaceId) -> Self {
        Self {
            rx: RxRingBuffer::new(config.rx_buffer_size),
            config,
            interface_id,
            last_reported_overruns: 0,
            tx_queue: std::collections::VecDeque::new(),
            next_object_id: 0,
            receive: Subject::new(),
            other_receive: Subject::new(),
            buffer_overrun: Subject::new(),
        }
    }

    /// This link's configuration.
    #[must_use]
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// This link's interface identifier.
    #[must_use]
    pub fn interface_id(&self) -> InterfaceId {
        self.interface_id
    }

    /// True while another fragment may be queued without hitting
    /// `max_queue_size`.
    #[must_use]
    pub fn transmit_ready(&self) -> bool {
        self.tx_queue.len() < self.config.max_queue_size
    }

    /// How many overruns have occurred over this link's lifetime.
    #[must_use]
    pub fn overrun_count(&self) -> u64 {
        self.rx.overrun_count()
    }

    /// Queues `fragment` for transmission, validating payload size and
    /// destination address. Assigns and returns the fragment's ephemeral
    /// [`ObjectId`] on success.
    pub fn transmit(&mut self, mut fragment: Fragment) -> Result<ObjectId, LinkError> {
        let len = fragment.data.len();
        if len == 0 || len > self.config.max_fragment_size || len > 255 {
            return Err(LinkError::BadPayload {
                len,
                max: self.config.max_fragment_size.min(255),
            });
        }
        if fragment.destination == 0 || fragment.destination == fragment.source {
            return Err(LinkError::NoDestination {
                dest: fragment.destination,
                src: fragment.source,
            });
        }
        if !self.transmit_ready() {
            return Err(LinkError::NotWritable);
        }

        let object_id = ObjectId::next(&mut self.next_object_id);
        fragment.object_id = Some(object_id);
        self.tx_queue.push_back(fragment);
        Ok(object_id)
    }

    /// Feeds one byte into the receive buffer, as the byte source. Safe to
    /// call from an interrupt context: touches only the ring buffer's write
    /// cursor and counters, never allocates, never emits an event.
    pub fn on_byte(&mut self, byte: u8) {
        self.rx.push_byte(byte);
    }

    /// Drives both directions of this link for one tick: attempts to hand
    /// the head of the transmit queue to `sink`, then parses as many
    /// complete fragments as are available in the receive buffer,
    /// dispatching `receive`/`other_receive`/`buffer_overrun` events.
    pub fn tick(&mut self, sink: &mut impl ByteSink) {
        self.report_overruns();

        if let Some(fragment) = self.tx_queue.front() {
            let frame = self.serialize(fragment);
            if sink.write_bytes(&frame) == WriteOutcome::Accepted {
                let fragment = self
                    .tx_queue
                    .pop_front()
                    .expect("front() just returned Some");
                let object_id = fragment
                    .object_id
                    .expect("transmit() always assigns an object_id");
                tracing::trace!(?object_id, "fragment handed to byte sink");
            }
        }

        while let Some((header, payload)) = self.try_parse_one() {
            self.report_overruns();
            let fragment = Fragment::new(
                header.source,
                header.destination,
                self.interface_id,
                web_time::Instant::now(),
                crate::container::Bytes::from_vec(payload),
            );
            let is_for_us = header.destination == self.config.local_address
                || Some(header.destination) == self.config.broadcast_address;
            if is_for_us {
                self.receive.emit(&fragment);
            } else {
                tracing::trace!(dest = header.destination, "fragment for another address");
                self.other_receive.emit(&fragment);
            }
        }
    }

    fn report_overruns(&mut self) {
        let current = self.rx.overrun_count();
        if current > self.last_reported_overruns {
            for _ in self.last_reported_overruns..current {
                tracing::warn!("link receive buffer overrun");
                self.buffer_overrun.emit(&());
            }
            self.last_reported_overruns = current;
        }
    }

    fn serialize(&self, fragment: &Fragment) -> Vec<u8> {
        let header = LinkHeader {
            destination: fragment.destination,
            source: fragment.source,
            #[allow(clippy::cast_possible_truncation)]
            size: fragment.data.len() as u8,
        };
        let footer_input_start = PREAMBLE_LEN;
        let mut buf = Vec::with_capacity(
            PREAMBLE_LEN + LinkHeader::ENCODED_LEN + fragment.data.len() + self.config.footer_kind.len(),
        );
        buf.extend(std::iter::repeat_n(PREAMBLE_BYTE, PREAMBLE_LEN));
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(fragment.data.as_slice());
        let footer = self.config.footer_kind.compute(&buf[footer_input_start..]);
        buf.extend_from_slice(&footer);
        buf
    }

    /// One resync-and-parse attempt: finds a preamble byte, validates the
    /// header checksum and size bound, waits for the full frame, then
    /// validates the footer. Integrity and partial-frame failures never
    /// raise; they consume at most one byte and the caller loops. Returns
    /// `None` when there is nothing left to usefully do this call (either
    /// the buffer is empty, exhausted without finding a preamble, or a
    /// complete frame isn't available yet).
    fn try_parse_one(&mut self) -> Option<(LinkHeader, Vec<u8>)> {
        loop {
            let available = self.rx.available();
            if available == 0 {
                return None;
            }

            let mut offset = 0;
            while offset < available && self.rx.peek(offset) != Some(PREAMBLE_BYTE) {
                offset += 1;
            }
            if offset == available {
                self.rx.advance(offset);
                return None;
            }
            self.rx.advance(offset);

            let available = self.rx.available();
            if available < 1 + LinkHeader::ENCODED_LEN {
                return None;
            }

            let mut hdr_bytes = [0u8; LinkHeader::ENCODED_LEN];
            for (i, slot) in hdr_bytes.iter_mut().enumerate() {
                *slot = self.rx.peek(1 + i).expect("bounds checked above");
            }

            let Some(header) = LinkHeader::decode(&hdr_bytes) else {
                self.rx.advance(1);
                continue;
            };
            if header.size == 0 || usize::from(header.size) > self.config.max_fragment_size {
                self.rx.advance(1);
                continue;
            }

            let footer_len = self.config.footer_kind.len();
            let size = usize::from(header.size);
            let total_needed = 1 + LinkHeader::ENCODED_LEN + size + footer_len;
            if self.rx.available() < total_needed {
                return None;
            }

            let mut frame = vec![0u8; LinkHeader::ENCODED_LEN + size];
            for (i, slot) in frame.iter_mut().enumerate() {
                *slot = self.rx.peek(1 + i).expect("bounds checked above");
            }
            let mut footer = vec![0u8; footer_len];
            for (i, slot) in footer.iter_mut().enumerate() {
                *slot = self
                    .rx
                    .peek(1 + LinkHeader::ENCODED_LEN + size + i)
                    .expect("bounds checked above");
            }

            if !self.config.footer_kind.verify(&frame, &footer) {
                self.rx.advance(1);
                continue;
            }

            self.rx.advance(total_needed);
            let payload = frame[LinkHeader::ENCODED_LEN..].to_vec();
            return Some((header, payload));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Bytes;
    use crate::interface::Loopback;

    fn link(local: u8) -> LinkLayer {
        LinkLayer::new(
            LinkConfig {
                local_address: local,
                ..LinkConfig::default()
            },
            InterfaceId::default(),
        )
    }

    #[test]
    fn round_trip_through_loopback() {
        let mut a = link(1);
        let mut b = link(2);
        let mut wire = Loopback::new();

        a.transmit(Fragment::new(
            1,
            2,
            InterfaceId::default(),
            web_time::Instant::now(),
            Bytes::from_vec(vec![0x10, 0x11]),
        ))
        .unwrap();

        let received = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let received2 = received.clone();
        b.receive.subscribe(move |f: &Fragment| {
            received2.borrow_mut().push(f.data.as_slice().to_vec());
        });

        a.tick(&mut wire);
        wire.complete_tx();
        wire.drain_into(|byte| b.on_byte(byte));
        b.tick(&mut wire);

        assert_eq!(*received.borrow(), vec![vec![0x10, 0x11]]);
    }

    #[test]
    fn rejects_oversized_payload() {
        let mut a = link(1);
        let err = a
            .transmit(Fragment::new(
                1,
                2,
                InterfaceId::default(),
                web_time::Instant::now(),
                Bytes::from_vec(vec![0u8; 1000]),
            ))
            .unwrap_err();
        assert!(matches!(err, LinkError::BadPayload { .. }));
    }

    #[test]
    fn rejects_zero_destination() {
        let mut a = link(1);
        let err = a
            .transmit(Fragment::new(
                1,
                0,
                InterfaceId::default(),
                web_time::Instant::now(),
                Bytes::from_vec(vec![1]),
            ))
            .unwrap_err();
        assert!(matches!(err, LinkError::NoDestination { .. }));
    }

    #[test]
    fn not_writable_past_queue_bound() {
        let mut a = LinkLayer::new(
            LinkConfig {
                max_queue_size: 1,
                ..LinkConfig::default()
            },
            InterfaceId::default(),
        );
        a.transmit(Fragment::new(
            1,
            2,
            InterfaceId::default(),
            web_time::Instant::now(),
            Bytes::from_vec(vec![1]),
        ))
        .unwrap();
        let err = a
            .transmit(Fragment::new(
                1,
                2,
                InterfaceId::default(),
                web_time::Instant::now(),
                Bytes::from_vec(vec![1]),
            ))
            .unwrap_err();
        assert!(matches!(err, LinkError::NotWritable));
    }

    #[test]
    fn corrupted_fragment_is_dropped_and_resynced() {
        let mut a = link(1);
        let mut b = link(2);
        let mut wire = Loopback::with_fault(crate::interface::FaultInjector::new().corrupt_byte(7));

        a.transmit(Fragment::new(
            1,
            2,
            InterfaceId::default(),
            web_time::Instant::now(),
            Bytes::from_vec(vec![0xAA, 0xBB]),
        ))
        .unwrap();
        a.transmit(Fragment::new(
            1,
            2,
            InterfaceId::default(),
            web_time::Instant::now(),
            Bytes::from_vec(vec![0xCC]),
        ))
        .unwrap();

        let received = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let received2 = received.clone();
        b.receive.subscribe(move |f: &Fragment| {
            received2.borrow_mut().push(f.data.as_slice().to_vec());
        });

        a.tick(&mut wire);
        wire.complete_tx();
        wire.drain_into(|byte| b.on_byte(byte));
        b.tick(&mut wire);

        a.tick(&mut wire);
        wire.complete_tx();
        wire.drain_into(|byte| b.on_byte(byte));
        b.tick(&mut wire);

        // first fragment corrupted and discarded; second arrives intact.
        assert_eq!(*received.borrow(), vec![vec![0xCC]]);
    }
}

//! Port multiplexer: a second addressing dimension over one or more
//! transfer layers, giving independent services their own receive events
//! and request/response correlation via `prev_id`.

mod header;

pub use header::PortHeader;

use std::collections::{HashMap, HashSet};

use web_time::Instant;

use crate::container::{Bytes, PreallocSize};
use crate::error::{PortError, ProtoserialError};
use crate::interface::InterfaceId;
use crate::observer::Subject;
use crate::transfer::{Transfer, TransferLayer};

/// Lowest port number handed out by [`PortMultiplexer::get_free_port`].
const FIRST_EPHEMERAL_PORT: u8 = 100;

/// A transfer plus its port addressing, delivered to or submitted by a
/// service.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Peer address.
    pub source: u8,
    /// Local address.
    pub destination: u8,
    /// Destination service port.
    pub destination_port: u8,
    /// Source service port.
    pub source_port: u8,
    /// This transfer's identifier.
    pub id: u8,
    /// The request this is a response to, or 0.
    pub prev_id: u8,
    /// Application payload, port header already stripped.
    pub payload: Bytes,
}

/// Service registry and port-header (de)multiplexing over one or more
/// transfer layers.
///
/// Does not hold a back-reference to any [`TransferLayer`]; callers pass the
/// relevant one to [`Self::transmit`] explicitly, the same inversion used by
/// [`crate::transfer::TransferLayer`] towards its link.
pub struct PortMultiplexer {
    services: HashMap<u8, Subject<Packet>>,
    interfaces: HashSet<InterfaceId>,
}

impl PortMultiplexer {
    /// Creates an empty multiplexer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
            interfaces: HashSet::new(),
        }
    }

    /// Registers a new service on `port`. Returns the [`Subject`] the
    /// service should subscribe to for incoming packets.
    pub fn register_service(&mut self, port: u8) -> Result<&mut Subject<Packet>, PortError> {
        if port == 0 {
            return Err(PortError::InvalidPort);
        }
        if self.services.contains_key(&port) {
            return Err(PortError::AlreadyRegistered);
        }
        Ok(self.services.entry(port).or_insert_with(Subject::new))
    }

    /// Registers `interface_id` as a transmit/receive target. Purely a
    /// bookkeeping guard against double registration; routing a transfer
    /// layer to an interface remains the caller's responsibility.
    pub fn register_interface(&mut self, interface_id: InterfaceId) -> Result<(), PortError> {
        if !self.interfaces.insert(interface_id) {
            return Err(PortError::AlreadyRegistered);
        }
        Ok(())
    }

    /// The lowest unused port at or above 100.
    #[must_use]
    pub fn get_free_port(&self) -> u8 {
        (FIRST_EPHEMERAL_PORT..=u8::MAX)
            .find(|p| !self.services.contains_key(p))
            .expect("fewer than 156 services registered")
    }

    /// The buffer slack a service must reserve so every layer below it can
    /// prepend its header without reallocating.
    #[must_use]
    pub fn minimum_prealloc(downstream_minimum: PreallocSize) -> PreallocSize {
        downstream_minimum.add(PortHeader::ENCODED_LEN, 0)
    }

    /// Prepends the port header and submits `payload` to `transfer` as a new
    /// outgoing transfer. Returns the allocated transfer ID.
    pub fn transmit(
        &self,
        transfer: &mut TransferLayer,
        destination: u8,
        destination_port: u8,
        source_port: u8,
        prev_id: u8,
        payload: Bytes,
        now: Instant,
    ) -> Result<u8, ProtoserialError> {
        if destination_port == 0 || source_port == 0 || destination_port == source_port {
            return Err(PortError::InvalidPort.into());
        }
        let header = PortHeader {
            destination_port,
            source_port,
        };
        let mut data = payload;
        data.push_front(&header.encode());
        Ok(transfer.submit(destination, prev_id, data, now)?)
    }

    /// Routes a fully reassembled transfer from the transfer layer to its
    /// registered service, stripping the port header. Silently drops
    /// transfers addressed to an unregistered or malformed port.
    pub fn handle_transfer(&mut self, transfer: &Transfer) {
        let data = transfer.payload.as_slice();
        if data.len() < PortHeader::ENCODED_LEN {
            tracing::trace!("transfer too short for a port header, dropped");
            return;
        }
        let mut hdr_bytes = [0u8; PortHeader::ENCODED_LEN];
        hdr_bytes.copy_from_slice(&data[..PortHeader::ENCODED_LEN]);
        let Some(header) = PortHeader::decode(&hdr_bytes) else {
            tracing::trace!("bad port header checksum, dropped");
            return;
        };
        let Some(service) = self.services.get_mut(&header.destination_port) else {
            tracing::trace!(port = header.destination_port, "unregistered port, dropped");
            return;
        };
        let payload = Bytes::from_vec(data[PortHeader::ENCODED_LEN..].to_vec());
        service.emit(&Packet {
            source: transfer.source,
            destination: transfer.destination,
            destination_port: header.source_port,
            source_port: header.destination_port,
            id: transfer.id,
            prev_id: transfer.prev_id,
            payload,
        });
    }
}

impl Default for PortMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

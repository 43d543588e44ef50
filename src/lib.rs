//! Layered link/transfer/port stack for exchanging variable-length
//! application messages over unreliable byte-oriented serial links such as
//! UART, RS-485 and USB-CDC.
//!
//! Three layers, bottom to top:
//! - [`link`] — framing, addressing, integrity checking, the circular
//!   receive buffer.
//! - [`transfer`] — fragmentation, per-fragment ACK/REQ, retransmission,
//!   per-peer rate control.
//! - [`ports`] — a second addressing dimension so independent services can
//!   share one link.
//!
//! [`Stack`] wires one of each together for a single physical or virtual
//! interface; driving it is the host's job — feed bytes in via
//! [`link::LinkLayer::on_byte`], call [`Stack::tick`] once per loop
//! iteration, write bytes out through a [`interface::ByteSink`].

#![warn(missing_docs)]

pub mod clock;
pub mod container;
pub mod error;
pub mod interface;
pub mod link;
pub mod observer;
pub mod ports;
pub mod transfer;

pub use error::ProtoserialError;
pub use transfer::TransferOutcome;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use web_time::Instant;

use clock::{Clock, SystemClock};
use container::Bytes;
use interface::{ByteSink, Fragment, InterfaceId};
use link::{LinkConfig, LinkLayer};
use observer::Subject;
use ports::{Packet, PortMultiplexer};
use transfer::{Transfer, TransferConfig, TransferLayer};

/// One link's full stack: link layer, transfer layer and port multiplexer,
/// driven together for a single interface.
///
/// None of the three layers hold a back-reference to another. Each exposes
/// its events as a [`Subject`] a host can subscribe to directly; `Stack`
/// additionally subscribes two small internal queues at construction time
/// (link fragments into the transfer layer, completed transfers into the
/// port multiplexer) and drains them in [`Self::tick`], so wiring layer to
/// layer never requires a layer to own or borrow its neighbour.
pub struct Stack<C = SystemClock> {
    link: LinkLayer,
    transfer: TransferLayer,
    ports: PortMultiplexer,
    clock: C,
    inbound_fragments: Rc<RefCell<VecDeque<Fragment>>>,
    inbound_transfers: Rc<RefCell<VecDeque<Transfer>>>,
}

impl Stack<SystemClock> {
    /// Creates a stack using the platform wall clock.
    #[must_use]
    pub fn new(link_config: LinkConfig, transfer_config: TransferConfig, interface_id: InterfaceId) -> Self {
        Self::with_clock(link_config, transfer_config, interface_id, SystemClock)
    }
}

impl<C: Clock> Stack<C> {
    /// Creates a stack driven by `clock`, for deterministic tests (pass a
    /// [`clock::VirtualClock`]).
    #[must_use]
    pub fn with_clock(
        link_config: LinkConfig,
        transfer_config: TransferConfig,
        interface_id: InterfaceId,
        clock: C,
    ) -> Self {
        let local_address = link_config.local_address;
        let mut link = LinkLayer::new(link_config, interface_id);
        let mut transfer = TransferLayer::new(transfer_config, local_address, interface_id);

        let inbound_fragments = Rc::new(RefCell::new(VecDeque::new()));
        let fragments_sink = inbound_fragments.clone();
        link.receive.subscribe(move |fragment: &Fragment| {
            fragments_sink.borrow_mut().push_back(fragment.clone());
        });

        let inbound_transfers = Rc::new(RefCell::new(VecDeque::new()));
        let transfers_sink = inbound_transfers.clone();
        transfer.received.subscribe(move |t: &Transfer| {
            transfers_sink.borrow_mut().push_back(t.clone());
        });

        Self {
            link,
            transfer,
            ports: PortMultiplexer::new(),
            clock,
            inbound_fragments,
            inbound_transfers,
        }
    }

    /// The link layer, for subscribing to `other_receive`/`buffer_overrun`
    /// diagnostic events.
    #[must_use]
    pub fn link(&mut self) -> &mut LinkLayer {
        &mut self.link
    }

    /// The transfer layer, for subscribing to `complete` events.
    #[must_use]
    pub fn transfer(&mut self) -> &mut TransferLayer {
        &mut self.transfer
    }

    /// The port multiplexer, for registering services directly.
    #[must_use]
    pub fn ports(&mut self) -> &mut PortMultiplexer {
        &mut self.ports
    }

    /// Registers a service on `port`, returning the [`Subject`] it should
    /// subscribe to for incoming packets.
    pub fn register_service(&mut self, port: u8) -> Result<&mut Subject<Packet>, error::PortError> {
        self.ports.register_service(port)
    }

    /// Submits `payload` to `destination_port` on `destination`, prepending
    /// the port header and handing it to the transfer layer as a new
    /// outgoing transfer. Returns the allocated transfer ID.
    pub fn transmit(
        &mut self,
        destination: u8,
        destination_port: u8,
        source_port: u8,
        prev_id: u8,
        payload: Bytes,
    ) -> Result<u8, ProtoserialError> {
        let now = self.clock.now();
        self.ports.transmit(
            &mut self.transfer,
            destination,
            destination_port,
            source_port,
            prev_id,
            payload,
            now,
        )
    }

    /// Drives every layer for one tick: link layer framing and byte I/O
    /// against `sink`, transfer layer fragmentation/reliability over
    /// whatever fragments the link produced, then routes any transfers the
    /// transfer layer completed this tick through the port multiplexer.
    pub fn tick(&mut self, sink: &mut impl ByteSink) {
        let now = self.clock.now();

        self.link.tick(sink);

        while let Some(fragment) = self.inbound_fragments.borrow_mut().pop_front() {
            self.transfer.handle_fragment(&fragment, now);
        }

        self.transfer.tick(&mut self.link, now);

        while let Some(transfer) = self.inbound_transfers.borrow_mut().pop_front() {
            self.ports.handle_transfer(&transfer);
        }
    }

    /// The current time, per this stack's clock.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.clock.now()
    }
}

//! Interface identifiers, link-layer fragments, and the byte transport
//! contract.

mod fragment;
mod loopback;

pub use fragment::{Fragment, ObjectId};
pub use loopback::{ByteSink, FaultInjector, Loopback, WriteOutcome};

/// What kind of physical/virtual transport an interface sits on. Used only
/// to scope transfer IDs and addresses; the core never special-cases a
/// particular kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    /// No interface assigned yet.
    None,
    /// An in-process loopback, used for tests and demos.
    Loopback,
    /// A virtual interface with no physical backing.
    Virtual,
    /// A UART transport.
    Uart,
    /// A USB-CDC transport.
    UsbCdc,
    /// An RS-485 multi-drop bus.
    Rs485,
}

/// `(kind, instance)` pair identifying one interface, used to scope
/// transfer IDs and addresses to a particular physical or virtual link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceId {
    /// What kind of transport this interface is.
    pub kind: InterfaceKind,
    /// Disambiguates multiple interfaces of the same kind.
    pub instance: u8,
}

impl InterfaceId {
    /// Creates an interface identifier.
    #[must_use]
    pub const fn new(kind: InterfaceKind, instance: u8) -> Self {
        Self { kind, instance }
    }

    /// The identifier used before any interface has been assigned.
    pub const NONE: Self = Self::new(InterfaceKind::None, 0);
}

impl Default for InterfaceId {
    fn default() -> Self {
        Self::NONE
    }
}

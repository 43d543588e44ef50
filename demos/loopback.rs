//! Two stacks talking over an in-process loopback pair: transmits a short
//! packet from one address to a service registered on the other, and logs
//! what each layer does along the way.

use protoserial::clock::VirtualClock;
use protoserial::container::Bytes;
use protoserial::interface::{InterfaceId, InterfaceKind, Loopback};
use protoserial::link::LinkConfig;
use protoserial::ports::Packet;
use protoserial::transfer::TransferConfig;
use protoserial::Stack;

const ECHO_PORT: u8 = 42;
const CLIENT_PORT: u8 = 7;

fn main() {
    tracing_subscriber::fmt::init();

    let clock = VirtualClock::new();
    let interface_id = InterfaceId::new(InterfaceKind::Loopback, 0);

    let mut alice = Stack::with_clock(
        LinkConfig {
            local_address: 1,
            ..LinkConfig::default()
        },
        TransferConfig::default(),
        interface_id,
        clock.clone(),
    );
    let mut bob = Stack::with_clock(
        LinkConfig {
            local_address: 2,
            ..LinkConfig::default()
        },
        TransferConfig::default(),
        interface_id,
        clock.clone(),
    );

    bob.register_service(ECHO_PORT)
        .expect("port 42 is free on a fresh stack")
        .subscribe(|packet: &Packet| {
            tracing::info!(
                from = packet.source,
                bytes = packet.payload.len(),
                "echo service received {:?}",
                packet.payload.as_slice()
            );
        });

    alice
        .transmit(2, ECHO_PORT, CLIENT_PORT, 0, Bytes::from_vec(b"hello world".to_vec()))
        .expect("valid destination and ports");

    let mut alice_to_bob = Loopback::new();
    let mut bob_to_alice = Loopback::new();

    for tick in 0..20 {
        clock.advance(std::time::Duration::from_millis(5));

        alice.tick(&mut alice_to_bob);
        alice_to_bob.complete_tx();
        alice_to_bob.drain_into(|byte| bob.link().on_byte(byte));

        bob.tick(&mut bob_to_alice);
        bob_to_alice.complete_tx();
        bob_to_alice.drain_into(|byte| alice.link().on_byte(byte));

        tracing::debug!(tick, "tick complete");
    }
}

//! The byte transport contract, and an in-process [`Loopback`] transport
//! used for tests and the `loopback` demo.

use std::collections::VecDeque;

/// Result of a [`ByteSink::write_bytes`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The buffer was accepted; a `tx_complete` will follow once the
    /// hardware or syscall finishes the write.
    Accepted,
    /// A write is already outstanding; try again later.
    Busy,
}

/// The only platform-specific seam the core depends on: a non-blocking,
/// at-most-one-outstanding-write byte sink. Implemented by the host for a
/// real UART/USB-CDC/RS-485 driver; [`Loopback`] is a reference
/// implementation for tests and demos.
pub trait ByteSink {
    /// Attempts to start writing `buf`. Must not block. At most one write
    /// may be outstanding; callers should check [`WriteOutcome`] before
    /// calling again.
    fn write_bytes(&mut self, buf: &[u8]) -> WriteOutcome;
}

/// Corrupts or drops bytes passed through a [`Loopback`], for exercising
/// the link layer's resync and the transfer layer's retransmission paths.
#[derive(Debug, Default)]
pub struct FaultInjector {
    position: u64,
    drop_at: Vec<u64>,
    flip_at: Vec<u64>,
}

impl FaultInjector {
    /// Creates a fault injector that passes bytes through unmodified until
    /// configured otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the byte at absolute stream position `offset` (0-based, over
    /// the lifetime of this injector).
    #[must_use]
    pub fn drop_byte(mut self, offset: u64) -> Self {
        self.drop_at.push(offset);
        self
    }

    /// Flips every bit of the byte at absolute stream position `offset`.
    #[must_use]
    pub fn corrupt_byte(mut self, offset: u64) -> Self {
        self.flip_at.push(offset);
        self
    }

    fn apply(&mut self, buf: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(buf.len());
        for &b in buf {
            let pos = self.position;
            self.position += 1;
            if self.drop_at.contains(&pos) {
                continue;
            }
            if self.flip_at.contains(&pos) {
                out.push(!b);
            } else {
                out.push(b);
            }
        }
        out
    }
}

/// An in-process byte transport: bytes handed to [`ByteSink::write_bytes`]
/// sit in an internal queue until [`Loopback::drain_into`] delivers them
/// (optionally mangled by a [`FaultInjector`]) to a peer's `on_byte`.
#[derive(Debug, Default)]
pub struct Loopback {
    queue: VecDeque<u8>,
    busy: bool,
    fault: Option<FaultInjector>,
}

impl Loopback {
    /// Creates a clean loopback transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a loopback transport that mangles bytes per `fault`.
    #[must_use]
    pub fn with_fault(fault: FaultInjector) -> Self {
        Self {
            fault: Some(fault),
            ..Self::default()
        }
    }

    /// True if a write is outstanding (no `complete_tx` since the last
    /// accepted `write_bytes`).
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Simulates the hardware/syscall finishing the outstanding write.
    pub fn complete_tx(&mut self) {
        self.busy = false;
    }

    /// Delivers every queued byte to `on_byte`, draining the queue.
    pub fn drain_into(&mut self, mut on_byte: impl FnMut(u8)) {
        while let Some(b) = self.queue.pop_front() {
            on_byte(b);
        }
    }

    /// True if there are bytes waiting to be drained.
    #[must_use]
    pub fn has_pending_bytes(&self) -> bool {
        !self.queue.is_empty()
    }
}

impl ByteSink for Loopback {
    fn write_bytes(&mut self, buf: &[u8]) -> WriteOutcome {
        if self.busy {
            return WriteOutcome::Busy;
        }
        let bytes = match &mut self.fault {
            Some(f) => f.apply(buf),
            None => buf.to_vec(),
        };
        self.queue.extend(bytes);
        self.busy = true;
        WriteOutcome::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_second_write_while_busy() {
        let mut l = Loopback::new();
        assert_eq!(l.write_bytes(&[1, 2]), WriteOutcome::Accepted);
        assert_eq!(l.write_bytes(&[3, 4]), WriteOutcome::Busy);
        l.complete_tx();
        assert_eq!(l.write_bytes(&[5]), WriteOutcome::Accepted);
    }

    #[test]
    fn fault_injector_drops_and_corrupts() {
        let fault = FaultInjector::new().drop_byte(1).corrupt_byte(3);
        let mut l = Loopback::with_fault(fault);
        l.write_bytes(&[0x01, 0x02, 0x03, 0x04]);
        let mut out = Vec::new();
        l.drain_into(|b| out.push(b));
        assert_eq!(out, vec![0x01, 0x03, !0x04]);
    }
}

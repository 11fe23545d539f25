//! meshwire Integration Tests
//!
//! End-to-end scenarios for the networking stack, run over real loopback
//! TCP connections:
//!
//! 1. **Handshake** — asymmetric dial, simultaneous dial, forced nonce
//!    ties, unknown peers, and registry error reporting
//! 2. **Liveness & recovery** — oversize-frame teardown, silent-peer
//!    watchdog expiry, dial retry policies, user-initiated resets
//! 3. **Message flow** — FIFO delivery, multicast, deferred-send errors,
//!    inbound-queue backpressure, application payload round-trips

pub mod harness;



#[cfg(test)]
mod msg_flow_tests;

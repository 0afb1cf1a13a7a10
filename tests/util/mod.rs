//! Shared helpers for integration tests.

use std::sync::atomic::{AtomicU16, Ordering};

/// Atomic port counter so every test node binds a unique loopback port.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(21500);

pub fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

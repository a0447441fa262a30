// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use std::collections::VecDeque;

/// Depth of the receive FIFO. Bytes injected past this are lost.
pub const RX_CAPACITY: usize = 4096;

/// Serial console.
/// Host-injected bytes queue in the receive FIFO; guest writes are captured for the harness.
#[derive(Debug, Default)]
pub struct Uart {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

impl Uart {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the guest. Returns how many were accepted.
    pub fn inject_input(&mut self, bytes: &[u8]) -> usize {
        let room = RX_CAPACITY.saturating_sub(self.rx.len());
        let accepted = bytes.len().min(room);
        self.rx.extend(&bytes[..accepted]);
        if accepted < bytes.len() {
            tracing::warn!(
                "UART receive overrun, dropped {} of {} bytes",
                bytes.len() - accepted,
                bytes.len()
            );
        }
        accepted
    }

    pub fn has_rx_data(&self) -> bool {
        !self.rx.is_empty()
    }

    pub fn read_byte(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }

    pub fn transmit(&mut self, byte: u8) {
        self.tx.push(byte);
    }

    pub fn transmit_all(&mut self, bytes: &[u8]) {
        self.tx.extend_from_slice(bytes);
    }

    pub fn output(&self) -> &[u8] {
        &self.tx
    }

    pub fn clear_output(&mut self) {
        self.tx.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rx_overrun_drops_excess() {
        let mut uart = Uart::new();
        let big = vec![b'a'; RX_CAPACITY + 10];
        assert_eq!(uart.inject_input(&big), RX_CAPACITY);
        assert_eq!(uart.inject_input(b"x"), 0);
        assert_eq!(uart.read_byte(), Some(b'a'));
        assert_eq!(uart.inject_input(b"xy"), 1);
    }

    #[test]
    fn test_tx_capture() {
        let mut uart = Uart::new();
        uart.transmit(b'o');
        uart.transmit_all(b"k\n");
        assert_eq!(uart.output(), b"ok\n");
        uart.clear_output();
        assert!(uart.output().is_empty());
    }
}

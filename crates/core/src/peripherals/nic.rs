// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::net::NetworkBackend;
use crate::NicBackend;

/// Guest network interface. Frames go straight to and from the host backend.
pub struct Nic {
    backend: NicBackend,
    tx_frames: u64,
    rx_frames: u64,
}

impl std::fmt::Debug for Nic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nic")
            .field("tx_frames", &self.tx_frames)
            .field("rx_frames", &self.rx_frames)
            .finish_non_exhaustive()
    }
}

impl Nic {
    pub fn new(backend: NicBackend) -> Self {
        Self {
            backend,
            tx_frames: 0,
            rx_frames: 0,
        }
    }

    pub fn transmit(&mut self, frame: Vec<u8>) {
        self.tx_frames += 1;
        self.backend.transmit(frame);
    }

    pub fn poll_receive(&mut self) -> Option<Vec<u8>> {
        let frame = self.backend.poll_receive()?;
        self.rx_frames += 1;
        Some(frame)
    }

    pub fn frame_counts(&self) -> (u64, u64) {
        (self.tx_frames, self.rx_frames)
    }
}

// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use super::NetworkBackend;
use crossbeam_channel::{unbounded, Receiver, Sender};

/// Guest side of an in-process link. Pairs with a [`HostPort`].
#[derive(Debug, Clone)]
pub struct ChannelBackend {
    to_host: Sender<Vec<u8>>,
    from_host: Receiver<Vec<u8>>,
}

/// Host side of an in-process link, usually driven from another thread.
#[derive(Debug, Clone)]
pub struct HostPort {
    pub from_guest: Receiver<Vec<u8>>,
    pub to_guest: Sender<Vec<u8>>,
}

pub fn channel_pair() -> (ChannelBackend, HostPort) {
    let (to_host, from_guest) = unbounded();
    let (to_guest, from_host) = unbounded();
    (
        ChannelBackend { to_host, from_host },
        HostPort {
            from_guest,
            to_guest,
        },
    )
}

impl NetworkBackend for ChannelBackend {
    fn transmit(&mut self, frame: Vec<u8>) {
        if self.to_host.send(frame).is_err() {
            tracing::debug!("Host port closed, dropping guest frame");
        }
    }

    fn poll_receive(&mut self) -> Option<Vec<u8>> {
        self.from_host.try_recv().ok()
    }
}

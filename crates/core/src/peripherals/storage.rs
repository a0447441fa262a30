// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

/// Status bit reported while an image is attached.
pub const STATUS_PRESENT: u8 = 0x80;

/// Block storage device backed by an opaque in-memory image.
#[derive(Debug, Default, Clone)]
pub struct Storage {
    image: Vec<u8>,
    status: u8,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, image: Vec<u8>) {
        self.image = image;
        self.status |= STATUS_PRESENT;
    }

    pub fn detach(&mut self) {
        self.image.clear();
        self.status &= !STATUS_PRESENT;
    }

    pub fn is_present(&self) -> bool {
        self.status & STATUS_PRESENT != 0
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn read_u8(&self, offset: u64) -> Option<u8> {
        if !self.is_present() {
            return None;
        }
        self.image.get(usize::try_from(offset).ok()?).copied()
    }
}

// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Console output decoding.
//!
//! The guest's transmit stream is opaque bytes. Only printable ASCII and the
//! three whitespace controls survive; everything else is dropped.

/// Printable ASCII (0x20..=0x7E) plus `\n`, `\r` and `\t`.
pub fn is_displayable(byte: u8) -> bool {
    matches!(byte, 0x20..=0x7E | b'\n' | b'\r' | b'\t')
}

pub fn decode_output(raw: &[u8]) -> String {
    raw.iter()
        .copied()
        .filter(|&b| is_displayable(b))
        .map(char::from)
        .collect()
}

/// Decodes a growing output buffer, touching each raw byte once.
#[derive(Debug, Default, Clone)]
pub struct OutputDecoder {
    consumed: usize,
    text: String,
}

impl OutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode whatever `raw` holds beyond what was already seen and return the
    /// offset in [`Self::text`] where the new text starts.
    ///
    /// If `raw` shrank (the buffer was cleared), decoding restarts from zero.
    pub fn update(&mut self, raw: &[u8]) -> usize {
        if raw.len() < self.consumed {
            self.reset();
        }
        let start = self.text.len();
        self.text.push_str(&decode_output(&raw[self.consumed..]));
        self.consumed = raw.len();
        start
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn reset(&mut self) {
        self.consumed = 0;
        self.text.clear();
    }
}

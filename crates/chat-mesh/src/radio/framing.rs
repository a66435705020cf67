//! Newline-delimited framing over a characteristic with a small MTU

/// Byte terminating every frame on the air
pub const FRAME_DELIMITER: u8 = b'\n';

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Append the delimiter to an encoded frame
pub fn delimit(frame: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(frame.len() + 1);
    data.extend_from_slice(frame);
    data.push(FRAME_DELIMITER);
    data
}

/// Split `data` into writes no larger than `mtu`
pub fn chunk(data: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    if data.is_empty() {
        return vec![Vec::new()];
    }
    data.chunks(mtu.max(1)).map(|c| c.to_vec()).collect()
}

/// Outcome of feeding bytes into an assembler
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Assembled {
    pub frames: Vec<Vec<u8>>,
    /// Bytes thrown away because a frame grew past [`MAX_FRAME_LEN`]
    pub discarded: usize,
}

/// Reassembles frames that arrive split across notifications
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    // Set after an overlong frame; skip bytes until the next delimiter
    skipping: bool,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Assembled {
        let mut out = Assembled::default();

        for &byte in chunk {
            if byte == FRAME_DELIMITER {
                if self.skipping {
                    self.skipping = false;
                } else if !self.buffer.is_empty() {
                    out.frames.push(std::mem::take(&mut self.buffer));
                }
                continue;
            }

            if self.skipping {
                out.discarded += 1;
                continue;
            }

            if self.buffer.len() >= MAX_FRAME_LEN {
                out.discarded += self.buffer.len() + 1;
                self.buffer.clear();
                self.skipping = true;
                continue;
            }

            self.buffer.push(byte);
        }

        out
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

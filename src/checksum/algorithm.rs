//! Transfer checksum
//!
//! A 16-bit one's-complement sum over big-endian byte pairs, subtracted from
//! an all-ones start value. Bytes at even stream offsets are the high half of
//! a pair. One's-complement arithmetic is associative, so the running state
//! can be continued across buffers of any size, and the state after a prefix
//! can be extended over the suffix to get the whole-stream value.

/// Value of the checksum over zero bytes
pub const EMPTY_CHECKSUM: u32 = 0xFFFF_0000;

/// Running transfer checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileChecksum {
    sum: u32,
    offset: u64,
}

impl FileChecksum {
    /// Create a checksum at stream offset zero
    pub fn new() -> Self {
        Self {
            sum: 0xFFFF,
            offset: 0,
        }
    }

    /// Resume from a previously reported value at the given stream offset
    pub fn resume(value: u32, offset: u64) -> Self {
        Self {
            sum: normalize((value >> 16) & 0xFFFF),
            offset,
        }
    }

    /// Calculate the checksum of a complete buffer
    pub fn calculate(data: &[u8]) -> u32 {
        let mut checksum = Self::new();
        checksum.update(data);
        checksum.value()
    }

    /// Feed more bytes
    pub fn update(&mut self, data: &[u8]) {
        let mut check = self.sum;
        let mut odd = self.offset & 1 == 1;

        for &byte in data {
            let val = if odd { byte as u32 } else { (byte as u32) << 8 };
            let old = check;
            check = check.wrapping_sub(val);
            // End-around borrow
            if check > old {
                check = check.wrapping_sub(1);
            }
            odd = !odd;
        }

        check = (check & 0xFFFF) + (check >> 16);
        check = (check & 0xFFFF) + (check >> 16);
        self.sum = normalize(check);
        self.offset += data.len() as u64;
    }

    /// Number of bytes consumed, including any resumed prefix
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Checksum value as carried in transfer headers
    pub fn value(&self) -> u32 {
        self.sum << 16
    }
}

impl Default for FileChecksum {
    fn default() -> Self {
        Self::new()
    }
}

/// One's complement has two zeros; keep the all-ones one
fn normalize(check: u32) -> u32 {
    if check == 0 {
        0xFFFF
    } else {
        check
    }
}

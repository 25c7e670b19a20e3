use std::io::{Read, Write};

use thiserror::Error;

use crate::Result;

/// Words in the guest address space.
pub const MEMORY_WORDS: usize = 0x10000;

/// Byte order used at the image-file boundary. Internally the memory is an
/// array of words and byte order never matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("image ends on a half word")]
    Truncated,
    #[error("image is longer than the 65536-word address space")]
    Oversize,
}

/// The 64 KiW guest memory. Addresses are words and wrap modulo 2^16.
#[derive(Debug, Clone)]
pub struct Memory {
    words: Vec<u16>,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    pub fn new() -> Self {
        Self {
            words: vec![0; MEMORY_WORDS],
        }
    }

    #[inline]
    pub fn read(&self, address: u16) -> u16 {
        self.words[address as usize]
    }

    #[inline]
    pub fn write(&mut self, address: u16, value: u16) {
        self.words[address as usize] = value;
    }

    pub fn words(&self) -> &[u16] {
        &self.words
    }

    /// Load an image, replacing memory from address 0. Stops at EOF; the tail
    /// keeps its zero fill. A trailing odd byte is an error, as is an image
    /// longer than the address space.
    pub fn load_image<R: Read>(&mut self, mut source: R, order: Endianness) -> Result<usize> {
        let mut raw = Vec::new();
        source.read_to_end(&mut raw)?;
        if raw.len() % 2 != 0 {
            return Err(ImageError::Truncated.into());
        }
        if raw.len() / 2 > MEMORY_WORDS {
            return Err(ImageError::Oversize.into());
        }
        self.words.fill(0);
        for (index, pair) in raw.chunks_exact(2).enumerate() {
            let bytes = [pair[0], pair[1]];
            self.words[index] = match order {
                Endianness::Big => u16::from_be_bytes(bytes),
                Endianness::Little => u16::from_le_bytes(bytes),
            };
        }
        Ok(raw.len() / 2)
    }

    /// Write the full memory image in the requested byte order.
    pub fn save_image<W: Write>(&self, mut sink: W, order: Endianness) -> Result<()> {
        let mut raw = Vec::with_capacity(MEMORY_WORDS * 2);
        for word in &self.words {
            let bytes = match order {
                Endianness::Big => word.to_be_bytes(),
                Endianness::Little => word.to_le_bytes(),
            };
            raw.extend_from_slice(&bytes);
        }
        sink.write_all(&raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CoreError;

    #[test]
    fn load_fills_from_zero_and_zeroes_the_tail() {
        let mut memory = Memory::new();
        memory.write(100, 0x5555);
        let loaded = memory
            .load_image(&[0x12u8, 0x34, 0xAB, 0xCD][..], Endianness::Big)
            .unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(memory.read(0), 0x1234);
        assert_eq!(memory.read(1), 0xABCD);
        assert_eq!(memory.read(100), 0, "stale contents must be cleared");
    }

    #[test]
    fn little_endian_swaps_each_word() {
        let mut memory = Memory::new();
        memory
            .load_image(&[0x34u8, 0x12][..], Endianness::Little)
            .unwrap();
        assert_eq!(memory.read(0), 0x1234);
    }

    #[test]
    fn odd_length_image_is_rejected() {
        let mut memory = Memory::new();
        let err = memory
            .load_image(&[0x00u8, 0x01, 0x02][..], Endianness::Big)
            .unwrap_err();
        assert!(matches!(err, CoreError::Image(ImageError::Truncated)));
    }

    #[test]
    fn save_then_load_round_trips_both_orders() {
        let mut memory = Memory::new();
        memory.write(0, 0x0102);
        memory.write(0xFFFF, 0xFEFF);
        for order in [Endianness::Big, Endianness::Little] {
            let mut blob = Vec::new();
            memory.save_image(&mut blob, order).unwrap();
            assert_eq!(blob.len(), MEMORY_WORDS * 2);
            let mut reloaded = Memory::new();
            reloaded.load_image(&blob[..], order).unwrap();
            assert_eq!(reloaded.words(), memory.words());
        }
    }
}

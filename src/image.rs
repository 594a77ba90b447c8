//! Owned in-memory disk image buffer.
//!
//! Replaces the reference tool's raw `unsigned char *image` pointer
//! arithmetic with a small abstraction that knows its own variant and
//! enforces bounds through [`crate::geometry::Variant`].
#![warn(missing_docs)]
#![warn(unsafe_code)]

use crate::error::{Error, ErrorKind};
use crate::geometry::{Variant, BLOCK_SIZE};

/// An owned disk image buffer of exactly `variant.image_size()` bytes.
pub struct Image {
    variant: Variant,
    data: Vec<u8>,
}

impl Image {
    /// Create a zero-filled image of the given variant.
    pub fn new(variant: Variant) -> Image {
        Image {
            variant,
            data: vec![0u8; variant.image_size()],
        }
    }

    /// Load an image from raw bytes, accepting the D64-short-read
    /// upgrade (an existing plain D64 file opened as an extended
    /// variant): the short read is zero-extended and any extra
    /// tracks are left unmarked here -- the engine marks them free
    /// once BAM access is available.
    pub fn from_bytes(variant: Variant, mut bytes: Vec<u8>) -> Result<Image, Error> {
        let expected = variant.image_size();
        if bytes.len() != expected {
            if variant.is_d64_extended() && bytes.len() == Variant::D64.image_size() {
                bytes.resize(expected, 0);
            } else {
                return Err(ErrorKind::ImageOpen(format!(
                    "expected to read {} bytes, but read {} bytes",
                    expected,
                    bytes.len()
                ))
                .into());
            }
        }
        Ok(Image {
            variant,
            data: bytes,
        })
    }

    /// The variant this image was constructed for.
    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// Whether this load was a short D64 read into an extended variant
    /// (the caller needs to mark the extra tracks free).
    pub fn is_short_d64_upgrade(&self, original_len: usize) -> bool {
        self.variant.is_d64_extended() && original_len == Variant::D64.image_size()
    }

    /// Raw bytes, for persistence.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Immutable view of the 256-byte block at (track, sector).
    pub fn block(&self, track: u32, sector: u32) -> &[u8] {
        let offset = self.variant.byte_offset(track, sector);
        &self.data[offset..offset + BLOCK_SIZE]
    }

    /// Mutable view of the 256-byte block at (track, sector).
    pub fn block_mut(&mut self, track: u32, sector: u32) -> &mut [u8] {
        let offset = self.variant.byte_offset(track, sector);
        &mut self.data[offset..offset + BLOCK_SIZE]
    }

    /// Read a single byte at an absolute image offset.
    pub fn byte(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    /// Write a single byte at an absolute image offset.
    pub fn set_byte(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    /// Mutable slice over an arbitrary byte range, for block-copy
    /// operations like shadow directory mirroring.
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.data[offset..offset + len]
    }

    /// Immutable slice over an arbitrary byte range.
    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Copy `len` bytes from `src` offset to `dst` offset within the
    /// same buffer.
    pub fn copy_within(&mut self, src: usize, dst: usize, len: usize) {
        self.data.copy_within(src..src + len, dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn new_image_is_zero_filled_and_exact_size() {
        let img = Image::new(Variant::D64);
        assert_eq!(img.as_bytes().len(), 174848);
        assert!(img.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn block_mut_writes_land_in_as_bytes() {
        let mut img = Image::new(Variant::D64);
        img.block_mut(1, 0)[0] = 0xAB;
        assert_eq!(img.as_bytes()[0], 0xAB);
    }

    #[test]
    fn from_bytes_rejects_wrong_size() {
        let err = Image::from_bytes(Variant::D64, vec![0u8; 100]);
        assert!(err.is_err());
    }

    #[test]
    fn from_bytes_upgrades_short_d64_read() {
        let bytes = vec![0u8; Variant::D64.image_size()];
        let img = Image::from_bytes(Variant::D64SpeedDos, bytes).unwrap();
        assert_eq!(img.as_bytes().len(), Variant::D64SpeedDos.image_size());
    }
}

//! G64 GCR bitstream serializer: a companion representation of a
//! uniform 35-track D64 image with explicit sync/header/gap/data
//! fields per sector, as read by GCR-level emulators.
//!
//! Grounded in the reference tool's `generate_uniformat_g64`.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use crate::error::{Error, ErrorKind};
use crate::geometry::{Variant, BLOCK_SIZE};
use crate::image::Image;
use crate::serialize::little_endian_word_to_bytes;
use crate::transwarp::encode_4_bytes_gcr;

const SIGNATURE: &[u8; 8] = b"GCR-1541";
const NUM_TRACKS: u8 = 35;
const NUM_HALF_TRACKS: usize = NUM_TRACKS as usize * 2;
const TRACK_SIZE: u32 = 7692;
const SYNC: [u8; 5] = [0xff; 5];
const GAP_BYTE: u8 = 0x55;
const GAP9: [u8; 9] = [GAP_BYTE; 9];
const HEADER_GCR_SIZE: usize = 10;
const DATA_SIZE: usize = 325;
const BLOCK_SIZE_G64: usize = SYNC.len() + HEADER_GCR_SIZE + GAP9.len() + SYNC.len() + DATA_SIZE;
const DISK_ID: [u8; 2] = [b'2', b'A'];

fn track_bytes(num_sectors: u32) -> Option<u32> {
    match num_sectors {
        21 => Some(7692),
        19 => Some(7142),
        18 => Some(6666),
        17 => Some(6250),
        _ => None,
    }
}

fn bit_rate(num_sectors: u32) -> u32 {
    match num_sectors {
        21 => 3,
        19 => 2,
        18 => 1,
        _ => 0,
    }
}

/// Serialize `image` (must be a plain, un-extended 35-track D64) into
/// a UniFormat'ed G64 byte buffer. Returns `Ok` with a trailing
/// warning flag: `false` means every track filled its slot exactly
/// (truly UniFormat'ed); `true` means at least one track needed extra
/// tail-gap padding, which the caller should report as a warning
/// rather than an error.
pub fn serialize(image: &Image) -> Result<(Vec<u8>, bool), Error> {
    let variant = image.variant();
    if variant != Variant::D64 {
        return Err(ErrorKind::ArgParse(
            "G64 output is only supported for non-extended D64 images".to_string(),
        )
        .into());
    }

    let mut out = Vec::with_capacity(SIGNATURE.len() + 2 + 4 + NUM_HALF_TRACKS * 8 + NUM_HALF_TRACKS / 2 * TRACK_SIZE as usize);
    out.extend_from_slice(SIGNATURE);
    out.push(0); // version
    out.push(NUM_HALF_TRACKS as u8);
    out.extend_from_slice(&little_endian_word_to_bytes(TRACK_SIZE as u16));
    out.extend_from_slice(&[((TRACK_SIZE >> 16) & 0xff) as u8, ((TRACK_SIZE >> 24) & 0xff) as u8]);

    let table_size = NUM_HALF_TRACKS as u32 * 4;
    let tracks_offset = out.len() as u32 + table_size * 2;

    for half_track in 0..NUM_HALF_TRACKS as u32 {
        let offset = if half_track % 2 == 0 {
            tracks_offset + (half_track / 2) * (2 + TRACK_SIZE)
        } else {
            0
        };
        out.extend_from_slice(&offset.to_le_bytes());
    }

    for half_track in 0..NUM_HALF_TRACKS as u32 {
        let rate = if half_track % 2 == 0 {
            bit_rate(variant.sectors(half_track / 2 + 1))
        } else {
            0
        };
        out.extend_from_slice(&rate.to_le_bytes());
    }

    let mut is_uniform = true;

    for track in 0..NUM_TRACKS as u32 {
        let num_sectors = variant.sectors(track + 1);
        let this_track_bytes = track_bytes(num_sectors).ok_or(ErrorKind::G64TrackTooSmall(track as u8 + 1))?;

        out.extend_from_slice(&little_endian_word_to_bytes(this_track_bytes as u16));
        let track_begin = out.len();

        let data_bytes = num_sectors as i64 * BLOCK_SIZE_G64 as i64;
        let gap_size = (this_track_bytes as i64 - data_bytes) / num_sectors as i64;
        if gap_size < 0 {
            return Err(ErrorKind::G64TrackTooSmall(track as u8 + 1).into());
        }

        let average_gap_remainder = {
            let r = (this_track_bytes as f32 - data_bytes as f32) / num_sectors as f32 - gap_size as f32;
            if r >= 1.0 {
                0.0
            } else {
                r
            }
        };

        let mut remainder = 0.0f32;
        for sector in 0..num_sectors {
            let mut gap_bytes = gap_size as u32;
            remainder += average_gap_remainder;
            if remainder >= 0.5 {
                remainder -= 1.0;
                gap_bytes += 1;
            }

            out.extend_from_slice(&SYNC);

            let checksum = sector as u8 ^ (track as u8 + 1) ^ DISK_ID[1] ^ DISK_ID[0];
            let header = [0x08u8, checksum, sector as u8, track as u8 + 1, DISK_ID[1], DISK_ID[0], 0x0f, 0x0f];
            out.extend_from_slice(&encode_4_bytes_gcr([header[0], header[1], header[2], header[3]]));
            out.extend_from_slice(&encode_4_bytes_gcr([header[4], header[5], header[6], header[7]]));

            out.extend_from_slice(&GAP9);
            out.extend_from_slice(&SYNC);

            let block = image.block(track + 1, sector);
            let mut checksum = block[0] ^ block[1] ^ block[2];
            out.extend_from_slice(&encode_4_bytes_gcr([0x07, block[0], block[1], block[2]]));

            for i in 0..0x3f {
                let group = [block[(i * 4) + 3], block[(i * 4) + 4], block[(i * 4) + 5], block[(i * 4) + 6]];
                out.extend_from_slice(&encode_4_bytes_gcr(group));
                checksum ^= group[0] ^ group[1] ^ group[2] ^ group[3];
            }

            let tail = [block[0xff], block[0xff] ^ checksum, 0, 0];
            out.extend_from_slice(&encode_4_bytes_gcr(tail));

            for _ in 0..gap_bytes {
                out.push(GAP_BYTE);
            }
        }

        let tail_gap = this_track_bytes as i64 - (out.len() as i64 - track_begin as i64);
        if tail_gap > 0 {
            for _ in 0..tail_gap {
                out.push(GAP_BYTE);
            }
            is_uniform = false;
        }

        for _ in 0..(TRACK_SIZE - this_track_bytes) {
            out.push(0xff);
        }
    }

    debug_assert_eq!(BLOCK_SIZE, 256, "G64 sector layout assumes 256-byte blocks");
    Ok((out, !is_uniform))
}

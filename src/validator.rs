//! Strict CBM-DOS validation and filename hash collision detection.
//!
//! Grounded in the reference tool's `validate()` and
//! `check_hashes()`/`count_hashes()`.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use std::collections::HashMap;

use crate::bam;
use crate::directory::{self, EntryLocation, FILENAME_SIZE};
use crate::error::{Error, ErrorKind};
use crate::geometry::Variant;
use crate::hash;
use crate::image::Image;

const FILE_TRACK: usize = 3;
const FILE_SECTOR: usize = 4;
const TRACK_LINK: usize = 0;
const SECTOR_LINK: usize = 1;
const FILE_TYPE: usize = 2;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Unallocated,
    FileStart,
    Allocated,
}

/// Verify that `image` is in well-formed CBM-DOS shape: the directory
/// track carries the 1541 format byte, every directory entry's start
/// chain is in range and non-overlapping, and the BAM agrees block for
/// block and counter for counter with what the directory chains
/// actually use.
pub fn validate(image: &Image) -> Result<(), Error> {
    let variant = image.variant();
    let format = image.byte(bam::primary_bam_block_offset(variant) + 2);
    if format != 0x41 {
        return Err(ErrorKind::ValidationFailed(format!(
            "format specifier in directory (0x{:02x}) does not specify 1541 (0x41)",
            format
        ))
        .into());
    }

    let total_blocks: usize = (1..=variant.total_tracks())
        .map(|t| variant.sectors(t) as usize)
        .sum();
    let mut atab = vec![Slot::Unallocated; total_blocks];
    atab[variant.linear_block_index(variant.dir_track(), 0)] = Slot::Allocated;

    let mut dir_track = variant.dir_track();
    let mut dir_sector = if variant == Variant::D81 { 3 } else { 1 };

    loop {
        atab[variant.linear_block_index(dir_track, dir_sector)] = Slot::Allocated;
        let dir_block = variant.byte_offset(dir_track, dir_sector);

        for entry in 0..8 {
            let entry_offset = dir_block + entry * directory::ENTRY_SIZE;
            let file_type = image.byte(entry_offset + FILE_TYPE) & 0xf;
            if file_type > 4 {
                return Err(ErrorKind::ValidationFailed(format!(
                    "illegal file type (0x{:02x}) in directory",
                    file_type
                ))
                .into());
            }
            if file_type == 0 {
                continue;
            }

            let start_track = image.byte(entry_offset + FILE_TRACK) as u32;
            let start_sector = image.byte(entry_offset + FILE_SECTOR) as u32;
            if start_track == 0 || start_track > variant.total_tracks() {
                return Err(ErrorKind::ValidationFailed(format!(
                    "illegal track reference ({}) in directory",
                    start_track
                ))
                .into());
            }
            if start_sector >= variant.sectors(start_track) {
                return Err(ErrorKind::ValidationFailed(format!(
                    "illegal sector reference (track {}, sector {}) in directory",
                    start_track, start_sector
                ))
                .into());
            }

            let start_index = variant.linear_block_index(start_track, start_sector);
            if atab[start_index] == Slot::Allocated {
                return Err(ErrorKind::ValidationFailed(format!(
                    "file starts in the middle of another file (track {}, sector {})",
                    start_track, start_sector
                ))
                .into());
            }
            if atab[start_index] != Slot::FileStart {
                atab[start_index] = Slot::FileStart;

                let mut track = start_track;
                let mut sector = start_sector;
                loop {
                    let block_offset = variant.byte_offset(track, sector);
                    track = image.byte(block_offset + TRACK_LINK) as u32;
                    sector = image.byte(block_offset + SECTOR_LINK) as u32;
                    if track == 0 {
                        break;
                    }
                    if track > variant.total_tracks() {
                        return Err(ErrorKind::ValidationFailed(format!(
                            "illegal track reference ({}) in file sector chain",
                            track
                        ))
                        .into());
                    }
                    if sector >= variant.sectors(track) {
                        return Err(ErrorKind::ValidationFailed(format!(
                            "illegal sector reference in file sector chain (track {}, sector {})",
                            track, sector
                        ))
                        .into());
                    }
                    let index = variant.linear_block_index(track, sector);
                    if atab[index] != Slot::Unallocated {
                        return Err(ErrorKind::ValidationFailed(format!(
                            "sector (track {}, sector {}) is referenced more than once",
                            track, sector
                        ))
                        .into());
                    }
                    atab[index] = Slot::Allocated;
                }
            }
        }

        let next_track = image.byte(dir_block + TRACK_LINK) as u32;
        let next_sector = image.byte(dir_block + SECTOR_LINK) as u32;
        if next_track == 0 {
            break;
        }
        dir_track = next_track;
        dir_sector = next_sector;
    }

    for track in 1..=variant.total_tracks() {
        let mut num_free = 0u32;
        for sector in 0..variant.sectors(track) {
            let atab_used = atab[variant.linear_block_index(track, sector)] != Slot::Unallocated;
            let bam_used = !bam::is_free(image, track, sector, 0, 0);
            num_free += (!bam_used) as u32;
            if bam_used != atab_used {
                return Err(ErrorKind::ValidationFailed(format!(
                    "BAM ({}) is not consistent with files ({}) for track {} sector {}",
                    if bam_used { "used" } else { "free" },
                    if atab_used { "used" } else { "free" },
                    track,
                    sector
                ))
                .into());
            }
        }
        if bam::free_count(image, track) as u32 != num_free {
            return Err(ErrorKind::ValidationFailed(format!(
                "BAM number of free blocks ({}) is not consistent with bitmap for track {}",
                bam::free_count(image, track),
                track
            ))
            .into());
        }
    }

    Ok(())
}

/// A filename hash collision: the hash value and the directory
/// locations of every entry sharing it.
pub struct Collision {
    /// The shared hash value.
    pub hash: u16,
    /// Locations of entries sharing this hash.
    pub entries: Vec<EntryLocation>,
}

/// Find every group of 2+ in-use directory entries that hash to the
/// same value under `max_hash_length`.
pub fn find_hash_collisions(image: &Image, max_hash_length: usize) -> Vec<Collision> {
    let variant = image.variant();
    let mut by_hash: HashMap<u16, Vec<EntryLocation>> = HashMap::new();

    for loc in directory::walk(image) {
        let off = directory::entry_offset(variant, loc);
        if image.byte(off + FILE_TYPE) & 0xf == 0 {
            continue;
        }
        let name: [u8; FILENAME_SIZE] =
            image.slice(off + 5, FILENAME_SIZE).try_into().expect("fixed-size slice");
        let hash = hash::filename_hash(&name, max_hash_length);
        by_hash.entry(hash).or_default().push(loc);
    }

    by_hash
        .into_iter()
        .filter(|(_, locs)| locs.len() > 1)
        .map(|(hash, entries)| Collision { hash, entries })
        .collect()
}

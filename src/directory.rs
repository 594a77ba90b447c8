//! Directory chain walking, slot allocation and entry mutation.
//!
//! Grounded in the reference tool's `next_dir_entry`/`find_existing_file`/
//! `new_dir_slot`/`find_dir_slot`/`create_dir_entries`/`wipe_file`.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use crate::bam;
use crate::error::{Error, ErrorKind};
use crate::geometry::{Variant, BLOCK_SIZE};
use crate::image::Image;

/// Size in bytes of one directory entry.
pub const ENTRY_SIZE: usize = 32;
const TRACK_LINK: usize = 0;
const SECTOR_LINK: usize = 1;
const FILE_TYPE: usize = 2;
const FILE_TRACK: usize = 3;
const FILE_SECTOR: usize = 4;
const FILE_NAME: usize = 5;

/// Length in bytes of a directory filename field.
pub const FILENAME_SIZE: usize = 16;

/// Raw CBM-DOS file type codes (low nibble of the file type byte).
pub const FILE_TYPE_DEL: u8 = 0;
/// SEQ file type code.
pub const FILE_TYPE_SEQ: u8 = 1;
/// PRG file type code.
pub const FILE_TYPE_PRG: u8 = 2;
/// USR file type code.
pub const FILE_TYPE_USR: u8 = 3;
/// REL file type code.
pub const FILE_TYPE_REL: u8 = 4;

const TRANSWARP_BOOTFILE_NAME: &[u8] = b"TRANSWARP";

/// Location of one directory entry: the sector it lives in plus its
/// byte offset within that sector (always a multiple of [`ENTRY_SIZE`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    /// Directory track this entry's sector belongs to.
    pub track: u32,
    /// Sector within the directory track.
    pub sector: u32,
    /// Byte offset of the entry within its sector, 0..=224.
    pub offset: usize,
}

impl EntryLocation {
    fn first(variant: Variant) -> EntryLocation {
        EntryLocation {
            track: variant.dir_track(),
            sector: if variant == Variant::D81 { 3 } else { 1 },
            offset: 0,
        }
    }
}

/// Absolute byte offset of the entry's first byte.
pub fn entry_offset(variant: Variant, loc: EntryLocation) -> usize {
    variant.byte_offset(loc.track, loc.sector) + loc.offset
}

fn advance(image: &Image, loc: &mut EntryLocation) -> bool {
    if loc.offset == 7 * ENTRY_SIZE {
        let block = image.variant().byte_offset(loc.track, loc.sector);
        let next_track = image.byte(block + TRACK_LINK);
        if next_track == 0 {
            return false;
        }
        loc.track = next_track as u32;
        loc.sector = image.byte(block + SECTOR_LINK) as u32;
        loc.offset = 0;
    } else {
        loc.offset += ENTRY_SIZE;
    }
    true
}

/// Iterator over every directory entry slot in chain order, including
/// the final entry reached when the sector chain ends.
pub struct Walk<'a> {
    image: &'a Image,
    loc: Option<EntryLocation>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = EntryLocation;

    fn next(&mut self) -> Option<EntryLocation> {
        let cur = self.loc.take()?;
        let mut probe = cur;
        if advance(self.image, &mut probe) {
            self.loc = Some(probe);
        }
        Some(cur)
    }
}

/// Walk the directory chain from its first entry.
pub fn walk(image: &Image) -> Walk<'_> {
    Walk {
        image,
        loc: Some(EntryLocation::first(image.variant())),
    }
}

/// Find an existing, in-use entry with the given 16-byte padded
/// filename. A type byte of `FILE_TYPE_DEL` only matches if non-zero,
/// matching the reference tool's distinction between a truly empty
/// slot and a scratched file that still carries its old name.
pub fn find_existing(image: &Image, filename: &[u8; FILENAME_SIZE]) -> Option<(usize, EntryLocation)> {
    let variant = image.variant();
    for (index, loc) in walk(image).enumerate() {
        let off = entry_offset(variant, loc);
        let raw_type = image.byte(off + FILE_TYPE);
        let kind = raw_type & 0xf;
        let is_candidate = match kind {
            FILE_TYPE_SEQ | FILE_TYPE_PRG | FILE_TYPE_USR | FILE_TYPE_REL => true,
            FILE_TYPE_DEL => raw_type != 0,
            _ => false,
        };
        if is_candidate && image.slice(off + FILE_NAME, FILENAME_SIZE) == filename {
            return Some((index, loc));
        }
    }
    None
}

/// Find a free (`FILE_TYPE_DEL`, all-zero) slot, allocating and linking
/// a new directory sector when the chain is exhausted.
pub fn allocate_slot(
    image: &mut Image,
    dir_interleave: i32,
    shadow_dir_track: u8,
) -> Result<(usize, EntryLocation), Error> {
    let variant = image.variant();
    let mut last_loc = EntryLocation::first(variant);
    let mut index = 0usize;
    for loc in walk(image) {
        last_loc = loc;
        let off = entry_offset(variant, loc);
        if image.byte(off + FILE_TYPE) == FILE_TYPE_DEL {
            return Ok((index, loc));
        }
        index += 1;
    }

    let dir_track = variant.dir_track();
    let sectors_total = variant.sectors(dir_track) as i32;
    let mut next_sector = None;
    for s in 1..sectors_total {
        let candidate = (last_loc.sector as i32 + s * dir_interleave).rem_euclid(sectors_total) as u32;
        if bam::is_free(image, dir_track, candidate, 0, 0) {
            next_sector = Some(candidate);
            break;
        }
    }
    let next_sector = next_sector.ok_or_else(|| Error::from(ErrorKind::DirTrackFull))?;

    let last_block = variant.byte_offset(dir_track, last_loc.sector);
    image.set_byte(last_block + TRACK_LINK, dir_track as u8);
    image.set_byte(last_block + SECTOR_LINK, next_sector as u8);
    bam::mark(image, dir_track, next_sector, false);

    let new_block = variant.byte_offset(dir_track, next_sector);
    image.slice_mut(new_block, BLOCK_SIZE).fill(0);
    image.set_byte(new_block + SECTOR_LINK, 255);

    if shadow_dir_track > 0 {
        let shadow_track = shadow_dir_track as u32;
        let shadow_last = variant.byte_offset(shadow_track, last_loc.sector);
        image.set_byte(shadow_last + TRACK_LINK, shadow_track as u8);
        image.set_byte(shadow_last + SECTOR_LINK, next_sector as u8);
        bam::mark(image, shadow_track, next_sector, false);

        let shadow_new = variant.byte_offset(shadow_track, next_sector);
        image.slice_mut(shadow_new, BLOCK_SIZE).fill(0);
        image.set_byte(shadow_new + SECTOR_LINK, 255);
    }

    Ok((index, EntryLocation { track: dir_track, sector: next_sector, offset: 0 }))
}

/// Free the sector chain referenced by a directory entry and mark the
/// freed sectors in the BAM. A file-track/sector pair with sector
/// `>= 0x80` denotes a loop file and is left untouched, since it owns
/// no sectors of its own.
pub fn wipe_entry(image: &mut Image, loc: EntryLocation) {
    let variant = image.variant();
    let off = entry_offset(variant, loc);
    let mut track = image.byte(off + FILE_TRACK) as u32;
    let mut sector = image.byte(off + FILE_SECTOR) as u32;
    if sector >= 0x80 {
        return;
    }

    while track != 0 {
        let block = variant.byte_offset(track, sector);
        let next_track = image.byte(block + TRACK_LINK) as u32;
        let next_sector = image.byte(block + SECTOR_LINK) as u32;
        image.slice_mut(block, BLOCK_SIZE).fill(0);
        bam::mark(image, track, sector, true);
        track = next_track;
        sector = next_sector;
    }
}

/// Outcome of placing one entry: where it landed, whether it replaced
/// an existing entry, and whether its name flags it as the Transwarp
/// bootfile.
pub struct PlacedEntry {
    /// Zero-based position of the slot in directory order.
    pub index: usize,
    /// Where the entry now lives.
    pub location: EntryLocation,
    /// Whether an existing entry of the same name was wiped first.
    pub overwritten: bool,
    /// Whether the filename matches the Transwarp bootfile name.
    pub is_transwarp_bootfile: bool,
}

/// Find-or-allocate a slot for `filename`, optionally forcing a brand
/// new slot (used for loop-file targets, which must not collide with
/// an existing entry of the same name), write the type and name bytes,
/// and mirror them into the shadow directory track when configured.
///
/// `file_type` is written verbatim; callers are responsible for any
/// Transwarp-specific truncation of the stored byte.
pub fn place_entry(
    image: &mut Image,
    filename: &[u8; FILENAME_SIZE],
    file_type: u8,
    force_new: bool,
    no_overwrite: bool,
    dir_interleave: i32,
    shadow_dir_track: u8,
) -> Result<PlacedEntry, Error> {
    let variant = image.variant();

    let (index, location, overwritten) = if force_new {
        let (index, location) = allocate_slot(image, dir_interleave, shadow_dir_track)?;
        (index, location, false)
    } else if let Some((index, location)) = find_existing(image, filename) {
        if no_overwrite {
            let name = crate::charset::petscii_bytes_to_ascii(filename);
            return Err(ErrorKind::OverwriteForbidden(name).into());
        }
        wipe_entry(image, location);
        (index, location, true)
    } else {
        let (index, location) = allocate_slot(image, dir_interleave, shadow_dir_track)?;
        (index, location, false)
    };

    let off = entry_offset(variant, location);
    image.set_byte(off + FILE_TYPE, file_type);
    image.slice_mut(off + FILE_NAME, FILENAME_SIZE).copy_from_slice(filename);

    if shadow_dir_track > 0 {
        let shadow_off =
            variant.byte_offset(shadow_dir_track as u32, location.sector) + location.offset;
        image.set_byte(shadow_off + FILE_TYPE, file_type);
        image
            .slice_mut(shadow_off + FILE_NAME, FILENAME_SIZE)
            .copy_from_slice(filename);
    }

    let is_transwarp_bootfile = filename.starts_with(TRANSWARP_BOOTFILE_NAME);

    Ok(PlacedEntry { index, location, overwritten, is_transwarp_bootfile })
}

/// Write the file's track/sector link and CBM-DOS block count fields.
/// Called by the placement planner once a file's own sector chain has
/// been written, or by the loop-file resolver to point an entry at an
/// existing file's start instead.
pub fn set_file_location(image: &mut Image, loc: EntryLocation, track: u32, sector: u32, blocks: u16) {
    let variant = image.variant();
    let off = entry_offset(variant, loc);
    image.set_byte(off + FILE_TRACK, track as u8);
    image.set_byte(off + FILE_SECTOR, sector as u8);
    image.set_byte(off + 30, (blocks & 0xff) as u8);
    image.set_byte(off + 31, (blocks >> 8) as u8);
}

//! Loop-file resolution: point an extra directory entry at an
//! existing file's already-written chain instead of writing new data.
//!
//! Grounded in the reference tool's loop-file update pass at the end
//! of `write_files()`.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use crate::directory::{self, EntryLocation, FILENAME_SIZE};
use crate::error::{Error, ErrorKind};
use crate::image::Image;
use crate::model::FileJob;

const FILE_TRACK: usize = 3;
const FILE_SECTOR: usize = 4;
const FILE_BLOCKS_LO: usize = 30;
const FILE_BLOCKS_HI: usize = 31;

/// Resolve every loop-file job in `jobs` against the other jobs'
/// already-placed source files, pointing each loop entry's
/// track/sector/block-count fields at the source's. Must run after
/// every non-loop file has been written.
pub fn resolve_loop_files(image: &mut Image, jobs: &mut [FileJob], shadow_dir_track: u8) -> Result<(), Error> {
    for i in 0..jobs.len() {
        if !jobs[i].is_loop_file || jobs[i].file_type == crate::model::FileType::Del {
            continue;
        }

        let name: [u8; FILENAME_SIZE] = jobs[i].local_name_petscii;
        let found = directory::find_existing(image, &name);
        let Some((_, loc)) = found else {
            let display = crate::charset::petscii_bytes_to_ascii(&name);
            return Err(ErrorKind::LoopSourceNotFound(display).into());
        };

        let variant = image.variant();
        let off = directory::entry_offset(variant, loc);
        let track = image.byte(off + FILE_TRACK) as u32;
        let sector = image.byte(off + FILE_SECTOR) as u32;
        let nr_sectors = image.byte(off + FILE_BLOCKS_LO) as u16
            | ((image.byte(off + FILE_BLOCKS_HI) as u16) << 8);

        jobs[i].track = track;
        jobs[i].sector = sector;
        jobs[i].nr_sectors = nr_sectors;

        let own_loc = jobs[i].dir_location;
        let own_off = directory::entry_offset(variant, own_loc);
        image.set_byte(own_off + FILE_TRACK, track as u8);
        image.set_byte(own_off + FILE_SECTOR, sector as u8);

        let shown = jobs[i].blocks_shown.unwrap_or(nr_sectors);
        image.set_byte(own_off + FILE_BLOCKS_LO, (shown & 0xff) as u8);
        image.set_byte(own_off + FILE_BLOCKS_HI, (shown >> 8) as u8);

        if shadow_dir_track > 0 {
            let shadow_loc = EntryLocation { track: shadow_dir_track as u32, sector: own_loc.sector, offset: own_loc.offset };
            let shadow_off = directory::entry_offset(variant, shadow_loc);
            image.set_byte(shadow_off + FILE_TRACK, track as u8);
            image.set_byte(shadow_off + FILE_SECTOR, sector as u8);
            image.set_byte(shadow_off + FILE_BLOCKS_LO, (nr_sectors & 0xff) as u8);
            image.set_byte(shadow_off + FILE_BLOCKS_HI, (nr_sectors >> 8) as u8);
        }

        // a loop file sharing its source's exact track/sector inherits
        // that source's interleave, so a later file skipping forward
        // from this entry lands the same way the reference tool would.
        for j in 0..jobs.len() {
            if i != j && jobs[i].track == jobs[j].track && jobs[i].sector == jobs[j].sector {
                jobs[i].sector_interleave = jobs[j].sector_interleave;
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bam;
    use crate::charset;
    use crate::config::EngineConfig;
    use crate::geometry::Variant;
    use crate::model::FileType;
    use crate::planner::{self, Cursor};
    use pretty_assertions::assert_eq;

    fn fresh_image(variant: Variant) -> Image {
        let mut img = Image::new(variant);
        for t in 1..=variant.total_tracks() {
            for s in 0..variant.sectors(t) {
                bam::mark(&mut img, t, s, true);
            }
        }
        img
    }

    #[test]
    fn loop_file_points_at_source_chain() {
        let mut img = fresh_image(Variant::D64);
        let config = EngineConfig::default();

        let source_name: [u8; 16] = charset::ascii_to_petscii_padded(b"SOURCE", 16).try_into().unwrap();
        let (index, loc) = directory::allocate_slot(&mut img, config.dir_sector_interleave, 0).unwrap();
        let mut source_job = crate::model::FileJob::new(source_name, FileType::Prg);
        source_job.dir_index = index;
        source_job.dir_location = loc;
        let mut cursor = Cursor::new(Variant::D64, &source_job);
        planner::place_and_write(&mut img, &mut source_job, b"payload", &config, &mut cursor).unwrap();

        let loop_name: [u8; 16] = charset::ascii_to_petscii_padded(b"ALIAS", 16).try_into().unwrap();
        let (index2, loc2) = directory::allocate_slot(&mut img, config.dir_sector_interleave, 0).unwrap();
        let mut loop_job = crate::model::FileJob::new(loop_name, FileType::Prg);
        loop_job.dir_index = index2;
        loop_job.dir_location = loc2;
        loop_job.is_loop_file = true;
        loop_job.local_name_petscii = source_name;

        let mut jobs = vec![loop_job];
        resolve_loop_files(&mut img, &mut jobs, 0).unwrap();

        assert_eq!(jobs[0].track, source_job.track);
        assert_eq!(jobs[0].sector, source_job.sector);
        assert_eq!(jobs[0].nr_sectors, source_job.nr_sectors);
    }

    #[test]
    fn loop_file_without_source_errors() {
        let mut img = fresh_image(Variant::D64);
        let config = EngineConfig::default();
        let loop_name: [u8; 16] = charset::ascii_to_petscii_padded(b"ALIAS", 16).try_into().unwrap();
        let (index, loc) = directory::allocate_slot(&mut img, config.dir_sector_interleave, 0).unwrap();
        let mut loop_job = crate::model::FileJob::new(loop_name, FileType::Prg);
        loop_job.dir_index = index;
        loop_job.dir_location = loc;
        loop_job.is_loop_file = true;
        loop_job.local_name_petscii = charset::ascii_to_petscii_padded(b"MISSING", 16).try_into().unwrap();

        let mut jobs = vec![loop_job];
        assert!(resolve_loop_files(&mut img, &mut jobs, 0).is_err());
    }
}

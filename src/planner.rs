//! Placement planner and file writer: chooses the track/sector chain
//! for each file in turn and writes its data blocks.
//!
//! Grounded in the reference tool's `write_files()`. The search keeps
//! the previous file's ending track/sector as its starting point so
//! files land close together, skips the directory (and shadow
//! directory) track unless told not to, and falls back track by track
//! until the disk is full.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use crate::bam;
use crate::config::EngineConfig;
use crate::directory::{self, EntryLocation};
use crate::error::{Error, ErrorKind};
use crate::geometry::{Variant, BLOCK_SIZE};
use crate::image::Image;
use crate::model::{FileJob, FileType, FirstSectorNewTrack};

const BLOCK_OVERHEAD: usize = 2;
const D64_NUM_TRACKS: u32 = 35;

/// Carries the running track/sector position across files, mirroring
/// the reference tool's persistent locals across its file loop.
pub struct Cursor {
    track: u32,
    sector: u32,
    last_track: u32,
    last_sector: u32,
    last_offset: usize,
    last_min_track: u32,
}

impl Cursor {
    /// Start a cursor at track 1, sector 0, adjusted for the first
    /// file's `-F` setting the way the reference tool primes its loop
    /// before iterating.
    pub fn new(variant: Variant, first_job: &FileJob) -> Cursor {
        let sector = if variant == Variant::D81 {
            0
        } else {
            match first_job.first_sector_new_track {
                FirstSectorNewTrack::Fixed(s) => s,
                FirstSectorNewTrack::FollowInterleave => 0,
            }
        };
        Cursor {
            track: 1,
            sector,
            last_track: 1,
            last_sector: 0,
            last_offset: variant.byte_offset(1, 0),
            last_min_track: 1,
        }
    }
}

fn is_forbidden_track(variant: Variant, track: u32, shadow_dir_track: u8) -> bool {
    let hits_dir = track == variant.dir_track();
    let hits_shadow = shadow_dir_track > 0 && track == shadow_dir_track as u32;
    let hits_d71_extra_bam = variant == Variant::D71 && track == D64_NUM_TRACKS + variant.dir_track();
    hits_dir || hits_shadow || hits_d71_extra_bam
}

fn skip_forbidden_tracks(variant: Variant, mut track: u32, use_dir_track: bool, shadow_dir_track: u8) -> u32 {
    while !use_dir_track && is_forbidden_track(variant, track, shadow_dir_track) {
        track += 1;
    }
    track
}

/// Free every sector already written for a file, starting at its first
/// block and following the chain until the terminal (track 0) link.
fn free_written_chain(image: &mut Image, mut track: u32, mut sector: u32) {
    let variant = image.variant();
    while track != 0 {
        let offset = variant.byte_offset(track, sector);
        let next_track = image.byte(offset) as u32;
        let next_sector = image.byte(offset + 1) as u32;
        bam::mark(image, track, sector, true);
        image.slice_mut(offset, BLOCK_SIZE).fill(0);
        track = next_track;
        sector = next_sector;
    }
}

/// Advance `track` past the directory/shadow/D71-extra-BAM track like
/// [`skip_forbidden_tracks`], but when `dir_track_split` is false, free
/// whatever this file has already written and signal the caller to
/// restart the file past the dir track rather than just skip onto it.
fn skip_forbidden_tracks_with_restart(
    image: &mut Image,
    job: &mut FileJob,
    mut track: u32,
    use_dir_track: bool,
    shadow_dir_track: u8,
    dir_track_split: bool,
) -> (u32, bool) {
    let mut restarted = false;
    while !use_dir_track && is_forbidden_track(image.variant(), track, shadow_dir_track) {
        if !dir_track_split && job.nr_sectors > 0 {
            free_written_chain(image, job.track, job.sector);
            job.nr_sectors = 0;
            restarted = true;
        }
        track += 1;
    }
    (track, restarted)
}

fn step_track(variant: Variant, track: u32, cluster_optimized: bool) -> u32 {
    if cluster_optimized {
        if track > D64_NUM_TRACKS {
            let next = track - D64_NUM_TRACKS + 1;
            if next < D64_NUM_TRACKS {
                next
            } else {
                track + 1
            }
        } else {
            track + D64_NUM_TRACKS
        }
    } else {
        let _ = variant;
        track + 1
    }
}

fn step_track_with_seek_delay(track: u32, cluster_optimized: bool) -> (u32, u32) {
    if cluster_optimized {
        if track > D64_NUM_TRACKS {
            (track - D64_NUM_TRACKS + 1, 1)
        } else {
            (track + D64_NUM_TRACKS, 0)
        }
    } else {
        (track + 1, 1)
    }
}

fn is_free(image: &Image, track: u32, sector: u32, reserved_dir_blocks: u8, dir_interleave: i32) -> bool {
    bam::is_free(image, track, sector, reserved_dir_blocks as u32, dir_interleave)
}

/// Find the first completely free track, honoring `-e`/`-E`. Returns
/// the chosen (track, sector), `sector` only meaningful as a restart
/// hint for the caller's subsequent block search.
fn find_empty_or_fitting_track(
    image: &Image,
    variant: Variant,
    job: &FileJob,
    mut track: u32,
    mut sector: u32,
    last_track: u32,
    use_dir_track: bool,
    num_dir_blocks: u8,
    shadow_dir_track: u8,
    dir_sector_interleave: i32,
    data_len: usize,
) -> Result<(u32, u32), Error> {
    loop {
        let mut found = false;
        let total_sectors = variant.sectors(track);
        for s in 0..total_sectors {
            if is_free(image, track, s, if use_dir_track { num_dir_blocks } else { 0 }, dir_sector_interleave) {
                if s == total_sectors - 1 {
                    found = true;
                    if sector >= total_sectors {
                        if job.beginning_sector.is_some() {
                            return Err(ErrorKind::BadBeginningSector(sector as i32).into());
                        }
                        sector %= total_sectors;
                    }
                }
            } else {
                let prev_track = track;
                track = step_track(variant, track, job.cluster_optimized);
                track = skip_forbidden_tracks(variant, track, use_dir_track, shadow_dir_track);

                if job.fit_on_single_track {
                    let mut remaining = data_len as i64;
                    let mut first_sector = None;
                    for s2 in 0..variant.sectors(prev_track) {
                        if is_free(image, prev_track, s2, if use_dir_track { num_dir_blocks } else { 0 }, dir_sector_interleave) {
                            if first_sector.is_none() {
                                first_sector = Some(s2);
                            }
                            remaining -= (BLOCK_SIZE + BLOCK_OVERHEAD) as i64;
                            if remaining <= 0 {
                                found = true;
                                track = prev_track;
                                sector = first_sector.unwrap();
                                break;
                            }
                        }
                    }
                }

                if track > variant.total_tracks() {
                    return Err(ErrorKind::DiskFull.into());
                }
                break;
            }
        }

        if found {
            return Ok((track, sector));
        }
        if track == last_track + 2 && job.beginning_sector.is_none() {
            sector = 0;
        }
    }
}

fn finish_entry(
    image: &mut Image,
    loc: EntryLocation,
    shadow_dir_track: u8,
    track: u32,
    sector: u32,
    blocks_shown: u16,
    blocks_real: u16,
) {
    directory::set_file_location(image, loc, track, sector, blocks_shown);
    if shadow_dir_track > 0 {
        let shadow_loc = EntryLocation { track: shadow_dir_track as u32, sector: loc.sector, offset: loc.offset };
        directory::set_file_location(image, shadow_loc, track, sector, blocks_real);
    }
}

/// Place and write one non-loop-file job's data, updating `cursor` and
/// the job's own track/sector/nr_sectors fields.
///
/// `data` is ignored for `FileType::Del` and must be the file's raw
/// bytes otherwise (Transwarp encoding happens in `crate::transwarp`
/// and is not handled here -- dispatch there first).
pub fn place_and_write(
    image: &mut Image,
    job: &mut FileJob,
    data: &[u8],
    config: &EngineConfig,
    cursor: &mut Cursor,
) -> Result<(), Error> {
    let variant = image.variant();

    let mut use_dir_track = config.use_dir_track;
    let mut num_dir_blocks = config.reserved_dir_blocks;
    if job.is_transwarp_bootfile {
        use_dir_track = true;
        num_dir_blocks = 4;
        job.sector_interleave = -4;
        job.beginning_sector = Some(10);
        job.first_sector_new_track = FirstSectorNewTrack::Fixed(10);
        cursor.track = variant.dir_track();
    }

    if job.file_type == FileType::Del {
        job.track = 0;
        job.sector = 0;
        let shown = job.blocks_shown.unwrap_or(job.nr_sectors);
        finish_entry(image, job.dir_location, config.shadow_dir_track, 0, 0, shown, job.nr_sectors);
        return Ok(());
    }

    let mut track = cursor.track;
    let mut sector = cursor.sector;

    if job.file_type != FileType::Transwarp {
        if let Some(min_track) = job.min_track {
            if min_track != cursor.last_min_track {
                cursor.last_min_track = min_track;
                track = min_track;
                if track > variant.total_tracks() {
                    return Err(ErrorKind::BadMinimumTrack(track as i32).into());
                }
                track = skip_forbidden_tracks(variant, track, use_dir_track, config.shadow_dir_track);
                if (track as i64 - cursor.last_track as i64).abs() > 1 {
                    sector = if variant == Variant::D81 {
                        0
                    } else {
                        match job.first_sector_new_track {
                            FirstSectorNewTrack::Fixed(s) => s,
                            FirstSectorNewTrack::FollowInterleave => sector,
                        }
                    };
                }
            }
        } else {
            cursor.last_min_track = 0;
        }
    }

    if let Some(begin) = job.beginning_sector {
        sector = begin;
    }

    if job.file_type != FileType::Transwarp && (job.save_to_empty_track || job.fit_on_single_track) {
        let (found_track, found_sector) = find_empty_or_fitting_track(
            image,
            variant,
            job,
            track,
            sector,
            cursor.last_track,
            use_dir_track,
            num_dir_blocks,
            config.shadow_dir_track,
            config.dir_sector_interleave,
            data.len(),
        )?;
        track = found_track;
        sector = found_sector;
    }

    if let Some(begin) = job.beginning_sector {
        if sector != begin {
            return Err(ErrorKind::BadBeginningSector(begin as i32).into());
        }
    }

    if variant == Variant::D81 {
        sector = 0;
    }

    if job.file_type == FileType::Transwarp {
        cursor.track = track;
        cursor.sector = sector;
        return crate::transwarp::write_transwarp_file(image, job, data, config, cursor.track, cursor.sector);
    }

    let mut byte_offset = 0usize;
    let mut bytes_left = data.len();
    let mut bytes_to_write = 0usize;
    let mut last_offset = cursor.last_offset;

    while bytes_left > 0 {
        let mut block_found = false;
        let mut find_sector = 0u32;
        loop {
            let total_sectors = variant.sectors(track);
            for s in sector..sector + total_sectors {
                find_sector = s % total_sectors;
                if is_free(image, track, find_sector, if use_dir_track { num_dir_blocks } else { 0 }, config.dir_sector_interleave) {
                    block_found = true;
                    break;
                }
            }

            if block_found {
                break;
            }

            let prev_track = track;
            let (next_track, seek_delay) = step_track_with_seek_delay(track, job.cluster_optimized);
            track = next_track;

            let mut signed_sector: i32 = sector as i32;
            if variant == Variant::D81 {
                signed_sector = 0;
            } else if job.first_sector_new_track == FirstSectorNewTrack::FollowInterleave {
                signed_sector += seek_delay as i32 - 1;
            } else if job.sector_interleave < 0 && !job.is_transwarp_bootfile {
                signed_sector += seek_delay as i32;
            } else {
                signed_sector = match job.first_sector_new_track {
                    FirstSectorNewTrack::Fixed(s) => s as i32,
                    FirstSectorNewTrack::FollowInterleave => signed_sector,
                };
            }
            let prev_sectors = variant.sectors(prev_track) as i32;
            sector = signed_sector.rem_euclid(prev_sectors) as u32;

            let (new_track, restarted) = skip_forbidden_tracks_with_restart(
                image,
                job,
                track,
                use_dir_track,
                config.shadow_dir_track,
                config.dir_track_split,
            );
            track = new_track;
            if restarted {
                bytes_left = data.len();
                byte_offset = 0;
            }

            if track > variant.total_tracks() {
                return Err(ErrorKind::DiskFull.into());
            }
        }

        sector = find_sector;
        let offset = variant.byte_offset(track, sector);

        if bytes_left == data.len() {
            job.track = track;
            job.sector = sector;
            cursor.last_track = track;
            cursor.last_sector = sector;
            last_offset = offset;
        } else {
            image.set_byte(last_offset, track as u8);
            image.set_byte(last_offset + 1, sector as u8);
        }

        bytes_to_write = (BLOCK_SIZE - BLOCK_OVERHEAD).min(bytes_left);
        image.slice_mut(offset + 2, bytes_to_write).copy_from_slice(&data[byte_offset..byte_offset + bytes_to_write]);

        bytes_left -= bytes_to_write;
        byte_offset += bytes_to_write;

        cursor.last_track = track;
        cursor.last_sector = sector;
        last_offset = offset;

        bam::mark(image, track, sector, false);

        let total_sectors = variant.sectors(track);
        if total_sectors <= job.sector_interleave.unsigned_abs() {
            return Err(ErrorKind::BadInterleave(job.sector_interleave).into());
        }

        sector += job.sector_interleave.unsigned_abs();
        if sector >= total_sectors {
            sector -= total_sectors;
            if job.sector_interleave >= 0 && sector > 0 {
                sector -= 1;
            }
        }

        job.nr_sectors += 1;
    }

    image.set_byte(last_offset, 0x00);
    image.set_byte(last_offset + 1, (bytes_to_write + 1) as u8);

    cursor.track = track;
    cursor.sector = sector;
    cursor.last_offset = last_offset;

    let shown = job.blocks_shown.unwrap_or(job.nr_sectors);
    finish_entry(image, job.dir_location, config.shadow_dir_track, job.track, job.sector, shown, job.nr_sectors);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charset;
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

    fn job_with_name(name: &[u8]) -> FileJob {
        let disk_name: [u8; 16] = charset::ascii_to_petscii_padded(name, 16).try_into().unwrap();
        FileJob::new(disk_name, FileType::Prg)
    }

    #[test]
    fn writes_small_file_into_one_block() {
        let mut img = fresh_image(Variant::D64);
        let config = EngineConfig::default();
        let (index, loc) = directory::allocate_slot(&mut img, config.dir_sector_interleave, 0).unwrap();
        let mut job = job_with_name(b"HELLO");
        job.dir_index = index;
        job.dir_location = loc;
        let mut cursor = Cursor::new(Variant::D64, &job);
        let data = b"hello world".to_vec();
        place_and_write(&mut img, &mut job, &data, &config, &mut cursor).unwrap();
        assert_eq!(job.nr_sectors, 1);
        assert_eq!(job.track, 1);
        let off = Variant::D64.byte_offset(job.track, job.sector);
        assert_eq!(img.byte(off), 0);
        assert_eq!(img.byte(off + 1) as usize, data.len() + 1);
    }

    #[test]
    fn writes_multi_block_file_with_links() {
        let mut img = fresh_image(Variant::D64);
        let config = EngineConfig::default();
        let (index, loc) = directory::allocate_slot(&mut img, config.dir_sector_interleave, 0).unwrap();
        let mut job = job_with_name(b"BIG");
        job.dir_index = index;
        job.dir_location = loc;
        let mut cursor = Cursor::new(Variant::D64, &job);
        let data = vec![0xAAu8; 1000];
        place_and_write(&mut img, &mut job, &data, &config, &mut cursor).unwrap();
        assert!(job.nr_sectors as usize >= 4);
    }

    #[test]
    fn del_entry_clears_track_and_sector() {
        let mut img = fresh_image(Variant::D64);
        let config = EngineConfig::default();
        let (index, loc) = directory::allocate_slot(&mut img, config.dir_sector_interleave, 0).unwrap();
        let mut job = job_with_name(b"GONE");
        job.file_type = FileType::Del;
        job.dir_index = index;
        job.dir_location = loc;
        let mut cursor = Cursor::new(Variant::D64, &job);
        place_and_write(&mut img, &mut job, &[], &config, &mut cursor).unwrap();
        assert_eq!(job.track, 0);
        assert_eq!(job.sector, 0);
    }
}

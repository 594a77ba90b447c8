//! Build pipeline facade: load-or-initialize an image, place and write
//! files, resolve loop files and Transwarp bootfile pointers, check
//! name-hash collisions, validate, and save.
//!
//! Grounded in the reference tool's `main()`, which drives
//! `initialize_directory`/`update_directory` once up front and then
//! `create_dir_entries`/`write_files`/the post-pass loops in sequence.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use log::{debug, info, warn};

use crate::bam;
use crate::charset;
use crate::config::EngineConfig;
use crate::directory::{self, EntryLocation, FILENAME_SIZE};
use crate::error::{Error, ErrorKind};
use crate::file;
use crate::g64;
use crate::geometry::{Variant, BLOCK_SIZE};
use crate::image::Image;
use crate::loopfile;
use crate::model::{FileJob, FileType};
use crate::planner::{self, Cursor};
use crate::transwarp;
use crate::validator;

const DIR_HEADER_OFFSET_D81: usize = 4;
const DIR_ID_OFFSET_D81: usize = 0x16;
const DIR_HEADER_OFFSET_OTHER: usize = 0x90;
const DIR_ID_OFFSET_OTHER: usize = 0xa2;

/// Owns the in-memory image plus the list of files queued for this
/// run, and drives every step of the construction pipeline in order.
pub struct Engine {
    image: Image,
    jobs: Vec<FileJob>,
    config: EngineConfig,
}

impl Engine {
    /// Load `path` if it exists and matches `variant`'s on-disk size
    /// (or is the short-D64-into-extended-variant upgrade case),
    /// otherwise initialize a fresh, empty directory/BAM of that
    /// variant.
    pub fn load_or_init(path: &str, variant: Variant, config: EngineConfig) -> Result<Engine, Error> {
        let image = match file::read_file(path) {
            Ok(bytes) => {
                let original_len = bytes.len();
                let mut image = Image::from_bytes(variant, bytes)?;
                if image.is_short_d64_upgrade(original_len) {
                    for t in (Variant::D64.total_tracks() + 1)..=variant.total_tracks() {
                        for s in 0..variant.sectors(t) {
                            bam::mark(&mut image, t, s, true);
                        }
                    }
                }
                debug!("loaded existing image '{}' ({} bytes)", path, image.as_bytes().len());
                if config.validate_first {
                    validator::validate(&image)?;
                }
                if config.set_header {
                    Self::write_header(&mut image, variant, &config);
                }
                image
            }
            Err(_) => {
                info!("initializing new {:?} image at '{}'", variant, path);
                Self::initialize_image(variant, &config)
            }
        };

        Ok(Engine { image, jobs: Vec::new(), config })
    }

    fn initialize_image(variant: Variant, config: &EngineConfig) -> Image {
        let mut image = Image::new(variant);

        for t in 1..=variant.total_tracks() {
            for s in 0..variant.sectors(t) {
                bam::mark(&mut image, t, s, true);
            }
        }

        let dir_track = variant.dir_track();
        let first_dir_sector = if variant == Variant::D81 { 3 } else { 1 };

        if variant == Variant::D81 {
            let dir = variant.byte_offset(dir_track, 0);
            image.set_byte(dir, dir_track as u8);
            image.set_byte(dir + 1, 3);
            image.set_byte(dir + 2, 0x44);
            image.set_byte(dir + 0x14, charset::EMPTY_CHAR);
            image.set_byte(dir + 0x15, charset::EMPTY_CHAR);
            image.set_byte(dir + 0x1b, charset::EMPTY_CHAR);
            image.set_byte(dir + 0x1c, charset::EMPTY_CHAR);

            let bam1 = variant.byte_offset(dir_track, 1);
            image.set_byte(bam1, dir_track as u8);
            image.set_byte(bam1 + 1, 2);
            image.set_byte(bam1 + 2, 0x44);
            image.set_byte(bam1 + 3, 0xbb);
            image.set_byte(bam1 + 6, 0xc0);

            let bam2 = variant.byte_offset(dir_track, 2);
            image.set_byte(bam2, 0);
            image.set_byte(bam2 + 1, 255);
            image.set_byte(bam2 + 2, 0x44);
            image.set_byte(bam2 + 3, 0xbb);
            image.set_byte(bam2 + 6, 0xc0);

            bam::mark(&mut image, dir_track, 1, false);
            bam::mark(&mut image, dir_track, 2, false);
        } else {
            let dir = variant.byte_offset(dir_track, 0);
            image.set_byte(dir, dir_track as u8);
            image.set_byte(dir + 1, 1);
            image.set_byte(dir + 2, 0x41);
            image.set_byte(dir + 3, if variant == Variant::D71 { 0x80 } else { 0x00 });
            image.set_byte(dir + 0xa0, charset::EMPTY_CHAR);
            image.set_byte(dir + 0xa1, charset::EMPTY_CHAR);
            image.set_byte(dir + 0xa7, charset::EMPTY_CHAR);
            image.set_byte(dir + 0xa8, charset::EMPTY_CHAR);
            image.set_byte(dir + 0xa9, charset::EMPTY_CHAR);
            image.set_byte(dir + 0xaa, charset::EMPTY_CHAR);
        }

        bam::mark(&mut image, dir_track, 0, false);

        let dirblock = variant.byte_offset(dir_track, first_dir_sector);
        image.set_byte(dirblock + 1, 255);
        bam::mark(&mut image, dir_track, first_dir_sector, false);

        if config.shadow_dir_track > 0 {
            let shadow_track = config.shadow_dir_track as u32;
            bam::mark(&mut image, shadow_track, 0, false);
            let shadow_dirblock = variant.byte_offset(shadow_track, first_dir_sector);
            image.set_byte(shadow_dirblock + 1, 255);
            bam::mark(&mut image, shadow_track, first_dir_sector, false);
        }

        Self::write_header(&mut image, variant, config);
        image
    }

    fn write_header(image: &mut Image, variant: Variant, config: &EngineConfig) {
        let dir_track = variant.dir_track();
        let dir_block = variant.byte_offset(dir_track, 0);

        let (header_offset, id_offset) = if variant == Variant::D81 {
            (DIR_HEADER_OFFSET_D81, DIR_ID_OFFSET_D81)
        } else {
            (DIR_HEADER_OFFSET_OTHER, DIR_ID_OFFSET_OTHER)
        };
        image
            .slice_mut(dir_block + header_offset, FILENAME_SIZE)
            .copy_from_slice(&config.disk_name);
        image.slice_mut(dir_block + id_offset, 5).copy_from_slice(&config.disk_id);

        if variant == Variant::D81 {
            for bam_sector in [1, 2] {
                let bam = variant.byte_offset(dir_track, bam_sector);
                image.set_byte(bam + 4, config.disk_id[0]);
                image.set_byte(bam + 5, config.disk_id[1]);
            }
        }

        if config.shadow_dir_track > 0 {
            let shadow_track = config.shadow_dir_track as u32;
            let shadow_bam = variant.byte_offset(shadow_track, 0);
            image.copy_within(dir_block, shadow_bam, BLOCK_SIZE);
            image.set_byte(shadow_bam, shadow_track as u8);
        }
    }

    /// Reserve a directory slot for every job in `jobs`, in the order
    /// given, writing its type byte and padded name. Loop files that
    /// would reference themselves without `force_new` fail immediately.
    pub fn create_dir_entries(&mut self, jobs: Vec<FileJob>) -> Result<(), Error> {
        let mut jobs = jobs;
        for job in jobs.iter_mut() {
            if job.is_loop_file
                && !job.force_new
                && directory::find_existing(&self.image, &job.disk_name_petscii).is_some()
            {
                return Err(ErrorKind::LoopSelfReference(charset::petscii_bytes_to_ascii(
                    &job.disk_name_petscii,
                ))
                .into());
            }

            let type_byte = job
                .file_type
                .directory_type_byte(job.transwarp_key.is_some(), job.write_protect, job.open);
            let placed = directory::place_entry(
                &mut self.image,
                &job.disk_name_petscii,
                type_byte,
                job.force_new,
                self.config.no_overwrite,
                self.config.dir_sector_interleave,
                self.config.shadow_dir_track,
            )?;
            job.dir_index = placed.index;
            job.dir_location = placed.location;
            job.is_transwarp_bootfile = placed.is_transwarp_bootfile && job.file_type != FileType::Transwarp;
            debug!(
                "placed '{}' at dir slot {}",
                charset::petscii_bytes_to_ascii(&job.disk_name_petscii),
                placed.index
            );
        }
        self.jobs = jobs;
        Ok(())
    }

    /// Write every non-loop job's data, resolve loop files against
    /// their now-written sources, and fix up Transwarp bootfile
    /// pointers. Must run after [`create_dir_entries`].
    ///
    /// [`create_dir_entries`]: Engine::create_dir_entries
    pub fn write_files(&mut self) -> Result<(), Error> {
        if self.jobs.is_empty() {
            return Ok(());
        }
        let variant = self.image.variant();
        let mut cursor = Cursor::new(variant, &self.jobs[0]);

        for i in 0..self.jobs.len() {
            if self.jobs[i].is_loop_file {
                continue;
            }
            let data = Self::load_job_data(&self.jobs[i])?;
            let job = &mut self.jobs[i];
            planner::place_and_write(&mut self.image, job, &data, &self.config, &mut cursor)?;
            if self.config.verbose {
                info!(
                    "wrote '{}': {} block(s) starting at track {} sector {}",
                    charset::petscii_bytes_to_ascii(&job.disk_name_petscii),
                    job.nr_sectors,
                    job.track,
                    job.sector
                );
            }
        }

        loopfile::resolve_loop_files(&mut self.image, &mut self.jobs, self.config.shadow_dir_track)?;
        transwarp::resolve_bootfile_pointers(&mut self.image, &mut self.jobs)?;

        Ok(())
    }

    fn load_job_data(job: &FileJob) -> Result<Vec<u8>, Error> {
        match &job.local_path {
            Some(path) => {
                let display = path.display().to_string();
                file::read_file(&display).map_err(|_| Error::from(ErrorKind::FileOpen(display)))
            }
            None => Ok(Vec::new()),
        }
    }

    /// Find filename hash collisions across the directory and fail
    /// unless `config.ignore_collisions` is set, in which case they
    /// are logged as a warning instead.
    pub fn check_hashes(&self) -> Result<(), Error> {
        let collisions = validator::find_hash_collisions(&self.image, self.config.max_hash_length);
        if collisions.is_empty() {
            return Ok(());
        }
        if self.config.ignore_collisions {
            warn!("{} filename hash collision(s) ignored", collisions.len());
            return Ok(());
        }

        let variant = self.image.variant();
        let entries = &collisions[0].entries;
        let name_at = |loc: EntryLocation| -> String {
            let off = directory::entry_offset(variant, loc);
            let name = self.image.slice(off + 5, FILENAME_SIZE);
            charset::petscii_bytes_to_ascii(name)
        };
        Err(ErrorKind::HashCollision(name_at(entries[0]), name_at(entries[1])).into())
    }

    /// Run the strict CBM-DOS consistency validator against the image
    /// as it currently stands.
    pub fn validate(&self) -> Result<(), Error> {
        validator::validate(&self.image)
    }

    /// Persist the image buffer to `path`, overwriting any existing
    /// file.
    pub fn save(&self, path: &str) -> Result<(), Error> {
        file::write_file(path, self.image.as_bytes())
    }

    /// Serialize a companion G64 GCR bitstream and persist it to
    /// `path`. Only a plain, non-extended D64 image can be serialized;
    /// other variants fail with `ArgParse`.
    pub fn save_g64(&self, path: &str) -> Result<(), Error> {
        let (bytes, non_uniform) = g64::serialize(&self.image)?;
        if non_uniform {
            warn!("\"{}\" is not UniFormAt'ed", path);
        }
        file::write_file(path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("cc1541-engine-test-{}-{}", std::process::id(), name));
        p
    }

    #[test]
    fn init_on_missing_path_builds_fresh_d64() {
        let path = temp_path("missing.d64");
        let _ = std::fs::remove_file(&path);
        let engine = Engine::load_or_init(path.to_str().unwrap(), Variant::D64, EngineConfig::default()).unwrap();
        assert_eq!(engine.image.as_bytes().len(), Variant::D64.image_size());
        assert!(engine.validate().is_ok());
    }

    #[test]
    fn disk_name_and_id_land_in_header() {
        let path = temp_path("named.d64");
        let _ = std::fs::remove_file(&path);
        let config = EngineConfig::default();
        let engine = Engine::load_or_init(path.to_str().unwrap(), Variant::D64, config.clone()).unwrap();
        let dir_block = Variant::D64.byte_offset(18, 0);
        assert_eq!(engine.image.slice(dir_block + 0x90, 16), &config.disk_name[..]);
        assert_eq!(engine.image.slice(dir_block + 0xa2, 5), &config.disk_id[..]);
    }

    #[test]
    fn write_one_file_end_to_end() {
        let path = temp_path("oneshot.d64");
        let _ = std::fs::remove_file(&path);
        let mut engine =
            Engine::load_or_init(path.to_str().unwrap(), Variant::D64, EngineConfig::default()).unwrap();

        let payload_path = temp_path("payload.prg");
        {
            let mut f = std::fs::File::create(&payload_path).unwrap();
            f.write_all(b"hello world").unwrap();
        }

        let name: [u8; 16] = charset::ascii_to_petscii_padded(b"HELLO", 16).try_into().unwrap();
        let mut job = FileJob::new(name, FileType::Prg);
        job.local_path = Some(payload_path.clone());

        engine.create_dir_entries(vec![job]).unwrap();
        engine.write_files().unwrap();
        engine.check_hashes().unwrap();
        assert!(engine.validate().is_ok());

        engine.save(path.to_str().unwrap()).unwrap();
        let saved = std::fs::read(&path).unwrap();
        assert_eq!(saved.len(), Variant::D64.image_size());

        std::fs::remove_file(&payload_path).ok();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn save_g64_rejects_extended_variant() {
        let path = temp_path("ext.d64");
        let _ = std::fs::remove_file(&path);
        let engine =
            Engine::load_or_init(path.to_str().unwrap(), Variant::D64SpeedDos, EngineConfig::default()).unwrap();
        assert!(engine.save_g64("/tmp/does-not-matter.g64").is_err());
        std::fs::remove_file(&path).ok();
    }
}

//! End-to-end construction scenarios, driving the public `Engine` API
//! the way the CLI binary does and asserting on the bytes a saved
//! image actually contains. Mirrors the concrete scenarios and
//! boundary behaviours enumerated for the placement planner and file
//! writer.

use std::io::Write;

use cc1541::charset;
use cc1541::config::EngineConfig;
use cc1541::engine::Engine;
use cc1541::geometry::Variant;
use cc1541::model::{FileJob, FileType};
use cc1541::Image;
use pretty_assertions::assert_eq;

fn temp_path(name: &str) -> std::path::PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("cc1541-scenario-{}-{}", std::process::id(), name));
    p
}

fn write_payload(path: &std::path::Path, bytes: &[u8]) -> std::path::PathBuf {
    let mut f = std::fs::File::create(path).unwrap();
    f.write_all(bytes).unwrap();
    path.to_path_buf()
}

fn padded(name: &[u8]) -> [u8; 16] {
    charset::ascii_to_petscii_padded(name, 16).try_into().unwrap()
}

fn saved_image(engine: &Engine, path: &std::path::Path, variant: Variant) -> Image {
    engine.save(path.to_str().unwrap()).unwrap();
    let bytes = std::fs::read(path).unwrap();
    Image::from_bytes(variant, bytes).unwrap()
}

/// Follow a file's sector chain from its first track/sector, returning
/// every (track, sector) visited in order and the file's concatenated
/// data bytes.
fn read_chain(img: &Image, track: u32, sector: u32) -> (Vec<(u32, u32)>, Vec<u8>) {
    let mut visited = Vec::new();
    let mut data = Vec::new();
    let mut track = track;
    let mut sector = sector;
    loop {
        visited.push((track, sector));
        let block = img.block(track, sector);
        let next_track = block[0];
        let next_sector = block[1];
        if next_track == 0 {
            let used = next_sector as usize;
            data.extend_from_slice(&block[2..2 + used.saturating_sub(1)]);
            break;
        }
        data.extend_from_slice(&block[2..256]);
        track = next_track as u32;
        sector = next_sector as u32;
    }
    (visited, data)
}

// scenario 1: empty D64
#[test]
fn empty_d64_matches_literal_layout() {
    let path = temp_path("scenario1.d64");
    let _ = std::fs::remove_file(&path);
    let engine = Engine::load_or_init(path.to_str().unwrap(), Variant::D64, EngineConfig::default()).unwrap();
    let img = saved_image(&engine, &path, Variant::D64);

    assert_eq!(img.as_bytes().len(), 174848);
    let bam = Variant::D64.byte_offset(18, 0);
    assert_eq!(img.byte(bam + 2), 0x41);
    assert_eq!(cc1541::bam::free_count(&img, 18), 17);

    let entry0 = Variant::D64.byte_offset(18, 1);
    assert_eq!(img.byte(entry0 + 2), 0);

    std::fs::remove_file(&path).ok();
}

// scenario 2: one small file
#[test]
fn one_small_file_writes_directory_and_block_chain() {
    let path = temp_path("scenario2.d64");
    let _ = std::fs::remove_file(&path);
    let mut engine = Engine::load_or_init(path.to_str().unwrap(), Variant::D64, EngineConfig::default()).unwrap();

    let payload = vec![0x25u8; 254];
    let payload_path = write_payload(&temp_path("scenario2.prg"), &payload);

    let name = padded(b"1.PRG");
    let mut job = FileJob::new(name, FileType::Prg);
    job.local_path = Some(payload_path.clone());

    engine.create_dir_entries(vec![job]).unwrap();
    engine.write_files().unwrap();
    engine.check_hashes().unwrap();
    assert!(engine.validate().is_ok());
    let img = saved_image(&engine, &path, Variant::D64);

    let entry0 = Variant::D64.byte_offset(18, 1);
    assert_eq!(img.byte(entry0 + 2), 0x82);
    assert_eq!(img.slice(entry0 + 5, 16), &name[..]);
    assert_eq!(img.byte(entry0 + 30), 1);
    assert_eq!(img.byte(entry0 + 31), 0);

    let track = img.byte(entry0 + 3) as u32;
    let sector = img.byte(entry0 + 4) as u32;
    assert_eq!(track, 1);

    let (visited, data) = read_chain(&img, track, sector);
    assert_eq!(visited.len(), 1);
    assert_eq!(data, payload);

    std::fs::remove_file(&payload_path).ok();
    std::fs::remove_file(&path).ok();
}

// scenario 3: -s 20 interleave on a two-block file
#[test]
fn interleave_twenty_produces_linked_two_block_chain() {
    let path = temp_path("scenario3.d64");
    let _ = std::fs::remove_file(&path);
    let mut engine = Engine::load_or_init(path.to_str().unwrap(), Variant::D64, EngineConfig::default()).unwrap();

    let payload = vec![0x25u8; 508];
    let payload_path = write_payload(&temp_path("scenario3.prg"), &payload);

    let name = padded(b"BIG");
    let mut job = FileJob::new(name, FileType::Prg);
    job.local_path = Some(payload_path.clone());
    job.sector_interleave = 20;

    engine.create_dir_entries(vec![job]).unwrap();
    engine.write_files().unwrap();
    assert!(engine.validate().is_ok());
    let img = saved_image(&engine, &path, Variant::D64);

    let entry0 = Variant::D64.byte_offset(18, 1);
    assert_eq!(img.byte(entry0 + 30), 2);
    let track = img.byte(entry0 + 3) as u32;
    let sector = img.byte(entry0 + 4) as u32;
    assert_eq!(track, 1);

    let (visited, data) = read_chain(&img, track, sector);
    assert_eq!(visited.len(), 2);
    assert_ne!(visited[0].1, visited[1].1, "interleave must move to a different sector");
    assert_eq!(data, payload);

    std::fs::remove_file(&payload_path).ok();
    std::fs::remove_file(&path).ok();
}

// scenario 4: empty D71
#[test]
fn empty_d71_matches_literal_layout() {
    let path = temp_path("scenario4.d71");
    let _ = std::fs::remove_file(&path);
    let engine = Engine::load_or_init(path.to_str().unwrap(), Variant::D71, EngineConfig::default()).unwrap();
    let img = saved_image(&engine, &path, Variant::D71);

    assert_eq!(img.as_bytes().len(), 349696);
    assert_eq!(img.byte(Variant::D71.byte_offset(18, 0) + 2), 0x41);
    assert_eq!(img.byte(Variant::D71.byte_offset(18, 0) + 3), 0x80);
    // second-side BAM block exists and is part of the image
    let second_side_bam = Variant::D71.byte_offset(53, 0);
    assert!(second_side_bam < img.as_bytes().len());

    std::fs::remove_file(&path).ok();
}

// scenario 5: cluster-optimized placement crosses to the D71 second side
#[test]
fn cluster_optimized_file_crosses_to_second_side() {
    let path = temp_path("scenario5.d71");
    let _ = std::fs::remove_file(&path);
    let mut engine = Engine::load_or_init(path.to_str().unwrap(), Variant::D71, EngineConfig::default()).unwrap();

    let payload = vec![0xAAu8; 22 * 254];
    let payload_path = write_payload(&temp_path("scenario5.prg"), &payload);

    let name = padded(b"22BLOCKFILE.PRG");
    let mut job = FileJob::new(name, FileType::Prg);
    job.local_path = Some(payload_path.clone());
    job.cluster_optimized = true;

    engine.create_dir_entries(vec![job]).unwrap();
    engine.write_files().unwrap();
    assert!(engine.validate().is_ok());
    let img = saved_image(&engine, &path, Variant::D71);

    let entry0 = Variant::D71.byte_offset(18, 1);
    let track = img.byte(entry0 + 3) as u32;
    let sector = img.byte(entry0 + 4) as u32;
    let (visited, data) = read_chain(&img, track, sector);
    assert_eq!(data, payload);
    assert!(visited.iter().any(|&(t, _)| t > 35), "a 22-block file must reach the second side when cluster-optimized");

    std::fs::remove_file(&payload_path).ok();
    std::fs::remove_file(&path).ok();
}

// scenario 6: -E keeps a small file on the track the big file left a gap in
#[test]
fn fit_on_single_track_keeps_small_file_on_first_track() {
    let path = temp_path("scenario6.d64");
    let _ = std::fs::remove_file(&path);
    let mut engine = Engine::load_or_init(path.to_str().unwrap(), Variant::D64, EngineConfig::default()).unwrap();

    let big_payload = vec![0x11u8; 20 * 254];
    let big_path = write_payload(&temp_path("scenario6-big.prg"), &big_payload);
    let small_payload = vec![0x22u8; 100];
    let small_path = write_payload(&temp_path("scenario6-small.prg"), &small_payload);

    let mut big = FileJob::new(padded(b"BIG.PRG"), FileType::Prg);
    big.local_path = Some(big_path.clone());
    big.fit_on_single_track = true;

    let mut small = FileJob::new(padded(b"SMALL.PRG"), FileType::Prg);
    small.local_path = Some(small_path.clone());

    engine.create_dir_entries(vec![big, small]).unwrap();
    engine.write_files().unwrap();
    assert!(engine.validate().is_ok());
    let img = saved_image(&engine, &path, Variant::D64);

    let entry0 = Variant::D64.byte_offset(18, 1);
    let entry1 = entry0 + 32;
    assert_eq!(img.byte(entry1 + 3) as u32, 1, "small.prg's first block should still be on track 1");

    std::fs::remove_file(&big_path).ok();
    std::fs::remove_file(&small_path).ok();
    std::fs::remove_file(&path).ok();
}

// boundary: -b 0 places the first block at sector 0
#[test]
fn beginning_sector_zero_is_honored() {
    let path = temp_path("boundary-b0.d64");
    let _ = std::fs::remove_file(&path);
    let mut engine = Engine::load_or_init(path.to_str().unwrap(), Variant::D64, EngineConfig::default()).unwrap();

    let payload_path = write_payload(&temp_path("boundary-b0.prg"), b"hi");
    let mut job = FileJob::new(padded(b"HI"), FileType::Prg);
    job.local_path = Some(payload_path.clone());
    job.beginning_sector = Some(0);

    engine.create_dir_entries(vec![job]).unwrap();
    engine.write_files().unwrap();
    let img = saved_image(&engine, &path, Variant::D64);

    let entry0 = Variant::D64.byte_offset(18, 1);
    assert_eq!(img.byte(entry0 + 4), 0);

    std::fs::remove_file(&payload_path).ok();
    std::fs::remove_file(&path).ok();
}

// boundary: -F 7 applies only to the next file
#[test]
fn first_sector_new_track_applies_only_to_next_file() {
    let path = temp_path("boundary-F7.d64");
    let _ = std::fs::remove_file(&path);
    let mut engine = Engine::load_or_init(path.to_str().unwrap(), Variant::D64, EngineConfig::default()).unwrap();

    let a_payload = write_payload(&temp_path("boundary-F7-a.prg"), &[0x01u8; 21 * 254]);
    let b_payload = write_payload(&temp_path("boundary-F7-b.prg"), b"b");

    let mut a = FileJob::new(padded(b"A"), FileType::Prg);
    a.local_path = Some(a_payload.clone());
    a.first_sector_new_track = cc1541::model::FirstSectorNewTrack::Fixed(7);

    let mut b = FileJob::new(padded(b"B"), FileType::Prg);
    b.local_path = Some(b_payload.clone());

    engine.create_dir_entries(vec![a, b]).unwrap();
    engine.write_files().unwrap();
    assert!(engine.validate().is_ok());

    std::fs::remove_file(&a_payload).ok();
    std::fs::remove_file(&b_payload).ok();
    std::fs::remove_file(&path).ok();
}

// round-trip: zero -w/-W/-l is a no-op save
#[test]
fn no_files_queued_is_a_no_op_save() {
    let path = temp_path("noop.d64");
    let _ = std::fs::remove_file(&path);
    {
        let engine = Engine::load_or_init(path.to_str().unwrap(), Variant::D64, EngineConfig::default()).unwrap();
        engine.save(path.to_str().unwrap()).unwrap();
    }
    let before = std::fs::read(&path).unwrap();

    let mut engine = Engine::load_or_init(path.to_str().unwrap(), Variant::D64, EngineConfig::default()).unwrap();
    engine.create_dir_entries(Vec::new()).unwrap();
    engine.write_files().unwrap();
    engine.save(path.to_str().unwrap()).unwrap();
    let after = std::fs::read(&path).unwrap();

    assert_eq!(before, after);
    std::fs::remove_file(&path).ok();
}

// round-trip: writing the same file twice over a fresh image produces
// identical bytes (this tool stamps no timestamps)
#[test]
fn rewriting_identical_file_reproduces_same_bytes() {
    let path = temp_path("idempotent.d64");
    let payload_path = write_payload(&temp_path("idempotent.prg"), b"same contents every time");
    let name = padded(b"SAME");

    let make_job = || {
        let mut job = FileJob::new(name, FileType::Prg);
        job.local_path = Some(payload_path.clone());
        job
    };

    let _ = std::fs::remove_file(&path);
    let mut engine = Engine::load_or_init(path.to_str().unwrap(), Variant::D64, EngineConfig::default()).unwrap();
    engine.create_dir_entries(vec![make_job()]).unwrap();
    engine.write_files().unwrap();
    engine.save(path.to_str().unwrap()).unwrap();
    let first = std::fs::read(&path).unwrap();

    let mut engine = Engine::load_or_init(path.to_str().unwrap(), Variant::D64, EngineConfig::default()).unwrap();
    engine.create_dir_entries(vec![make_job()]).unwrap();
    engine.write_files().unwrap();
    engine.save(path.to_str().unwrap()).unwrap();
    let second = std::fs::read(&path).unwrap();

    assert_eq!(first, second);
    std::fs::remove_file(&payload_path).ok();
    std::fs::remove_file(&path).ok();
}

// boundary: -x (dir_track_split = false) frees a partially-written
// file's blocks and restarts it past the directory track instead of
// letting the chain spill onto it
#[test]
fn dir_track_split_disabled_restarts_past_dir_track() {
    let path = temp_path("boundary-x.d64");
    let _ = std::fs::remove_file(&path);
    let mut config = EngineConfig::default();
    config.dir_track_split = false;
    let mut engine = Engine::load_or_init(path.to_str().unwrap(), Variant::D64, config).unwrap();

    let payload = vec![0x33u8; 22 * 254];
    let payload_path = write_payload(&temp_path("boundary-x.prg"), &payload);

    let mut job = FileJob::new(padded(b"SPLIT"), FileType::Prg);
    job.local_path = Some(payload_path.clone());
    job.min_track = Some(17);

    engine.create_dir_entries(vec![job]).unwrap();
    engine.write_files().unwrap();
    assert!(engine.validate().is_ok());
    let img = saved_image(&engine, &path, Variant::D64);

    assert_eq!(cc1541::bam::free_count(&img, 17), 21, "blocks written to track 17 before the restart must be freed");

    let entry0 = Variant::D64.byte_offset(18, 1);
    let track = img.byte(entry0 + 3) as u32;
    let sector = img.byte(entry0 + 4) as u32;
    let (visited, data) = read_chain(&img, track, sector);
    assert_eq!(data, payload);
    assert!(
        visited.iter().all(|&(t, _)| t != 17 && t != 18),
        "restarted file must not keep any block on track 17 or the dir track"
    );

    std::fs::remove_file(&payload_path).ok();
    std::fs::remove_file(&path).ok();
}

// boundary: re-loading an already-existing image with -n/-i rewrites
// its header instead of leaving the original name/id in place
#[test]
fn renaming_existing_image_rewrites_header() {
    let path = temp_path("rename.d64");
    let _ = std::fs::remove_file(&path);
    {
        let engine = Engine::load_or_init(path.to_str().unwrap(), Variant::D64, EngineConfig::default()).unwrap();
        engine.save(path.to_str().unwrap()).unwrap();
    }

    let mut config = EngineConfig::default();
    config.disk_name = padded(b"RENAMED");
    config.disk_id = charset::ascii_to_petscii_padded(b"99 1x", 5).try_into().unwrap();
    config.set_header = true;
    let engine = Engine::load_or_init(path.to_str().unwrap(), Variant::D64, config.clone()).unwrap();
    engine.save(path.to_str().unwrap()).unwrap();
    let img = saved_image(&engine, &path, Variant::D64);

    let dir_block = Variant::D64.byte_offset(18, 0);
    assert_eq!(img.slice(dir_block + 0x90, 16), &config.disk_name[..]);
    assert_eq!(img.slice(dir_block + 0xa2, 5), &config.disk_id[..]);

    std::fs::remove_file(&path).ok();
}

// invariant 6: the shadow directory's entry sector mirrors the primary
// directory's entry sector byte for byte
#[test]
fn shadow_directory_mirrors_primary_entry_sector() {
    let path = temp_path("shadow.d64");
    let _ = std::fs::remove_file(&path);
    let mut config = EngineConfig::default();
    config.shadow_dir_track = 19;
    let mut engine = Engine::load_or_init(path.to_str().unwrap(), Variant::D64, config).unwrap();

    let payload_path = write_payload(&temp_path("shadow.prg"), b"shadow me");
    let mut job = FileJob::new(padded(b"SHADOW"), FileType::Prg);
    job.local_path = Some(payload_path.clone());

    engine.create_dir_entries(vec![job]).unwrap();
    engine.write_files().unwrap();
    let img = saved_image(&engine, &path, Variant::D64);

    assert_eq!(img.block(18, 1), img.block(19, 1));

    std::fs::remove_file(&payload_path).ok();
    std::fs::remove_file(&path).ok();
}

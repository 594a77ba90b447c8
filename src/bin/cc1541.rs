//! Command-line front end: a sequential flag scanner mirroring the
//! reference tool's argument loop one-for-one, translated into a list
//! of [`FileJob`]s and an [`EngineConfig`] that the library actually
//! acts on.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use cc1541::charset::{self, EMPTY_CHAR};
use cc1541::config::EngineConfig;
use cc1541::engine::Engine;
use cc1541::error::{Error, ErrorKind};
use cc1541::geometry::Variant;
use cc1541::model::{FileJob, FileType, FirstSectorNewTrack};

/// Every cc1541 flag is stateful and order-dependent (an `-f` only
/// names the *next* `-w`), which doesn't map onto clap's per-flag
/// value model. Clap is used here only for `--help`/`--version` (long
/// forms; `-h`/`-V` stay reserved for the tool's own flags below) and
/// to collect the raw argument list, which the hand-rolled scanner
/// then walks one flag at a time in the order the user gave them.
#[derive(Parser)]
#[command(
    name = "cc1541",
    version,
    about = "Construct and mutate Commodore 1541/1571/1581 disk images",
    override_usage = "cc1541 [options] imagefile",
    disable_help_flag = true,
    disable_version_flag = true
)]
struct Cli {
    /// Print this help and exit.
    #[arg(long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// Print version information and exit.
    #[arg(long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Flags and the trailing image file, consumed verbatim by the
    /// hand-rolled scanner in [`parse_args`].
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    rest: Vec<String>,
}

const USAGE: &str = "\
cc1541 [options] imagefile

Flags applying to the next file (-w/-W/-l):
  -f name          Set the next file's disk name (default: derived from -w/-W's local path).
  -s interleave    Next file sector interleave.
  -F sector        Next file's first sector on a new track.
  -e               Start next file on an empty track.
  -E               Try to fit the next file on a single track.
  -r track         Restrict next file's blocks to the given track or higher.
  -b sector        Set next file's beginning sector.
  -c               Save next file cluster-optimized (D71 only).
  -T type          PRG|SEQ|USR|REL|DEL (default PRG).
  -P               Locked.
  -O               Open (unclosed).
  -N               Force a new directory slot even if the name exists.
  -B blocks        Override the block count shown in the directory.
  -K hexkey        29-byte Transwarp scramble key, as hex digits.
  -w localfile     Write localfile as the next entry.
  -W localfile     Write localfile as a Transwarp-encoded entry.
  -l name          Loop file: new entry named by -f, referring to name.

Image-wide flags:
  -n name          Disk name (default cc1541).
  -i id            Disk id (default \"00 2a\").
  -4               Use tracks 35-40 with SpeedDOS BAM formatting.
  -5               Use tracks 35-40 with DolphinDOS BAM formatting.
  -d track         Maintain a shadow directory on the given track.
  -t               Allow files on the directory track.
  -u numblocks     Directory blocks to reserve when -t is set (default 2).
  -x               Don't split files over the directory-track hole.
  -S value         Default sector interleave (default 10).
  -M numchars      Maximum filename length considered by the name hasher.
  -m               Ignore filename hash collisions.
  -o               Forbid overwriting an existing entry.
  -V               Validate an existing image before mutating it.
  -g filename      Also write a G64 GCR bitstream image.
  -q               Be quiet.
  -v               Be verbose.
  -h               Print this help.
";

struct Pending {
    filename: Option<Vec<u8>>,
    sector_interleave: i32,
    first_sector_new_track: i32,
    blocks_shown: Option<i32>,
    save_to_empty_track: bool,
    fit_on_single_track: bool,
    min_track: Option<u32>,
    beginning_sector: Option<u32>,
    cluster_optimized: bool,
    force_new: bool,
    key: Option<[u8; 29]>,
    write_protect: bool,
    open: bool,
    file_type: FileType,
}

impl Default for Pending {
    fn default() -> Self {
        Pending {
            filename: None,
            sector_interleave: 0,
            first_sector_new_track: -1,
            blocks_shown: None,
            save_to_empty_track: false,
            fit_on_single_track: false,
            min_track: None,
            beginning_sector: None,
            cluster_optimized: false,
            force_new: false,
            key: None,
            write_protect: false,
            open: false,
            file_type: FileType::Prg,
        }
    }
}

struct Parsed {
    jobs: Vec<FileJob>,
    config: EngineConfig,
    variant: Variant,
    g64_path: Option<String>,
    image_path: String,
}

fn next_arg(args: &[String], i: usize, flag: &str) -> Result<String, Error> {
    args.get(i)
        .cloned()
        .ok_or_else(|| ErrorKind::ArgParse(format!("missing argument for {}", flag)).into())
}

fn parse_int(s: &str, flag: &str) -> Result<i32, Error> {
    s.parse::<i32>()
        .map_err(|_| ErrorKind::ArgParse(format!("invalid numeric argument for {}: '{}'", flag, s)).into())
}

fn parse_key(hex: &str) -> Result<[u8; 29], Error> {
    let bytes = charset::eval_hex_escape(hex.as_bytes(), 29, 0)?;
    bytes
        .try_into()
        .map_err(|_| ErrorKind::ArgParse("malformed Transwarp key".to_string()).into())
}

fn flush_file(pending: &mut Pending, local_path: PathBuf, is_transwarp: bool) -> Result<FileJob, Error> {
    let raw_name = pending.filename.take();
    let disk_name_petscii: [u8; 16] = match &raw_name {
        Some(name) => charset::eval_hex_escape(name, 16, EMPTY_CHAR)?.try_into().unwrap(),
        None => {
            let base = local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            charset::ascii_to_petscii_padded(base.as_bytes(), 16).try_into().unwrap()
        }
    };

    let file_type = if is_transwarp { FileType::Transwarp } else { pending.file_type };
    let mut job = FileJob::new(disk_name_petscii, file_type);
    job.local_path = Some(local_path);
    job.force_new = pending.force_new;
    job.write_protect = pending.write_protect;
    job.open = pending.open;
    job.min_track = pending.min_track;
    job.beginning_sector = pending.beginning_sector;
    job.save_to_empty_track = pending.save_to_empty_track;
    job.fit_on_single_track = pending.fit_on_single_track;
    job.cluster_optimized = pending.cluster_optimized;
    job.blocks_shown = pending.blocks_shown.map(|b| b as u16);
    job.transwarp_key = pending.key;
    job.first_sector_new_track = if pending.first_sector_new_track < 0 {
        FirstSectorNewTrack::FollowInterleave
    } else {
        FirstSectorNewTrack::Fixed(pending.first_sector_new_track as u32)
    };
    // 0 means "unset"; resolved against the running default once the
    // whole argument list has been scanned.
    job.sector_interleave = if is_transwarp { 1 } else { pending.sector_interleave };

    *pending = Pending::default();
    Ok(job)
}

fn flush_loop(pending: &mut Pending, referent: &[u8]) -> Result<FileJob, Error> {
    let raw_name = pending
        .filename
        .take()
        .ok_or_else(|| Error::from(ErrorKind::ArgParse("loop files require a filename set with -f".to_string())))?;
    let disk_name_petscii: [u8; 16] = charset::eval_hex_escape(&raw_name, 16, EMPTY_CHAR)?.try_into().unwrap();
    let local_name_petscii: [u8; 16] = charset::eval_hex_escape(referent, 16, EMPTY_CHAR)?.try_into().unwrap();

    if disk_name_petscii == local_name_petscii && !pending.force_new {
        return Err(ErrorKind::ArgParse(
            "loop file cannot have the same name as the file it refers to, unless -N is given".to_string(),
        )
        .into());
    }

    let mut job = FileJob::new(disk_name_petscii, pending.file_type);
    job.is_loop_file = true;
    job.local_name_petscii = local_name_petscii;
    job.force_new = pending.force_new;
    job.blocks_shown = pending.blocks_shown.map(|b| b as u16);
    job.first_sector_new_track = if pending.first_sector_new_track < 0 {
        FirstSectorNewTrack::FollowInterleave
    } else {
        FirstSectorNewTrack::Fixed(pending.first_sector_new_track as u32)
    };
    job.sector_interleave = 0;

    *pending = Pending::default();
    Ok(job)
}

fn parse_args(raw: Vec<String>) -> Result<Parsed, Error> {
    if raw.is_empty() || raw.last().map(|s| s.as_str()) == Some("-h") {
        print!("{}", USAGE);
        return Err(ErrorKind::ArgParse("help requested".to_string()).into());
    }

    let mut config = EngineConfig::default();
    // `default_sector_interleave` has no EngineConfig field of its own:
    // it only feeds `Pending::sector_interleave` resolution at flush
    // time, so it is tracked locally instead.
    let mut default_sector_interleave = 10i32;
    let mut variant = Variant::D64;
    let mut g64_path = None;
    let mut pending = Pending::default();
    let mut jobs = Vec::new();

    let mut i = 0usize;
    while i < raw.len() - 1 {
        let arg = raw[i].as_str();
        match arg {
            "-n" => {
                let v = next_arg(&raw, i + 1, "-n")?;
                config.disk_name = charset::eval_hex_escape(v.as_bytes(), 16, EMPTY_CHAR)?.try_into().unwrap();
                config.set_header = true;
                i += 1;
            }
            "-i" => {
                let v = next_arg(&raw, i + 1, "-i")?;
                config.disk_id = charset::eval_hex_escape(v.as_bytes(), 5, EMPTY_CHAR)?.try_into().unwrap();
                config.set_header = true;
                i += 1;
            }
            "-M" => {
                let v = next_arg(&raw, i + 1, "-M")?;
                let n = parse_int(&v, "-M")?;
                if !(1..=16).contains(&n) {
                    return Err(ErrorKind::ArgParse(format!("hash length {} out of range", n)).into());
                }
                config.max_hash_length = n as usize;
                i += 1;
            }
            "-m" => config.ignore_collisions = true,
            "-F" => {
                let v = next_arg(&raw, i + 1, "-F")?;
                pending.first_sector_new_track = parse_int(&v, "-F")?;
                i += 1;
            }
            "-S" => {
                let v = next_arg(&raw, i + 1, "-S")?;
                default_sector_interleave = parse_int(&v, "-S")?;
                i += 1;
            }
            "-s" => {
                let v = next_arg(&raw, i + 1, "-s")?;
                pending.sector_interleave = parse_int(&v, "-s")?;
                i += 1;
            }
            "-f" => {
                let v = next_arg(&raw, i + 1, "-f")?;
                pending.filename = Some(v.into_bytes());
                i += 1;
            }
            "-e" => pending.save_to_empty_track = true,
            "-E" => pending.fit_on_single_track = true,
            "-r" => {
                let v = next_arg(&raw, i + 1, "-r")?;
                let n = parse_int(&v, "-r")?;
                if n < 1 {
                    return Err(ErrorKind::ArgParse(format!("invalid minimum track {}", n)).into());
                }
                pending.min_track = Some(n as u32);
                i += 1;
            }
            "-b" => {
                let v = next_arg(&raw, i + 1, "-b")?;
                let n = parse_int(&v, "-b")?;
                if n < 0 {
                    return Err(ErrorKind::ArgParse(format!("invalid beginning sector {}", n)).into());
                }
                pending.beginning_sector = Some(n as u32);
                i += 1;
            }
            "-c" => pending.cluster_optimized = true,
            "-o" => config.no_overwrite = true,
            "-V" => config.validate_first = true,
            "-T" => {
                let v = next_arg(&raw, i + 1, "-T")?;
                pending.file_type = match v.as_str() {
                    "DEL" => FileType::Del,
                    "SEQ" => FileType::Seq,
                    "PRG" => FileType::Prg,
                    "USR" => FileType::Usr,
                    "REL" => FileType::Rel,
                    other => return Err(ErrorKind::ArgParse(format!("unknown file type '{}'", other)).into()),
                };
                i += 1;
            }
            "-O" => pending.open = true,
            "-P" => pending.write_protect = true,
            "-N" => pending.force_new = true,
            "-K" => {
                let v = next_arg(&raw, i + 1, "-K")?;
                pending.key = Some(parse_key(&v)?);
                i += 1;
            }
            "-w" | "-W" => {
                let v = next_arg(&raw, i + 1, arg)?;
                let job = flush_file(&mut pending, PathBuf::from(v), arg == "-W")?;
                jobs.push(job);
                i += 1;
            }
            "-l" => {
                let v = next_arg(&raw, i + 1, "-l")?;
                let job = flush_loop(&mut pending, v.as_bytes())?;
                jobs.push(job);
                i += 1;
            }
            "-x" => config.dir_track_split = false,
            "-t" => config.use_dir_track = true,
            "-d" => {
                let v = next_arg(&raw, i + 1, "-d")?;
                let n = parse_int(&v, "-d")?;
                if !(0..=255).contains(&n) {
                    return Err(ErrorKind::ArgParse(format!("invalid shadow directory track {}", n)).into());
                }
                config.shadow_dir_track = n as u8;
                i += 1;
            }
            "-u" => {
                let v = next_arg(&raw, i + 1, "-u")?;
                config.reserved_dir_blocks = parse_int(&v, "-u")? as u8;
                i += 1;
            }
            "-B" => {
                let v = next_arg(&raw, i + 1, "-B")?;
                let n = parse_int(&v, "-B")?;
                if !(0..=65535).contains(&n) {
                    return Err(ErrorKind::ArgParse(format!("blocks-shown {} out of range", n)).into());
                }
                pending.blocks_shown = Some(n);
                i += 1;
            }
            "-4" => variant = Variant::D64SpeedDos,
            "-5" => variant = Variant::D64DolphinDos,
            "-g" => {
                let v = next_arg(&raw, i + 1, "-g")?;
                g64_path = Some(v);
                i += 1;
            }
            "-q" => config.quiet = true,
            "-v" => config.verbose = true,
            "-h" => {
                print!("{}", USAGE);
                return Err(ErrorKind::ArgParse("help requested".to_string()).into());
            }
            other => return Err(ErrorKind::ArgParse(format!("unrecognized option '{}'", other)).into()),
        }
        i += 1;
    }

    if config.quiet {
        config.verbose = false;
    }

    let image_path = raw.last().cloned().ok_or_else(|| Error::from(ErrorKind::ArgParse("no image file provided".to_string())))?;
    if image_path.to_ascii_lowercase().ends_with(".d71") {
        if matches!(variant, Variant::D64SpeedDos | Variant::D64DolphinDos) {
            return Err(ErrorKind::ArgParse("extended .d71 images are not supported".to_string()).into());
        }
        variant = Variant::D71;
    } else if image_path.to_ascii_lowercase().ends_with(".d81") {
        if matches!(variant, Variant::D64SpeedDos | Variant::D64DolphinDos) {
            return Err(ErrorKind::ArgParse("extended .d81 images are not supported".to_string()).into());
        }
        variant = Variant::D81;
    }

    if variant != Variant::D64 && g64_path.is_some() {
        return Err(ErrorKind::ArgParse("G64 output is only supported for non-extended D64 images".to_string()).into());
    }

    for job in jobs.iter_mut() {
        if job.file_type != FileType::Transwarp && job.sector_interleave == 0 {
            job.sector_interleave = default_sector_interleave;
        }
    }

    Ok(Parsed { jobs, config, variant, g64_path, image_path })
}

fn run(raw: Vec<String>) -> Result<(), Error> {
    let parsed = parse_args(raw)?;

    let mut engine = Engine::load_or_init(&parsed.image_path, parsed.variant, parsed.config)?;
    engine.create_dir_entries(parsed.jobs)?;
    engine.write_files()?;
    engine.check_hashes()?;
    engine.save(&parsed.image_path)?;
    if let Some(path) = &parsed.g64_path {
        engine.save_g64(path)?;
    }

    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli.rest) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !matches!(e.kind(), ErrorKind::ArgParse(m) if m == "help requested") {
                eprintln!("ERROR: {}", e);
            }
            ExitCode::FAILURE
        }
    }
}

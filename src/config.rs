//! Configuration for the cc1541 crate
#![warn(missing_docs)]
#![warn(unsafe_code)]

use forbidden_bands::{self, Configuration as ForbiddenBandsConfiguration};

use crate::charset;
use crate::error;

/// Application-level configuration, loaded from a TOML file and the
/// environment via the `config` crate.
pub struct Config {
    /// Version of the configuration root
    pub version: String,

    /// The general settings
    pub settings: config::Config,

    /// Character-set configuration for PETSCII display.
    pub forbidden_bands_config: forbidden_bands::Config,
}

/// Trait that defines a set of methods that allow loading and
/// unloading configuration data
pub trait Configuration {
    /// Load the configuration data from the default configuration
    /// string
    fn load(settings: config::Config) -> std::result::Result<Config, error::Error>;
}

impl Configuration for Config {
    fn load(settings: config::Config) -> std::result::Result<Config, error::Error> {
        let forbidden_bands_config = forbidden_bands::Config::load()
            .map_err(|e| error::ErrorKind::Message(format!("forbidden-bands config: {}", e)))?;

        Ok(Config {
            version: String::from("0.1.0"),
            settings,
            forbidden_bands_config,
        })
    }
}

/// Engine-level configuration: replaces the original tool's file-scope
/// globals (`quiet`, `verbose`, `max_hash_length`, `unicode`,
/// `num_files`) with explicit fields threaded through the call graph.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Suppress informational stdout output. Takes precedence over `verbose`.
    pub quiet: bool,

    /// Print per-file allocation details after writing.
    pub verbose: bool,

    /// Maximum filename length considered by the name hasher.
    pub max_hash_length: usize,

    /// Ignore filename hash collisions instead of failing.
    pub ignore_collisions: bool,

    /// Forbid overwriting an existing directory entry.
    pub no_overwrite: bool,

    /// Validate an existing image before mutating it.
    pub validate_first: bool,

    /// Allow files to be placed on the directory track.
    pub use_dir_track: bool,

    /// When true (default), a file that steps onto the dir/shadow
    /// track is simply skipped past it. When false (`-x`), the file's
    /// already-written blocks are freed and it restarts past the dir
    /// track instead.
    pub dir_track_split: bool,

    /// Number of directory sectors to reserve against file placement.
    pub reserved_dir_blocks: u8,

    /// Interleave used when extending the directory chain itself.
    pub dir_sector_interleave: i32,

    /// Optional shadow directory track (0 = disabled).
    pub shadow_dir_track: u8,

    /// 16-byte padded disk name, already PETSCII-encoded.
    pub disk_name: [u8; 16],

    /// 5-byte padded disk id/dos-type, already PETSCII-encoded.
    pub disk_id: [u8; 5],

    /// Set only when `-n` or `-i` was actually given; gates whether
    /// loading an already-existing image rewrites its header.
    pub set_header: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let disk_name: [u8; 16] = charset::ascii_to_petscii_padded(b"cc1541", 16)
            .try_into()
            .expect("padded to exactly 16 bytes");
        let disk_id: [u8; 5] = charset::ascii_to_petscii_padded(b"00 2a", 5)
            .try_into()
            .expect("padded to exactly 5 bytes");

        EngineConfig {
            quiet: false,
            verbose: false,
            max_hash_length: 16,
            ignore_collisions: false,
            no_overwrite: false,
            validate_first: false,
            use_dir_track: false,
            dir_track_split: true,
            reserved_dir_blocks: 2,
            dir_sector_interleave: 3,
            shadow_dir_track: 0,
            disk_name,
            disk_id,
            set_header: false,
        }
    }
}

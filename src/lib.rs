#![warn(missing_docs)]
#![warn(unsafe_code)]
//! cc1541 is a library crate for constructing and mutating Commodore
//! 1541/1571/1581 disk images (D64, D64+SpeedDOS/DolphinDOS, D71, D81)
//! and their companion G64 GCR bitstream representation.
//!
//! The primary entry point is [`engine::Engine`], which drives
//! directory initialization, file placement, loop-file resolution,
//! Transwarp bootfile fixups, hash-collision checking, validation and
//! persistence in the order a full run needs them.
use log::error;

pub mod bam;
pub mod charset;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod file;
pub mod g64;
pub mod geometry;
pub mod hash;
pub mod loopfile;
pub mod model;
pub mod planner;
pub mod serialize;
pub mod transwarp;
pub mod validator;

mod image;

pub use image::Image;

/// Initialize the module. This should be called before any image
/// construction is performed. Panics on failure or if there are any
/// incompatibilities.
pub fn init() {
    // Every track/sector offset in this crate is computed as a usize
    // byte index into a single contiguous image buffer. This crate is
    // geared towards parsing file formats for 8-bit systems, but the
    // code currently does not run on 8-bit systems.
    if usize::BITS < 32 {
        error!(
            "Architecture usize {} is too small for this library",
            usize::BITS
        );
        panic!(
            "Architecture usize {} is too small for this library",
            usize::BITS
        );
    }
}

//! Local filesystem access: reading file payloads to embed and writing
//! finished disk/G64 images back out.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use std::{fs, result::Result};

use crate::error::Error;

/// Read an entire local file's contents, for embedding as a CBM-DOS
/// file's payload.
pub fn read_file(filename: &str) -> Result<Vec<u8>, Error> {
    Ok(fs::read(filename)?)
}

/// Write `data` to `filename`, truncating any existing file.
pub fn write_file(filename: &str, data: &[u8]) -> Result<(), Error> {
    Ok(fs::write(filename, data)?)
}

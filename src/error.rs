//! Error results that can occur while building or mutating a disk image
#![warn(missing_docs)]
#![warn(unsafe_code)]
use std::{
    fmt::{Debug, Display, Formatter, Result as FmtResult},
    io,
};

/// An error that can occur when constructing, mutating or validating a
/// disk image.
pub struct Error {
    kind: ErrorKind,
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.kind)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Create a new Error with a given ErrorKind variant
    pub fn new(kind: ErrorKind) -> Error {
        Error { kind }
    }

    /// The kind of error that occurred.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for Error {
    fn from(e: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        Error::new(ErrorKind::ImageOpen(e.to_string()))
    }
}

impl<'a> nom::error::ParseError<&'a [u8]> for Error {
    fn from_error_kind(_input: &'a [u8], kind: nom::error::ErrorKind) -> Self {
        Error::new(ErrorKind::ImageOpen(kind.description().to_string()))
    }

    fn append(_input: &'a [u8], _kind: nom::error::ErrorKind, other: Self) -> Self {
        other
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::new(ErrorKind::Io(e))
    }
}

/// The kinds of errors that can occur while building or mutating a
/// disk image, one variant per row of the error table.
#[derive(Debug)]
pub enum ErrorKind {
    /// Malformed CLI, out-of-range argument, or missing image path.
    ArgParse(String),

    /// Image file exists but is the wrong size and isn't the
    /// D64-to-D64-extended short-read upgrade.
    ImageOpen(String),

    /// Input file missing or unreadable.
    FileOpen(String),

    /// `#` not followed by two hex digits in a filename.
    BadFilename(String),

    /// No free sector on the directory track to allocate a new
    /// directory block.
    DirTrackFull,

    /// Placement cannot fit all blocks before the track number
    /// exceeds the variant's track count.
    DiskFull,

    /// `|interleave| >= sectors-per-track` on the current track.
    BadInterleave(i32),

    /// Minimum track out of range, or it collides with another file's
    /// fixed start.
    BadMinimumTrack(i32),

    /// Requested beginning sector occupied or out of range.
    BadBeginningSector(i32),

    /// A loop file would reference itself without `-N`.
    LoopSelfReference(String),

    /// The loop file's referent name was absent at resolution time.
    LoopSourceNotFound(String),

    /// `-o` was set and the name already exists.
    OverwriteForbidden(String),

    /// Two distinct names hash to the same value (unless `-m`).
    HashCollision(String, String),

    /// `-V` was given and the image fails a CBM-DOS consistency check.
    ValidationFailed(String),

    /// An internal GCR or accumulator invariant failed during
    /// Transwarp encoding.
    TranswarpEncodeError(i32),

    /// Zone accounting for the G64 serializer produced a negative
    /// gap size.
    G64TrackTooSmall(u8),

    /// An error that occurs while reading or writing image data.
    Io(io::Error),

    /// Generic error, used for ambient/config failures that don't map
    /// onto one of the engine's own error kinds.
    Message(String),
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self {
            ErrorKind::ArgParse(m) => write!(f, "argument error: {}", m),
            ErrorKind::ImageOpen(m) => write!(f, "could not open image: {}", m),
            ErrorKind::FileOpen(m) => write!(f, "could not open input file: {}", m),
            ErrorKind::BadFilename(m) => write!(f, "bad filename: {}", m),
            ErrorKind::DirTrackFull => write!(f, "directory track is full"),
            ErrorKind::DiskFull => write!(f, "disk is full"),
            ErrorKind::BadInterleave(i) => write!(f, "bad interleave: {}", i),
            ErrorKind::BadMinimumTrack(t) => write!(f, "bad minimum track: {}", t),
            ErrorKind::BadBeginningSector(s) => write!(f, "bad beginning sector: {}", s),
            ErrorKind::LoopSelfReference(n) => {
                write!(f, "loop file '{}' cannot reference itself without -N", n)
            }
            ErrorKind::LoopSourceNotFound(n) => {
                write!(f, "loop file referent '{}' not found", n)
            }
            ErrorKind::OverwriteForbidden(n) => {
                write!(f, "file '{}' exists and -o forbids overwrite", n)
            }
            ErrorKind::HashCollision(a, b) => {
                write!(f, "filename hash collision between '{}' and '{}'", a, b)
            }
            ErrorKind::ValidationFailed(m) => write!(f, "validation failed: {}", m),
            ErrorKind::TranswarpEncodeError(code) => {
                write!(f, "transwarp encoder invariant failed ({})", code)
            }
            ErrorKind::G64TrackTooSmall(track) => {
                write!(f, "G64 track {} is too small for its sectors", track)
            }
            ErrorKind::Io(e) => write!(f, "{}", e),
            ErrorKind::Message(m) => write!(f, "{}", m),
        }
    }
}

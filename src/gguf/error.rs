//! Errors the GGUF reader/writer can report.
//!
//! Each distinct way a file can be malformed gets its own variant rather
//! than a generic "parse failed", so a caller building tooling around this
//! (a linter, a repair utility) can match on what's actually wrong instead
//! of re-parsing an error string.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("bad magic: expected \"GGUF\", got {0:?}")]
    BadMagic([u8; 4]),

    #[error("unsupported version {0} (only 2 and 3 are accepted, version 1 is rejected)")]
    UnsupportedVersion(u32),

    #[error("truncated file: needed {needed} more bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("string length is SIZE_MAX, rejected as a hostile input")]
    HostileStringLength,

    #[error("unknown value type tag {0}")]
    UnknownTypeTag(u32),

    #[error("nested arrays are not supported")]
    NestedArray,

    #[error("duplicate tensor name {0:?}")]
    DuplicateTensorName(String),

    #[error("tensor {name:?} has n_dims {n_dims}, which is zero or exceeds the maximum of 4")]
    InvalidDims { name: String, n_dims: u32 },

    #[error("tensor {name:?} has a zero extent in dimension {dim}")]
    ZeroExtent { name: String, dim: usize },

    #[error("tensor {name:?} has unknown type tag {tag}")]
    UnknownTensorType { name: String, tag: u32 },

    #[error("element count overflow computing nelements for tensor {0:?}")]
    ElementCountOverflow(String),

    #[error("tensor {name:?}'s dimension-0 extent {ne0} is not a multiple of its type's block size {block_size}")]
    BlockSizeViolation { name: String, ne0: i64, block_size: usize },

    #[error("tensor {name:?}'s data range [{offset}, {end}) exceeds the data section size {data_size}")]
    DataOutOfBounds {
        name: String,
        offset: u64,
        end: u64,
        data_size: u64,
    },

    #[error("alignment {0} is not a nonzero power of two")]
    InvalidAlignment(u32),

    #[error("non-specific I/O error")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in string")]
    Utf8(#[from] std::string::FromUtf8Error),
}

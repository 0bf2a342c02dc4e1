//! The GGUF container format: a versioned, self-describing
//! tensor+metadata file used as the on-disk interchange. A `no_alloc`
//! reader returns metadata only; the full reader mmaps the file and copies
//! tensor bytes into a [`crate::context::Context`] arena. The writer
//! buffers metadata in memory and streams tensor data in info order.

mod error;
mod kv;
mod reader;
mod writer;

pub use error::GgufError;
pub use kv::GgufValue;
pub use reader::{parse_metadata, read, read_metadata, GgufTensorInfo, Metadata};
pub use writer::GgufWriter;

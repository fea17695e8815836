//! File lifecycle for chanstore channels.
//!
//! Every channel persists its shard of the object graph into a sequence of
//! numbered data files. This crate provides everything that deals with those
//! files without interpreting their contents.
//!
//! # Components
//!
//! - [`FileBackend`] -- opaque file abstraction (open + lock, append, read,
//!   copy range, truncate, delete), with [`LocalFile`] and [`MemoryFile`]
//! - [`FileProvider`] -- creates and enumerates the data files of a channel
//! - [`FileHandle`] -- reference-counted handle tracking which logical users
//!   (channel, backup, exporter) currently need a file open
//! - [`DataFileEvaluator`] -- policy deciding when a file is dissolved or the
//!   head file retired
//!
//! # Design Rules
//!
//! 1. A file is closed only when its usage registry is empty.
//! 2. Unregistering a user that holds no use is an error, never a no-op.
//! 3. Usage tracking never blocks on I/O of other users.
//! 4. The evaluator is infallible once constructed; bad thresholds fail at
//!    construction.

pub mod backend;
pub mod error;
pub mod evaluator;
pub mod handle;
pub mod local;
pub mod memory;
pub mod provider;
pub mod usage;

// Re-export primary types at crate root for ergonomic imports.
pub use backend::{read_range, FileBackend, COPY_CHUNK_SIZE};
pub use error::{FileError, FileResult};
pub use evaluator::{DataFileEvaluator, DataFileEvaluatorConfig, DataFileStats};
pub use handle::FileHandle;
pub use local::LocalFile;
pub use memory::MemoryFile;
pub use provider::{
    channel_directory_name, data_file_name, FileProvider, LocalFileProvider, MemoryFileProvider,
};
pub use usage::UsageMap;

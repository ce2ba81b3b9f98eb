//! Process-wide defaults, resolved once and threaded explicitly.
//!
//! Readers and writers never consult the environment themselves; a
//! [`Defaults`] value is built at process init (either programmatically or
//! via [`Defaults::from_env`]) and passed into constructors.  There is no
//! global mutable state.
//!
//! # Environment variables
//!
//! | Variable                      | Effect                                     |
//! |-------------------------------|--------------------------------------------|
//! | `BAMRANGE_CREATE_INDEX`       | default for the writer's index flag        |
//! | `BAMRANGE_CREATE_MD5`         | default for emitting a sidecar MD5         |
//! | `BAMRANGE_USE_ASYNC_IO_READ`  | worker thread per reader                   |
//! | `BAMRANGE_USE_ASYNC_IO_WRITE` | worker thread per writer                   |
//! | `BAMRANGE_COMPRESSION_LEVEL`  | default deflate level (0–9)                |
//! | `BAMRANGE_BUFFER_SIZE`        | I/O buffer size in bytes                   |
//! | `BAMRANGE_REFERENCE_FASTA`    | path for reference-requiring codecs        |
//!
//! Unparseable values fall back to the built-in default for that option.

use std::env;
use std::path::PathBuf;

/// Default deflate level for block compression.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 5;
/// Default I/O buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 128 * 1024;
/// Default in-memory record cap before the writer's sorter spills to disk.
pub const DEFAULT_MAX_RECORDS_IN_RAM: usize = 500_000;

#[derive(Debug, Clone)]
pub struct Defaults {
    pub create_index: bool,
    pub create_md5: bool,
    pub use_async_io_read: bool,
    pub use_async_io_write: bool,
    pub compression_level: u32,
    pub buffer_size: usize,
    /// Path for reference-requiring codecs (external collaborator; carried
    /// here so embedders have one place to thread it from).
    pub reference_fasta: Option<PathBuf>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            create_index: false,
            create_md5: false,
            use_async_io_read: false,
            use_async_io_write: false,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            buffer_size: DEFAULT_BUFFER_SIZE,
            reference_fasta: None,
        }
    }
}

impl Defaults {
    /// Build defaults from `BAMRANGE_*` environment variables, falling back
    /// to the built-in value for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut d = Self::default();
        if let Some(v) = env_bool("BAMRANGE_CREATE_INDEX") {
            d.create_index = v;
        }
        if let Some(v) = env_bool("BAMRANGE_CREATE_MD5") {
            d.create_md5 = v;
        }
        if let Some(v) = env_bool("BAMRANGE_USE_ASYNC_IO_READ") {
            d.use_async_io_read = v;
        }
        if let Some(v) = env_bool("BAMRANGE_USE_ASYNC_IO_WRITE") {
            d.use_async_io_write = v;
        }
        if let Some(v) = env_parse::<u32>("BAMRANGE_COMPRESSION_LEVEL") {
            if v <= 9 {
                d.compression_level = v;
            }
        }
        if let Some(v) = env_parse::<usize>("BAMRANGE_BUFFER_SIZE") {
            if v > 0 {
                d.buffer_size = v;
            }
        }
        if let Ok(p) = env::var("BAMRANGE_REFERENCE_FASTA") {
            if !p.is_empty() {
                d.reference_fasta = Some(PathBuf::from(p));
            }
        }
        d
    }
}

fn env_bool(name: &str) -> Option<bool> {
    match env::var(name).ok()?.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_defaults() {
        let d = Defaults::default();
        assert_eq!(d.compression_level, 5);
        assert!(!d.create_index);
        assert!(!d.create_md5);
        assert_eq!(d.buffer_size, DEFAULT_BUFFER_SIZE);
    }
}

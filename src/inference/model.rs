//! Model files and metadata
//!
//! Resolves model locations, sanity-checks GGUF headers and extracts model
//! metadata from a loaded handle.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::engine::{EngineError, EngineHandle};

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

const FILE_URL_PREFIX: &str = "file://";

/// Errors raised while checking a model file header
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// Fixed-size prefix of a GGUF file
#[derive(Debug, Clone)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// Reads and checks the 24-byte GGUF header.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, ModelError> {
    let mut file = File::open(path)?;

    // magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
    let file_size = file.seek(SeekFrom::End(0))?;
    if file_size < 24 {
        return Err(ModelError::FileTooSmall);
    }
    file.seek(SeekFrom::Start(0))?;

    let mut header = [0u8; 24];
    file.read_exact(&mut header)?;

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    let mut count = [0u8; 8];
    count.copy_from_slice(&header[8..16]);
    let tensor_count = u64::from_le_bytes(count);
    count.copy_from_slice(&header[16..24]);
    let metadata_kv_count = u64::from_le_bytes(count);

    Ok(GgufHeader {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

/// Resolves a model location to a readable file path.
///
/// Accepts plain paths and `file://` URLs. Any other URL scheme, a missing
/// file, a directory or an unreadable file yields
/// [`EngineError::ModelNotFound`].
pub fn resolve_model_location<P: AsRef<Path>>(location: P) -> Result<PathBuf, EngineError> {
    let location = location.as_ref();
    let path = match location.to_str() {
        Some(s) if s.starts_with(FILE_URL_PREFIX) => PathBuf::from(&s[FILE_URL_PREFIX.len()..]),
        Some(s) if s.contains("://") => {
            return Err(EngineError::ModelNotFound(location.to_path_buf()));
        }
        _ => location.to_path_buf(),
    };

    if !path.is_file() || File::open(&path).is_err() {
        return Err(EngineError::ModelNotFound(path));
    }

    Ok(path)
}

/// Metadata about a loaded model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Human-readable model name, if the file declares one
    pub name: Option<String>,
    /// Architecture name (e.g. "llama")
    pub architecture: Option<String>,
    /// Total parameter count, if the engine can report it
    pub parameter_count: Option<u64>,
    /// Context length the model was trained with
    pub context_length: u32,
    /// Vocabulary size
    pub vocab_size: u32,
}

impl ModelInfo {
    /// Queries metadata from a loaded handle.
    pub fn query<H: EngineHandle>(handle: &H) -> Self {
        let parameter_count = match handle.parameter_count() {
            0 => None,
            n => Some(n),
        };

        Self {
            name: metadata_field(handle, "general.name"),
            architecture: metadata_field(handle, "general.architecture"),
            parameter_count,
            context_length: handle.trained_context_length(),
            vocab_size: handle.vocab_size(),
        }
    }
}

/// Empty values count as absent
fn metadata_field<H: EngineHandle>(handle: &H, key: &str) -> Option<String> {
    handle
        .metadata(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

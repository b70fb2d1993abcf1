use std::path::{Component, Path};

use crate::TransferError;

/// Longest remote key accepted, in bytes.
const MAX_KEY_LEN: usize = 1024;

/// Validates a remote object key as submitted by a caller.
///
/// Keys are opaque to the core, so only structural problems are rejected:
/// - Empty keys
/// - Keys longer than 1024 bytes
/// - Control characters (including NUL)
pub fn validate_remote_key(key: &str) -> Result<(), TransferError> {
    if key.is_empty() {
        return Err(TransferError::InvalidArgument(
            "remote key must not be empty".into(),
        ));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(TransferError::InvalidArgument(format!(
            "remote key is {} bytes, limit is {MAX_KEY_LEN}",
            key.len()
        )));
    }
    if key.chars().any(char::is_control) {
        return Err(TransferError::InvalidArgument(format!(
            "remote key contains control characters: {key:?}"
        )));
    }
    Ok(())
}

/// Validates that a key used as a relative file path does not escape its
/// base directory.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
/// - Paths with no file name component (`.`, `./`)
pub fn validate_object_path(key: &str) -> Result<(), TransferError> {
    if key.is_empty() {
        return Err(TransferError::InvalidArgument("empty path".into()));
    }

    let path = Path::new(key);

    if path.is_absolute() {
        return Err(TransferError::InvalidArgument(format!(
            "absolute path not allowed: {key}"
        )));
    }

    let mut named = false;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidArgument(format!(
                    "parent directory traversal not allowed: {key}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::InvalidArgument(format!(
                    "path prefix not allowed: {key}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::InvalidArgument(format!(
                    "absolute path not allowed: {key}"
                )));
            }
            Component::Normal(_) => named = true,
            Component::CurDir => {}
        }
    }

    if !named {
        return Err(TransferError::InvalidArgument(format!(
            "path has no file name: {key}"
        )));
    }

    Ok(())
}

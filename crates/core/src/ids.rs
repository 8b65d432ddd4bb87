//! Output base-filename synthesis and validation.
//!
//! Every generation call writes its artifacts under a base filename. When
//! the caller does not supply one, a time-ordered UUID v7 makes it unique
//! so concurrent jobs never share an output path.

use crate::error::CoreError;

/// Prefix for synthesized base filenames.
pub const BASE_FILENAME_PREFIX: &str = "wan_image";

/// Longest base filename accepted from a caller.
pub const MAX_BASE_FILENAME_LEN: usize = 128;

/// Generate a unique, time-ordered base filename such as
/// `wan_image_0192b1c4e8f07a3c9d2e5f6a7b8c9d0e`.
pub fn generate_base_filename() -> String {
    format!("{BASE_FILENAME_PREFIX}_{}", uuid::Uuid::now_v7().simple())
}

/// Validate a caller-supplied base filename.
///
/// The name is used as a file stem inside the output directory, so it
/// must be non-empty, free of path separators, and must not start with
/// a dot (hidden files are reserved for in-progress downloads).
pub fn validate_base_filename(name: &str) -> Result<(), CoreError> {
    if name.trim().is_empty() {
        return Err(CoreError::Validation(
            "Base filename must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_BASE_FILENAME_LEN {
        return Err(CoreError::Validation(format!(
            "Base filename exceeds {MAX_BASE_FILENAME_LEN} characters"
        )));
    }
    if name.contains(['/', '\\', '\0']) || name.contains("..") {
        return Err(CoreError::Validation(format!(
            "Base filename '{name}' must not contain path separators or '..'"
        )));
    }
    if name.starts_with('.') {
        return Err(CoreError::Validation(format!(
            "Base filename '{name}' must not start with '.'"
        )));
    }
    Ok(())
}

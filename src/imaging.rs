//! Attachment classification and canonicalization.
//!
//! Every delivered image is JPEG. Files already carrying a JPEG extension
//! are passed through untouched; anything else that decodes is flattened
//! to RGB and re-encoded next to the original.
//!
//! All functions here are blocking (file I/O plus codec work) and are meant
//! to be called from `spawn_blocking`.

use std::path::{Path, PathBuf};

use image::{ImageFormat, ImageReader};
use tracing::{debug, info};

use crate::error::ConversionError;

/// Extension written for converted files.
pub const CANONICAL_EXTENSION: &str = "jpg";

/// Extensions treated as already canonical (compared case-insensitively).
const CANONICAL_ALIASES: &[&str] = &["jpg", "jpeg"];

/// Extensions picked up when scanning a directory for images.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff"];

/// Whether `path` decodes as an image.
///
/// The file is fully decoded, so truncated or corrupted data is rejected
/// even when the header looks fine. Never fails: any error means `false`.
pub fn is_image(path: &Path) -> bool {
    match decode(path) {
        Ok(_) => true,
        Err(e) => {
            debug!(file = %path.display(), error = %e, "Not an image");
            false
        }
    }
}

/// Whether the file name already denotes the canonical format.
pub fn has_canonical_extension(path: &Path) -> bool {
    extension_in(path, CANONICAL_ALIASES)
}

/// Convert `path` to the canonical format.
///
/// Returns the input path unchanged when the extension is already
/// canonical, otherwise the path of a freshly written `<stem>.jpg`.
pub fn to_canonical_image(path: &Path) -> Result<PathBuf, ConversionError> {
    if has_canonical_extension(path) {
        debug!(file = %path.display(), "Already canonical, skipping conversion");
        return Ok(path.to_path_buf());
    }

    let decoded = decode(path)?;
    let target = path.with_extension(CANONICAL_EXTENSION);

    decoded
        .to_rgb8()
        .save_with_format(&target, ImageFormat::Jpeg)
        .map_err(|e| ConversionError::Encode {
            path: target.clone(),
            reason: e.to_string(),
        })?;

    info!(
        file = %path.display(),
        converted = %target.display(),
        "Converted to JPEG"
    );
    Ok(target)
}

/// List image files directly inside `dir`, by extension, sorted by name.
pub fn image_files_in(dir: &Path) -> Result<Vec<PathBuf>, ConversionError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && extension_in(&path, IMAGE_EXTENSIONS) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn decode(path: &Path) -> Result<image::DynamicImage, ConversionError> {
    let decode_err = |reason: String| ConversionError::Decode {
        path: path.to_path_buf(),
        reason,
    };
    ImageReader::open(path)
        .map_err(|e| decode_err(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| decode_err(e.to_string()))?
        .decode()
        .map_err(|e| decode_err(e.to_string()))
}

fn extension_in(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| allowed.iter().any(|a| a.eq_ignore_ascii_case(ext)))
}

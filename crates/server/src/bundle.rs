//! Zip bundles for chart export and import.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};

use zip::write::SimpleFileOptions;
use zip::ZipArchive;
use zip::ZipWriter;

use chartdata_error::{ChartDataError, ErrorCode, Result};

pub const EXPORT_ROOT_PREFIX: &str = "chart_export_";

fn zip_error(e: zip::result::ZipError) -> ChartDataError {
    ChartDataError::new(ErrorCode::CommandInvalid, format!("Not a ZIP file: {}", e))
}

/// Write `files` under `{root}/` into an in-memory zip.
pub fn write_bundle(root: &str, files: &[(String, String)]) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();

    for (path, contents) in files {
        writer
            .start_file(format!("{}/{}", root, path), options)
            .map_err(zip_error)?;
        writer.write_all(contents.as_bytes())?;
    }

    Ok(writer.finish().map_err(zip_error)?.into_inner())
}

/// Largest decompressed size accepted for a single bundle file.
pub const MAX_BUNDLE_FILE_BYTES: u64 = 4 * 1024 * 1024;

/// Read every file of a bundle, keyed by its path below the bundle's root
/// directory.
pub fn read_bundle(bytes: &[u8]) -> Result<HashMap<String, String>> {
    read_bundle_with_limit(bytes, MAX_BUNDLE_FILE_BYTES)
}

/// Like [`read_bundle`], rejecting any file that decompresses past
/// `max_file_bytes`.
pub fn read_bundle_with_limit(bytes: &[u8], max_file_bytes: u64) -> Result<HashMap<String, String>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(zip_error)?;
    let mut contents = HashMap::new();

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(zip_error)?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().to_string();
        let path = match name.split_once('/') {
            Some((_root, rest)) => rest.to_string(),
            None => name,
        };

        let mut text = String::new();
        (&mut file)
            .take(max_file_bytes + 1)
            .read_to_string(&mut text)
            .map_err(|e| {
                ChartDataError::new(
                    ErrorCode::CommandInvalid,
                    format!("{} is not valid UTF-8: {}", path, e),
                )
            })?;
        if text.len() as u64 > max_file_bytes {
            return Err(ChartDataError::new(
                ErrorCode::CommandInvalid,
                format!("{} is larger than {} bytes", path, max_file_bytes),
            ));
        }
        contents.insert(path, text);
    }
    Ok(contents)
}

//! Batch ingestion of source images.
//!
//! Walks a source directory, filters by the configured include globs, and
//! partitions the discovered files into fixed-size batches in lexicographic
//! path order. Discovery is re-run from scratch for every task, so a new
//! task always sees the current state of the source directory.
//!
//! Decoding is deferred to batch processing time and decoded pixel buffers
//! are dropped after scoring, bounding memory to roughly one batch. Items
//! that fail to decode are skipped with a warning; they never abort a batch.

use globset::{Glob, GlobSet, GlobSetBuilder};
use ndarray::{Array1, Array2};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// A discovered source file, not yet decoded.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub path: PathBuf,
    /// Path relative to the source root; used as the item identifier in
    /// result CSVs and as the ordering key.
    pub relative: String,
}

/// An ordered slice of the discovered items, processed as one unit.
#[derive(Debug, Clone)]
pub struct Batch {
    /// 1-based batch sequence number.
    pub seq: usize,
    pub items: Vec<SourceImage>,
}

/// A decoded item ready for the model: grayscale pixels normalized to
/// `[0, 1]`, flattened row-major.
#[derive(Debug)]
pub struct DecodedItem {
    pub record: SourceImage,
    pub pixels: Array1<f32>,
}

/// Scan a source directory for images matching the include globs.
///
/// Fails fast when the root does not exist (a configuration error). Results
/// are sorted by relative path, which is the defined tie-break order for
/// batching.
pub fn scan_source(root: &Path, include_globs: &[String]) -> Result<Vec<SourceImage>> {
    if !root.is_dir() {
        return Err(Error::InvalidConfig(format!(
            "source directory does not exist: {}",
            root.display()
        )));
    }

    let include_set = build_globset(include_globs)?;
    let mut items = Vec::new();

    for entry in WalkDir::new(root) {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if !include_set.is_match(&rel_str) {
            continue;
        }

        items.push(SourceImage {
            path: path.to_path_buf(),
            relative: rel_str,
        });
    }

    items.sort_by(|a, b| a.relative.cmp(&b.relative));

    Ok(items)
}

/// Partition items into batches of `batch_size`, numbering them from
/// `first_seq`. The final batch may be shorter; nothing is padded or
/// dropped.
pub fn plan_batches(items: &[SourceImage], batch_size: usize, first_seq: usize) -> Vec<Batch> {
    items
        .chunks(batch_size)
        .enumerate()
        .map(|(i, chunk)| Batch {
            seq: first_seq + i,
            items: chunk.to_vec(),
        })
        .collect()
}

/// Decode one image to a normalized grayscale vector of `side * side`
/// values.
pub fn decode_image(path: &Path, side: u32) -> Result<Array1<f32>> {
    let img = image::open(path).map_err(|e| Error::ItemDecode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let gray = img
        .resize_exact(side, side, image::imageops::FilterType::Triangle)
        .into_luma8();

    Ok(Array1::from_iter(
        gray.as_raw().iter().map(|&p| p as f32 / 255.0),
    ))
}

/// Decode every item in a batch, skipping failures.
///
/// Returns the decoded items in batch order plus the number of skipped
/// items. Decode failures are logged at `warn` and are never fatal.
pub fn decode_batch(batch: &Batch, side: u32) -> (Vec<DecodedItem>, usize) {
    let mut decoded = Vec::with_capacity(batch.items.len());
    let mut skipped = 0usize;

    for item in &batch.items {
        match decode_image(&item.path, side) {
            Ok(pixels) => decoded.push(DecodedItem {
                record: item.clone(),
                pixels,
            }),
            Err(e) => {
                tracing::warn!(batch = batch.seq, item = %item.relative, error = %e, "skipping undecodable item");
                skipped += 1;
            }
        }
    }

    (decoded, skipped)
}

/// Stack decoded items into a training matrix, one row per item.
pub fn batch_matrix(items: &[DecodedItem]) -> Result<Array2<f32>> {
    let dim = items.first().map(|i| i.pixels.len()).unwrap_or(0);
    let mut flat = Vec::with_capacity(items.len() * dim);
    for item in items {
        flat.extend(item.pixels.iter().copied());
    }

    Array2::from_shape_vec((items.len(), dim), flat)
        .map_err(|e| Error::TaskFailed(format!("inconsistent item dimensions in batch: {}", e)))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| Error::InvalidConfig(format!("bad include glob: {}", e)))?,
        );
    }
    builder
        .build()
        .map_err(|e| Error::InvalidConfig(format!("bad include globs: {}", e)))
}

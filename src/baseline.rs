//! Baseline package: the persisted unit of a trained model plus reference
//! statistics.
//!
//! A baseline is a single zip archive with three entries:
//!
//! | Entry | Content |
//! |-------|---------|
//! | `manifest.json` | model type, creation time, input dimension |
//! | `reference_stats.json` | reconstruction-error distribution of the training set |
//! | `model_weights.json` | serialized trained model |
//!
//! Packages are immutable once saved and loaded read-only; detection and
//! drift tasks share one loaded package via `Arc`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Error, Result};
use crate::model::ReconstructionModel;
use crate::registry::ModelRegistry;
use crate::score::ErrorDistribution;

const MANIFEST_ENTRY: &str = "manifest.json";
const REFERENCE_ENTRY: &str = "reference_stats.json";
const WEIGHTS_ENTRY: &str = "model_weights.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineManifest {
    pub model_type: String,
    pub created_at: DateTime<Utc>,
    pub input_dim: usize,
    pub format_version: u32,
}

#[derive(Debug)]
pub struct BaselinePackage {
    pub manifest: BaselineManifest,
    pub reference: ErrorDistribution,
    pub weights: Vec<u8>,
}

impl BaselinePackage {
    pub fn new(
        model_type: String,
        input_dim: usize,
        reference: ErrorDistribution,
        weights: Vec<u8>,
    ) -> Self {
        Self {
            manifest: BaselineManifest {
                model_type,
                created_at: Utc::now(),
                input_dim,
                format_version: 1,
            },
            reference,
            weights,
        }
    }

    /// Write the package as a single zip archive.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = File::create(path)?;
        let mut zip = ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        zip.start_file(MANIFEST_ENTRY, options)?;
        zip.write_all(&serde_json::to_vec_pretty(&self.manifest)?)?;

        zip.start_file(REFERENCE_ENTRY, options)?;
        zip.write_all(&serde_json::to_vec(&self.reference)?)?;

        zip.start_file(WEIGHTS_ENTRY, options)?;
        zip.write_all(&self.weights)?;

        zip.finish()?;
        Ok(())
    }

    /// Load a package from a zip archive written by [`save`](Self::save).
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::InvalidConfig(format!(
                "baseline archive does not exist: {}",
                path.display()
            )));
        }

        let mut archive = ZipArchive::new(File::open(path)?)?;

        let manifest: BaselineManifest =
            serde_json::from_slice(&read_entry(&mut archive, MANIFEST_ENTRY)?)?;
        let reference: ErrorDistribution =
            serde_json::from_slice(&read_entry(&mut archive, REFERENCE_ENTRY)?)?;
        let weights = read_entry(&mut archive, WEIGHTS_ENTRY)?;

        Ok(Self {
            manifest,
            reference,
            weights,
        })
    }

    /// Rebuild the trained model through the plugin that produced it.
    pub fn restore_model(&self, registry: &ModelRegistry) -> Result<Box<dyn ReconstructionModel>> {
        registry
            .resolve(&self.manifest.model_type)?
            .restore(&self.weights)
    }
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> Result<Vec<u8>> {
    let mut entry = archive.by_name(name)?;
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_reference() -> ErrorDistribution {
        let mut dist = ErrorDistribution::new(100);
        for v in [0.01f32, 0.02, 0.015, 0.03, 0.025] {
            dist.record(v);
        }
        dist
    }

    #[test]
    fn archive_roundtrip_is_exact() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("baseline.zip");

        let package = BaselinePackage::new(
            "dense".to_string(),
            64,
            sample_reference(),
            b"{\"weights\":true}".to_vec(),
        );
        package.save(&path).unwrap();

        let loaded = BaselinePackage::load(&path).unwrap();
        assert_eq!(loaded.manifest.model_type, "dense");
        assert_eq!(loaded.manifest.input_dim, 64);
        assert_eq!(loaded.reference, package.reference);
        assert_eq!(loaded.weights, package.weights);
    }

    #[test]
    fn missing_archive_is_config_error() {
        let tmp = TempDir::new().unwrap();
        let err = BaselinePackage::load(&tmp.path().join("nope.zip")).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}

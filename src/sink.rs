//! Result sink: durable, incrementally flushed task output.
//!
//! Layout under `output_data`:
//!
//! ```text
//! output_data/
//! ├── anomalies/
//! │   ├── anomaly_output.csv      one row per scored item
//! │   └── images/                 copies of flagged source files
//! ├── clusters/
//! │   └── batch_<n>.csv           per-batch latent diagnostics
//! ├── absolute_drift_results.csv  drift vs. baseline, per batch
//! └── relative_drift_results.csv  drift vs. previous batch, per batch
//! ```
//!
//! Every writer flushes at batch boundaries so partial results survive a
//! `stop()` or a crash. The drift CSVs are opened in append mode because
//! one drift instance spans multiple `start()` calls.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::score::Verdict;

const ANOMALY_DIR: &str = "anomalies";
const IMAGES_DIR: &str = "images";
const CLUSTERS_DIR: &str = "clusters";
const ANOMALY_CSV: &str = "anomaly_output.csv";
const ABSOLUTE_DRIFT_CSV: &str = "absolute_drift_results.csv";
const RELATIVE_DRIFT_CSV: &str = "relative_drift_results.csv";

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "YES"
    } else {
        "NO"
    }
}

/// Read a label CSV (first column: filename, second column: label).
pub fn read_label_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let mut labels = HashMap::new();
    for record in reader.records() {
        let record = record?;
        if record.len() >= 2 {
            labels.insert(record[0].to_string(), record[1].to_string());
        }
    }

    Ok(labels)
}

/// Sink for anomaly detection output: the verdict CSV, copies of flagged
/// images, and per-batch cluster diagnostics.
pub struct AnomalySink {
    writer: csv::Writer<File>,
    output_data: PathBuf,
    labels: Option<HashMap<String, String>>,
}

impl AnomalySink {
    /// Create the output tree and the verdict CSV with its header. An
    /// existing verdict CSV from a previous run is truncated.
    pub fn create(output_data: &Path, labels: Option<HashMap<String, String>>) -> Result<Self> {
        let anomaly_dir = output_data.join(ANOMALY_DIR);
        std::fs::create_dir_all(anomaly_dir.join(IMAGES_DIR))?;
        std::fs::create_dir_all(output_data.join(CLUSTERS_DIR))?;

        let mut writer = csv::Writer::from_path(anomaly_dir.join(ANOMALY_CSV))?;
        if labels.is_some() {
            writer.write_record(["Image", "Anomaly", "Score", "Label"])?;
        } else {
            writer.write_record(["Image", "Anomaly", "Score"])?;
        }
        writer.flush()?;

        Ok(Self {
            writer,
            output_data: output_data.to_path_buf(),
            labels,
        })
    }

    /// Append one batch of verdicts and copy flagged images. Flushes before
    /// returning so the rows survive a later stop or failure.
    pub fn write_batch(&mut self, verdicts: &[Verdict]) -> Result<usize> {
        let mut flagged = 0usize;

        for verdict in verdicts {
            let score = format!("{:.6}", verdict.score);
            match &self.labels {
                Some(labels) => {
                    let label = labels
                        .get(&verdict.image)
                        .or_else(|| {
                            // Label files usually key on the bare filename.
                            Path::new(&verdict.image)
                                .file_name()
                                .and_then(|n| n.to_str())
                                .and_then(|n| labels.get(n))
                        })
                        .map(String::as_str)
                        .unwrap_or("");
                    self.writer.write_record([
                        verdict.image.as_str(),
                        yes_no(verdict.anomalous),
                        score.as_str(),
                        label,
                    ])?;
                }
                None => {
                    self.writer.write_record([
                        verdict.image.as_str(),
                        yes_no(verdict.anomalous),
                        score.as_str(),
                    ])?;
                }
            }

            if verdict.anomalous {
                copy_into_images(&self.output_data, &verdict.path, &verdict.image)?;
                flagged += 1;
            }
        }

        self.writer.flush()?;
        Ok(flagged)
    }

    /// Write the per-batch cluster diagnostic: score and latent norm per
    /// item, for offline inspection of batch structure.
    pub fn write_cluster(
        &self,
        seq: usize,
        verdicts: &[Verdict],
        latent_norms: &[f32],
    ) -> Result<()> {
        let path = self
            .output_data
            .join(CLUSTERS_DIR)
            .join(format!("batch_{:04}.csv", seq));

        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["Image", "Score", "LatentNorm"])?;
        for (verdict, norm) in verdicts.iter().zip(latent_norms) {
            writer.write_record([
                verdict.image.as_str(),
                format!("{:.6}", verdict.score).as_str(),
                format!("{:.6}", norm).as_str(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Copy a flagged source file into `anomalies/images/`, preserving its
/// relative subpath.
pub fn copy_into_images(output_data: &Path, source: &Path, relative: &str) -> Result<()> {
    let dest = output_data.join(ANOMALY_DIR).join(IMAGES_DIR).join(relative);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(source, dest)?;
    Ok(())
}

/// Sink for the two drift result logs, keyed by batch sequence number.
pub struct DriftSink {
    absolute: csv::Writer<File>,
    relative: csv::Writer<File>,
}

impl DriftSink {
    /// Open both drift CSVs in append mode, writing headers only when a
    /// file is new. Append mode lets one drift instance accumulate results
    /// across multiple `start()` calls.
    pub fn open(output_data: &Path) -> Result<Self> {
        std::fs::create_dir_all(output_data)?;
        let absolute = open_drift_log(&output_data.join(ABSOLUTE_DRIFT_CSV))?;
        let relative = open_drift_log(&output_data.join(RELATIVE_DRIFT_CSV))?;
        Ok(Self { absolute, relative })
    }

    pub fn append_absolute(&mut self, batch: usize, drift: f64, detected: bool) -> Result<()> {
        self.absolute.write_record([
            batch.to_string().as_str(),
            format!("{:.6}", drift).as_str(),
            yes_no(detected),
        ])?;
        self.absolute.flush()?;
        Ok(())
    }

    /// Relative drift is undefined for the first batch an instance
    /// processes; no row is written in that case.
    pub fn append_relative(
        &mut self,
        batch: usize,
        drift: Option<f64>,
        detected: bool,
    ) -> Result<()> {
        if let Some(drift) = drift {
            self.relative.write_record([
                batch.to_string().as_str(),
                format!("{:.6}", drift).as_str(),
                yes_no(detected),
            ])?;
            self.relative.flush()?;
        }
        Ok(())
    }
}

fn open_drift_log(path: &Path) -> Result<csv::Writer<File>> {
    let is_new = !path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new().from_writer(file);
    if is_new {
        writer.write_record(["Batch", "Drift", "DriftDetected"])?;
        writer.flush()?;
    }
    Ok(writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn verdict(image: &str, path: PathBuf, score: f32, anomalous: bool) -> Verdict {
        Verdict {
            image: image.to_string(),
            path,
            score,
            anomalous,
            batch: 1,
        }
    }

    #[test]
    fn verdicts_are_flushed_and_flagged_images_copied() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("src");
        let output = tmp.path().join("out");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("a.png"), b"fake").unwrap();
        std::fs::write(source.join("b.png"), b"fake").unwrap();

        let mut sink = AnomalySink::create(&output, None).unwrap();
        let flagged = sink
            .write_batch(&[
                verdict("a.png", source.join("a.png"), 0.9, true),
                verdict("b.png", source.join("b.png"), 0.1, false),
            ])
            .unwrap();

        assert_eq!(flagged, 1);
        assert!(output.join("anomalies/images/a.png").exists());
        assert!(!output.join("anomalies/images/b.png").exists());

        let content =
            std::fs::read_to_string(output.join("anomalies/anomaly_output.csv")).unwrap();
        assert!(content.starts_with("Image,Anomaly,Score"));
        assert!(content.contains("a.png,YES"));
        assert!(content.contains("b.png,NO"));
    }

    #[test]
    fn label_join_uses_bare_filename() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("src");
        let output = tmp.path().join("out");
        std::fs::create_dir_all(source.join("day1")).unwrap();
        std::fs::write(source.join("day1/x.png"), b"fake").unwrap();

        let mut labels = HashMap::new();
        labels.insert("x.png".to_string(), "covid".to_string());

        let mut sink = AnomalySink::create(&output, Some(labels)).unwrap();
        sink.write_batch(&[verdict(
            "day1/x.png",
            source.join("day1/x.png"),
            0.2,
            false,
        )])
        .unwrap();

        let content =
            std::fs::read_to_string(output.join("anomalies/anomaly_output.csv")).unwrap();
        assert!(content.starts_with("Image,Anomaly,Score,Label"));
        assert!(content.contains("day1/x.png,NO,0.200000,covid"));
    }

    #[test]
    fn drift_logs_append_across_opens() {
        let tmp = TempDir::new().unwrap();

        {
            let mut sink = DriftSink::open(tmp.path()).unwrap();
            sink.append_absolute(1, 0.10, false).unwrap();
            sink.append_relative(1, None, false).unwrap();
        }
        {
            let mut sink = DriftSink::open(tmp.path()).unwrap();
            sink.append_absolute(2, 0.42, true).unwrap();
            sink.append_relative(2, Some(0.33), true).unwrap();
        }

        let absolute =
            std::fs::read_to_string(tmp.path().join("absolute_drift_results.csv")).unwrap();
        let lines: Vec<&str> = absolute.lines().collect();
        assert_eq!(lines.len(), 3); // header + 2 batches
        assert_eq!(lines[0], "Batch,Drift,DriftDetected");
        assert!(lines[2].starts_with("2,0.420000,YES"));

        let relative =
            std::fs::read_to_string(tmp.path().join("relative_drift_results.csv")).unwrap();
        let rel_lines: Vec<&str> = relative.lines().collect();
        assert_eq!(rel_lines.len(), 2); // header + batch 2 only
        assert!(rel_lines[1].starts_with("2,0.330000,YES"));
    }

    #[test]
    fn reading_labels() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("labels.csv");
        std::fs::write(&path, "Image Index,Finding Labels\na.png,normal\nb.png,covid\n").unwrap();

        let labels = read_label_file(&path).unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["b.png"], "covid");
    }
}

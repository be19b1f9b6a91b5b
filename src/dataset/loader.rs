//! Thumbnail Dataset Loader
//!
//! Discovers the two class directories produced by the thumbnail collector and
//! validates that each one holds usable images before any model is built.

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::utils::error::{ClassifierError, Result};

/// File extensions accepted as thumbnails
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

/// Number of classes the detector distinguishes
pub const NUM_CLASSES: usize = 2;

/// A single image sample with its label
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSample {
    /// Path to the image file
    pub path: PathBuf,
    /// Class label index, in sorted class-name order
    pub label: usize,
}

/// Labeled thumbnail dataset discovered from disk
#[derive(Debug, Clone)]
pub struct ThumbnailDataset {
    /// Root directory of the dataset
    pub root_dir: PathBuf,
    /// Class names, index = label
    pub classes: Vec<String>,
    /// Usable samples, grouped by class and sorted by path within a class
    pub samples: Vec<ImageSample>,
    /// Files with an image extension whose header could not be decoded
    pub unreadable: Vec<PathBuf>,
}

impl ThumbnailDataset {
    /// Discover a dataset laid out as:
    /// ```text
    /// root_dir/
    /// ├── ai_generated/
    /// │   ├── 0001.png
    /// │   └── ...
    /// └── human_created/
    ///     └── ...
    /// ```
    ///
    /// Fails with [`ClassifierError::Dataset`] if the root is missing, if it does
    /// not contain exactly two class directories, or if a class has no usable image.
    pub fn discover<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        info!("Loading thumbnail dataset from: {:?}", root_dir);

        if !root_dir.is_dir() {
            return Err(ClassifierError::Dataset(format!(
                "dataset directory {:?} does not exist",
                root_dir
            )));
        }

        let classes = discover_class_dirs(&root_dir)?;
        if classes.len() != NUM_CLASSES {
            return Err(ClassifierError::Dataset(format!(
                "expected exactly {} class directories in {:?}, found {} ({})",
                NUM_CLASSES,
                root_dir,
                classes.len(),
                classes.join(", ")
            )));
        }

        let mut samples = Vec::new();
        let mut unreadable = Vec::new();

        for (label, class_name) in classes.iter().enumerate() {
            let class_dir = root_dir.join(class_name);
            let candidates = list_image_files(&class_dir);

            let checked: Vec<(PathBuf, bool)> = candidates
                .into_par_iter()
                .map(|path| {
                    let readable = image::image_dimensions(&path).is_ok();
                    (path, readable)
                })
                .collect();

            let mut usable = 0usize;
            for (path, readable) in checked {
                if readable {
                    samples.push(ImageSample { path, label });
                    usable += 1;
                } else {
                    warn!("Skipping unreadable image: {:?}", path);
                    unreadable.push(path);
                }
            }

            if usable == 0 {
                return Err(ClassifierError::Dataset(format!(
                    "class '{}' in {:?} contains no usable images (accepted: {})",
                    class_name,
                    class_dir,
                    IMAGE_EXTENSIONS.join(", ")
                )));
            }

            debug!("Class '{}' (label {}): {} usable images", class_name, label, usable);
        }

        info!(
            "Loaded {} samples across {} classes ({} unreadable skipped)",
            samples.len(),
            classes.len(),
            unreadable.len()
        );

        Ok(Self {
            root_dir,
            classes,
            samples,
            unreadable,
        })
    }

    /// Get the number of samples in the dataset
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if the dataset is empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Samples belonging to one class, in path order
    pub fn samples_of_class(&self, label: usize) -> Vec<&ImageSample> {
        self.samples.iter().filter(|s| s.label == label).collect()
    }

    /// Get statistics about the dataset
    pub fn stats(&self) -> DatasetStats {
        let mut class_counts = vec![0usize; self.num_classes()];
        for sample in &self.samples {
            class_counts[sample.label] += 1;
        }

        DatasetStats {
            total_samples: self.samples.len(),
            class_names: self.classes.clone(),
            class_counts,
            unreadable: self.unreadable.len(),
        }
    }
}

/// Statistics about the dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetStats {
    pub total_samples: usize,
    pub class_names: Vec<String>,
    pub class_counts: Vec<usize>,
    pub unreadable: usize,
}

impl DatasetStats {
    /// Print statistics to console
    pub fn print(&self) {
        println!("\n📊 Dataset Statistics:");
        println!("  Total samples: {}", self.total_samples);
        println!("  Unreadable files skipped: {}", self.unreadable);
        println!("\n  Samples per class:");

        for (idx, (name, count)) in self.class_names.iter().zip(&self.class_counts).enumerate() {
            let bar_len = if self.total_samples > 0 {
                (*count as f32 / self.total_samples as f32 * 40.0) as usize
            } else {
                0
            };
            println!("    {}. {:20} {:6} {}", idx, name, count, "█".repeat(bar_len));
        }
    }
}

fn discover_class_dirs(root_dir: &Path) -> Result<Vec<String>> {
    let mut class_dirs = Vec::new();
    for entry in std::fs::read_dir(root_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                class_dirs.push(name.to_string());
            }
        }
    }
    class_dirs.sort();
    Ok(class_dirs)
}

/// Image files directly inside `dir`, sorted by path
fn list_image_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| has_image_extension(p))
        .collect();
    files.sort();
    files
}

/// Whether the path carries one of the accepted image extensions
pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::write_dataset;
    use tempfile::TempDir;

    #[test]
    fn test_discover_counts_and_labels() {
        let dir = TempDir::new().unwrap();
        write_dataset(dir.path(), &[("human_created", 4), ("ai_generated", 3)], 8);

        let dataset = ThumbnailDataset::discover(dir.path()).unwrap();
        assert_eq!(dataset.classes, vec!["ai_generated", "human_created"]);
        assert_eq!(dataset.len(), 7);
        assert_eq!(dataset.samples_of_class(0).len(), 3);
        assert_eq!(dataset.samples_of_class(1).len(), 4);
    }

    #[test]
    fn test_missing_root_is_dataset_error() {
        let dir = TempDir::new().unwrap();
        let err = ThumbnailDataset::discover(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, ClassifierError::Dataset(_)));
    }

    #[test]
    fn test_wrong_class_count_is_dataset_error() {
        let dir = TempDir::new().unwrap();
        write_dataset(dir.path(), &[("a", 1), ("b", 1), ("c", 1)], 8);
        let err = ThumbnailDataset::discover(dir.path()).unwrap_err();
        assert!(format!("{}", err).contains("exactly 2"));
    }

    #[test]
    fn test_empty_class_is_dataset_error() {
        let dir = TempDir::new().unwrap();
        write_dataset(dir.path(), &[("ai_generated", 2), ("human_created", 0)], 8);
        std::fs::write(dir.path().join("human_created/notes.txt"), "x").unwrap();

        let err = ThumbnailDataset::discover(dir.path()).unwrap_err();
        assert!(format!("{}", err).contains("human_created"));
    }

    #[test]
    fn test_unreadable_files_are_counted_and_skipped() {
        let dir = TempDir::new().unwrap();
        write_dataset(dir.path(), &[("ai_generated", 2), ("human_created", 2)], 8);
        std::fs::write(dir.path().join("ai_generated/broken.png"), b"not a png").unwrap();

        let dataset = ThumbnailDataset::discover(dir.path()).unwrap();
        assert_eq!(dataset.len(), 4);
        assert_eq!(dataset.unreadable.len(), 1);
        assert_eq!(dataset.stats().unreadable, 1);
    }

    #[test]
    fn test_extension_filter() {
        assert!(has_image_extension(Path::new("a/b.JPG")));
        assert!(has_image_extension(Path::new("a/b.webp")));
        assert!(!has_image_extension(Path::new("a/b.gif")));
        assert!(!has_image_extension(Path::new("a/b")));
    }
}

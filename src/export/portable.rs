//! Portable model format
//!
//! `model.json` carries the graph topology and a manifest of every weight
//! tensor; `weights.bin` carries the tensors themselves as little-endian f32,
//! concatenated in manifest order. Both files are a pure function of the model
//! state, so exporting the same state twice produces identical bytes.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use crate::model::backbone::BN_EPSILON;
use crate::model::{ConvBnAct, NamedTensor, ThumbnailClassifier};
use crate::utils::error::{ClassifierError, Result};

pub const MODEL_FILE: &str = "model.json";
pub const WEIGHTS_FILE: &str = "weights.bin";
pub const FORMAT_NAME: &str = "thumbnail-detector-portable";
pub const FORMAT_VERSION: u32 = 1;
const F32_BYTES: usize = 4;

/// Convolution + batch norm (+ activation) unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvBnSpec {
    pub name: String,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub groups: usize,
    pub activation: String,
    pub bn_epsilon: f64,
}

impl ConvBnSpec {
    fn from_layer<B: Backend>(name: String, layer: &ConvBnAct<B>) -> Self {
        Self {
            name,
            in_channels: layer.in_channels,
            out_channels: layer.out_channels,
            kernel_size: layer.kernel_size,
            stride: layer.stride,
            padding: layer.kernel_size / 2,
            groups: layer.groups,
            activation: layer.activation_name().to_string(),
            bn_epsilon: BN_EPSILON,
        }
    }
}

/// One node of the exported graph, in execution order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerSpec {
    ConvBn(ConvBnSpec),
    InvertedResidual {
        name: String,
        units: Vec<ConvBnSpec>,
        residual: bool,
    },
    GlobalAveragePool {
        name: String,
    },
    Dense {
        name: String,
        in_features: usize,
        out_features: usize,
        activation: String,
    },
    Dropout {
        name: String,
        rate: f64,
    },
}

/// Location of one tensor inside `weights.bin`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightEntry {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: String,
    /// Byte offset from the start of the weights file
    pub offset: usize,
    /// Length in bytes
    pub length: usize,
}

/// Contents of `model.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableModel {
    pub format: String,
    pub format_version: u32,
    /// Height, width, channels
    pub input_shape: [usize; 3],
    pub num_classes: usize,
    pub layers: Vec<LayerSpec>,
    pub weights_file: String,
    pub weights: Vec<WeightEntry>,
}

impl PortableModel {
    /// Describe `model` for inputs of `image_size`², with a manifest for `tensors`
    pub fn describe<B: Backend>(
        model: &ThumbnailClassifier<B>,
        image_size: usize,
        tensors: &[NamedTensor],
    ) -> Self {
        Self {
            format: FORMAT_NAME.to_string(),
            format_version: FORMAT_VERSION,
            input_shape: [image_size, image_size, 3],
            num_classes: model.num_classes(),
            layers: topology(model),
            weights_file: WEIGHTS_FILE.to_string(),
            weights: manifest(tensors),
        }
    }

    /// Total bytes the manifest expects in the weights file
    pub fn weights_len(&self) -> usize {
        self.weights.iter().map(|w| w.length).sum()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ClassifierError::Inference(format!("cannot read {:?}: {}", path, e))
        })?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Ordered layer list matching the flat backbone indices used for freezing
pub fn topology<B: Backend>(model: &ThumbnailClassifier<B>) -> Vec<LayerSpec> {
    let backbone = &model.backbone;
    let mut layers = vec![LayerSpec::ConvBn(ConvBnSpec::from_layer(
        "backbone.0".to_string(),
        &backbone.stem,
    ))];

    let mut index = 1;
    for (b, block) in backbone.blocks.iter().enumerate() {
        let mut units = Vec::with_capacity(block.num_layers());
        if let Some(expand) = &block.expand {
            units.push(ConvBnSpec::from_layer(format!("backbone.{index}"), expand));
            index += 1;
        }
        units.push(ConvBnSpec::from_layer(format!("backbone.{index}"), &block.depthwise));
        index += 1;
        units.push(ConvBnSpec::from_layer(format!("backbone.{index}"), &block.project));
        index += 1;

        layers.push(LayerSpec::InvertedResidual {
            name: format!("block{b}"),
            units,
            residual: block.has_residual(),
        });
    }
    layers.push(LayerSpec::ConvBn(ConvBnSpec::from_layer(
        format!("backbone.{index}"),
        &backbone.last,
    )));

    layers.push(LayerSpec::GlobalAveragePool {
        name: "head.pool".to_string(),
    });

    let mut in_features = backbone.out_channels();
    for (j, block) in model.head.blocks.iter().enumerate() {
        layers.push(LayerSpec::Dense {
            name: format!("head.dense{j}"),
            in_features,
            out_features: block.units,
            activation: "relu".to_string(),
        });
        layers.push(LayerSpec::Dropout {
            name: format!("head.dropout{j}"),
            rate: block.dropout.prob,
        });
        in_features = block.units;
    }
    layers.push(LayerSpec::Dense {
        name: "head.output".to_string(),
        in_features,
        out_features: model.num_classes(),
        activation: "softmax".to_string(),
    });

    layers
}

/// Byte layout of `tensors` packed back to back
pub fn manifest(tensors: &[NamedTensor]) -> Vec<WeightEntry> {
    let mut offset = 0;
    tensors
        .iter()
        .map(|t| {
            let length = t.values.len() * F32_BYTES;
            let entry = WeightEntry {
                name: t.name.clone(),
                shape: t.shape.clone(),
                dtype: "float32".to_string(),
                offset,
                length,
            };
            offset += length;
            entry
        })
        .collect()
}

/// Write every tensor as little-endian f32, in order
pub fn write_weights(path: &Path, tensors: &[NamedTensor]) -> Result<u64> {
    let file = File::create(path)
        .map_err(|e| ClassifierError::Export(format!("cannot create {:?}: {}", path, e)))?;
    let mut writer = BufWriter::new(file);
    let mut written = 0u64;

    for tensor in tensors {
        for value in &tensor.values {
            writer
                .write_all(&value.to_le_bytes())
                .map_err(|e| ClassifierError::Export(format!("cannot write {:?}: {}", path, e)))?;
        }
        written += (tensor.values.len() * F32_BYTES) as u64;
    }

    writer
        .flush()
        .map_err(|e| ClassifierError::Export(format!("cannot write {:?}: {}", path, e)))?;
    Ok(written)
}

/// Read `weights.bin` back into named tensors using the manifest
pub fn read_weights(path: &Path, manifest: &[WeightEntry]) -> Result<Vec<NamedTensor>> {
    let mut bytes = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(|e| ClassifierError::Inference(format!("cannot read {:?}: {}", path, e)))?;

    manifest
        .iter()
        .map(|entry| {
            let end = entry.offset + entry.length;
            let expected: usize = entry.shape.iter().product::<usize>() * F32_BYTES;
            if entry.dtype != "float32" || entry.length != expected || end > bytes.len() {
                return Err(ClassifierError::Inference(format!(
                    "manifest entry {} does not match {:?} ({} bytes)",
                    entry.name,
                    path,
                    bytes.len()
                )));
            }

            let values = bytes[entry.offset..end]
                .chunks_exact(F32_BYTES)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Ok(NamedTensor {
                name: entry.name.clone(),
                shape: entry.shape.clone(),
                values,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingConfig;
    use crate::model::{collect_named_tensors, ModelBlueprint};
    use burn::backend::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn tiny_model() -> ThumbnailClassifier<TestBackend> {
        let mut config = TrainingConfig::default();
        config.backbone.width_multiplier = 0.25;
        config.backbone.last_channels = 32;
        config.head.hidden_units = vec![16, 8];
        ModelBlueprint::from_config(&config, 2).init(&Default::default())
    }

    #[test]
    fn test_topology_layout() {
        let model = tiny_model();
        let layers = topology(&model);

        // stem + 17 blocks + last conv + pool + 2 x (dense, dropout) + output
        assert_eq!(layers.len(), 1 + 17 + 1 + 1 + 4 + 1);
        match layers.last().unwrap() {
            LayerSpec::Dense {
                out_features,
                activation,
                ..
            } => {
                assert_eq!(*out_features, 2);
                assert_eq!(activation, "softmax");
            }
            other => panic!("unexpected last layer {:?}", other),
        }
        match &layers[18] {
            LayerSpec::ConvBn(spec) => assert_eq!(spec.name, "backbone.51"),
            other => panic!("unexpected layer {:?}", other),
        }
    }

    #[test]
    fn test_manifest_offsets_are_contiguous() {
        let tensors = vec![
            NamedTensor {
                name: "a".into(),
                shape: vec![2, 3],
                values: vec![0.0; 6],
            },
            NamedTensor {
                name: "b".into(),
                shape: vec![4],
                values: vec![1.0; 4],
            },
        ];
        let entries = manifest(&tensors);
        assert_eq!(entries[0].offset, 0);
        assert_eq!(entries[0].length, 24);
        assert_eq!(entries[1].offset, 24);
        assert_eq!(entries[1].length, 16);
    }

    #[test]
    fn test_weights_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(WEIGHTS_FILE);
        let model = tiny_model();
        let tensors = collect_named_tensors(&model).unwrap();
        let portable = PortableModel::describe(&model, 32, &tensors);

        let written = write_weights(&path, &tensors).unwrap();
        assert_eq!(written as usize, portable.weights_len());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), written);

        let read = read_weights(&path, &portable.weights).unwrap();
        assert_eq!(read, tensors);
    }

    #[test]
    fn test_truncated_weights_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(WEIGHTS_FILE);
        std::fs::write(&path, [0u8; 8]).unwrap();
        let entries = vec![WeightEntry {
            name: "x".into(),
            shape: vec![4],
            dtype: "float32".into(),
            offset: 0,
            length: 16,
        }];
        assert!(matches!(
            read_weights(&path, &entries),
            Err(ClassifierError::Inference(_))
        ));
    }
}

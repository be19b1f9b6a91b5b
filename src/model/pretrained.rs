//! Pretrained backbone import
//!
//! Converts ImageNet MobileNetV2 weights published as timm safetensors
//! (`conv_stem`, `blocks.{stage}.{index}.*`, `conv_head`) into the backbone
//! record read by [`super::assembler::load_backbone`]. The file is either a
//! local path or downloaded from the Hugging Face Hub.

use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use safetensors::{tensor::TensorView, Dtype, SafeTensors};
use tracing::info;

use super::assembler::{save_backbone, ModelBlueprint};
use super::backbone::{Backbone, INVERTED_RESIDUAL_SETTINGS};
use super::weights::{apply_backbone_tensors, NamedTensor};
use crate::config::TrainingConfig;
use crate::utils::error::{ClassifierError, Result};

/// Hub repository with ImageNet-trained MobileNetV2 (width 1.0) weights
pub const DEFAULT_HUB_REPO: &str = "timm/mobilenetv2_100.ra_in1k";
pub const DEFAULT_HUB_FILE: &str = "model.safetensors";

/// Where pretrained weights come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PretrainedSource {
    File(PathBuf),
    Hub { repo: String, file: String },
}

impl PretrainedSource {
    /// Local path of the safetensors file, downloading it into the hub cache if needed
    pub fn resolve(&self) -> Result<PathBuf> {
        match self {
            PretrainedSource::File(path) => {
                if path.is_file() {
                    Ok(path.clone())
                } else {
                    Err(ClassifierError::WeightsUnavailable {
                        path: path.clone(),
                        reason: "file not found".to_string(),
                    })
                }
            }
            PretrainedSource::Hub { repo, file } => {
                info!("Fetching {} from Hugging Face repo {}", file, repo);
                let unavailable = |reason: String| ClassifierError::WeightsUnavailable {
                    path: PathBuf::from(format!("hf://{}/{}", repo, file)),
                    reason,
                };
                let api = hf_hub::api::sync::Api::new().map_err(|e| unavailable(e.to_string()))?;
                api.model(repo.clone())
                    .get(file)
                    .map_err(|e| unavailable(e.to_string()))
            }
        }
    }
}

/// timm conv weight key and batch-norm prefix for each backbone layer, in flat order
pub fn timm_layer_keys() -> Vec<(String, String)> {
    let mut keys = vec![("conv_stem.weight".to_string(), "bn1".to_string())];

    for (stage, (expansion, _, repeats, _)) in INVERTED_RESIDUAL_SETTINGS.iter().enumerate() {
        for j in 0..*repeats {
            let block = format!("blocks.{stage}.{j}");
            let units: &[(&str, &str)] = if *expansion == 1 {
                &[("conv_dw", "bn1"), ("conv_pw", "bn2")]
            } else {
                &[("conv_pw", "bn1"), ("conv_dw", "bn2"), ("conv_pwl", "bn3")]
            };
            for (conv, bn) in units {
                keys.push((format!("{block}.{conv}.weight"), format!("{block}.{bn}")));
            }
        }
    }

    keys.push(("conv_head.weight".to_string(), "bn2".to_string()));
    keys
}

fn view_to_f32(name: &str, view: &TensorView<'_>) -> Result<Vec<f32>> {
    let bytes = view.data();
    match view.dtype() {
        Dtype::F32 => Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()),
        Dtype::BF16 => Ok(bytes
            .chunks_exact(2)
            .map(|b| f32::from_bits(u32::from(u16::from_le_bytes([b[0], b[1]])) << 16))
            .collect()),
        other => Err(ClassifierError::WeightsUnavailable {
            path: PathBuf::from(name),
            reason: format!("unsupported dtype {:?}", other),
        }),
    }
}

/// Read a timm MobileNetV2 safetensors file as backbone tensors named `backbone.{i}.*`
pub fn read_timm_backbone(path: &Path) -> Result<Vec<NamedTensor>> {
    let unavailable = |reason: String| ClassifierError::WeightsUnavailable {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = std::fs::read(path).map_err(|e| unavailable(e.to_string()))?;
    let file = SafeTensors::deserialize(&bytes).map_err(|e| unavailable(format!("{:?}", e)))?;

    let mut tensors = Vec::new();
    for (i, (conv, bn)) in timm_layer_keys().into_iter().enumerate() {
        let pairs = [
            (conv, "conv.weight"),
            (format!("{bn}.weight"), "bn.gamma"),
            (format!("{bn}.bias"), "bn.beta"),
            (format!("{bn}.running_mean"), "bn.running_mean"),
            (format!("{bn}.running_var"), "bn.running_var"),
        ];
        for (source, target) in pairs {
            let view = file
                .tensor(&source)
                .map_err(|_| unavailable(format!("missing tensor {}", source)))?;
            tensors.push(NamedTensor {
                name: format!("backbone.{i}.{target}"),
                shape: view.shape().to_vec(),
                values: view_to_f32(&source, &view)?,
            });
        }
    }
    Ok(tensors)
}

/// Convert `source` into the backbone record configured by `config.backbone_weights`
pub fn import_pretrained<B: Backend>(
    source: &PretrainedSource,
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<PathBuf> {
    let path = source.resolve()?;
    let tensors = read_timm_backbone(&path)?;

    let blueprint = ModelBlueprint::from_config(config, 2);
    let backbone = Backbone::<B>::new(&blueprint.backbone_config(), device);
    let backbone = apply_backbone_tensors(backbone, &tensors, device).map_err(|e| {
        ClassifierError::WeightsUnavailable {
            path: path.clone(),
            reason: format!("weights do not fit the configured backbone: {}", e),
        }
    })?;

    save_backbone(&backbone, &config.backbone_weights)?;
    info!(
        "Imported {} backbone layers from {:?} into {:?}",
        backbone.num_layers(),
        path,
        config.backbone_weights
    );
    Ok(config.backbone_weights.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use crate::model::assembler::{assemble, load_backbone};
    use crate::model::collect_named_tensors;
    use burn::backend::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    /// Write `tensors` (named `backbone.{i}.*`) as a timm-layout safetensors file
    fn write_timm_file(path: &Path, tensors: &[NamedTensor]) {
        let by_name: HashMap<&str, &NamedTensor> = tensors.iter().map(|t| (t.name.as_str(), t)).collect();
        let mut buffers: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();

        for (i, (conv, bn)) in timm_layer_keys().into_iter().enumerate() {
            let pairs = [
                (conv, "conv.weight"),
                (format!("{bn}.weight"), "bn.gamma"),
                (format!("{bn}.bias"), "bn.beta"),
                (format!("{bn}.running_mean"), "bn.running_mean"),
                (format!("{bn}.running_var"), "bn.running_var"),
            ];
            for (key, ours) in pairs {
                let t = by_name[format!("backbone.{i}.{ours}").as_str()];
                let bytes = t.values.iter().flat_map(|v| v.to_le_bytes()).collect();
                buffers.push((key, t.shape.clone(), bytes));
            }
        }

        let views: Vec<(String, TensorView<'_>)> = buffers
            .iter()
            .map(|(k, shape, bytes)| {
                (k.clone(), TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap())
            })
            .collect();
        let data = safetensors::serialize(views.iter().map(|(k, v)| (k.as_str(), v)), &None).unwrap();
        std::fs::write(path, data).unwrap();
    }

    fn tiny_config(root: &Path) -> TrainingConfig {
        let mut config = TrainingConfig::default();
        config.backbone_weights = root.join("weights").join("backbone.mpk");
        config.backbone.width_multiplier = 0.25;
        config.backbone.last_channels = 32;
        config.head.hidden_units = vec![8];
        config.head.dropout = vec![0.2];
        config
    }

    fn backbone_tensors(config: &TrainingConfig) -> Vec<NamedTensor> {
        let model = ModelBlueprint::from_config(config, 2).init::<TestBackend>(&Default::default());
        collect_named_tensors(&model)
            .unwrap()
            .into_iter()
            .filter(|t| t.name.starts_with("backbone."))
            .collect()
    }

    #[test]
    fn test_timm_keys_cover_every_layer() {
        let keys = timm_layer_keys();
        assert_eq!(keys.len(), 52);
        assert_eq!(keys[1], ("blocks.0.0.conv_dw.weight".to_string(), "blocks.0.0.bn1".to_string()));
        assert_eq!(keys[2], ("blocks.0.0.conv_pw.weight".to_string(), "blocks.0.0.bn2".to_string()));
        assert_eq!(keys[3], ("blocks.1.0.conv_pw.weight".to_string(), "blocks.1.0.bn1".to_string()));
        assert_eq!(keys[5].0, "blocks.1.0.conv_pwl.weight");
        assert_eq!(keys[51], ("conv_head.weight".to_string(), "bn2".to_string()));
    }

    #[test]
    fn test_import_writes_loadable_backbone_record() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config(dir.path());
        let expected = backbone_tensors(&config);
        let file = dir.path().join("model.safetensors");
        write_timm_file(&file, &expected);

        let device = Default::default();
        let written =
            import_pretrained::<TestBackend>(&PretrainedSource::File(file), &config, &device).unwrap();
        assert!(crate::model::record_file(&written).is_file());

        let blueprint = ModelBlueprint::from_config(&config, 2);
        let backbone = load_backbone::<TestBackend>(&blueprint, &config.backbone_weights, &device).unwrap();
        let model = blueprint.with_backbone(backbone, &device);
        let loaded: Vec<NamedTensor> = collect_named_tensors(&model)
            .unwrap()
            .into_iter()
            .filter(|t| t.name.starts_with("backbone."))
            .collect();
        assert_eq!(loaded, expected);

        // The run can now assemble on top of the imported record.
        assert!(assemble::<TestBackend>(&config, 2, &device).is_ok());
    }

    #[test]
    fn test_import_rejects_mismatched_width() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config(dir.path());
        let file = dir.path().join("model.safetensors");
        write_timm_file(&file, &backbone_tensors(&config));

        let mut wider = config.clone();
        wider.backbone.width_multiplier = 0.5;
        let err = import_pretrained::<TestBackend>(&PretrainedSource::File(file), &wider, &Default::default())
            .unwrap_err();
        assert!(matches!(err, ClassifierError::WeightsUnavailable { .. }));
        assert!(!crate::model::record_file(&wider.backbone_weights).exists());
    }

    #[test]
    fn test_missing_file_is_weights_unavailable() {
        let dir = TempDir::new().unwrap();
        let source = PretrainedSource::File(dir.path().join("absent.safetensors"));
        assert!(matches!(
            source.resolve(),
            Err(ClassifierError::WeightsUnavailable { .. })
        ));
    }
}

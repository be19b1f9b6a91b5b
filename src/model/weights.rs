//! Named weight access
//!
//! Flattens the classifier into an ordered list of named f32 tensors (the order
//! used by the export manifest) and writes such a list back into a model.
//! Backbone tensors are addressed by flat layer index, which is also the index
//! used for freezing.

use std::collections::HashMap;

use burn::{
    module::{Param, RunningState},
    tensor::{backend::Backend, Tensor, TensorData},
};

use super::backbone::{Backbone, ConvBnAct};
use super::classifier::ThumbnailClassifier;
use crate::utils::error::{ClassifierError, Result};

/// A weight tensor with its manifest name
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

fn tensor_to_named<B: Backend, const D: usize>(name: String, tensor: Tensor<B, D>) -> Result<NamedTensor> {
    let shape = tensor.dims().to_vec();
    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| ClassifierError::Export(format!("cannot read tensor {}: {:?}", name, e)))?;
    Ok(NamedTensor {
        name,
        shape,
        values,
    })
}

fn layer_tensors<B: Backend>(prefix: &str, layer: &ConvBnAct<B>) -> Result<Vec<NamedTensor>> {
    Ok(vec![
        tensor_to_named(format!("{prefix}.conv.weight"), layer.conv.weight.val())?,
        tensor_to_named(format!("{prefix}.bn.gamma"), layer.bn.gamma.val())?,
        tensor_to_named(format!("{prefix}.bn.beta"), layer.bn.beta.val())?,
        tensor_to_named(format!("{prefix}.bn.running_mean"), layer.bn.running_mean.value())?,
        tensor_to_named(format!("{prefix}.bn.running_var"), layer.bn.running_var.value())?,
    ])
}

/// All weights of the classifier in deterministic manifest order
pub fn collect_named_tensors<B: Backend>(model: &ThumbnailClassifier<B>) -> Result<Vec<NamedTensor>> {
    let mut tensors = Vec::new();

    for (i, layer) in model.backbone.layers().into_iter().enumerate() {
        tensors.extend(layer_tensors(&format!("backbone.{i}"), layer)?);
    }

    for (j, block) in model.head.blocks.iter().enumerate() {
        tensors.push(tensor_to_named(format!("head.dense{j}.weight"), block.linear.weight.val())?);
        if let Some(bias) = &block.linear.bias {
            tensors.push(tensor_to_named(format!("head.dense{j}.bias"), bias.val())?);
        }
    }

    tensors.push(tensor_to_named("head.output.weight".to_string(), model.head.output.weight.val())?);
    if let Some(bias) = &model.head.output.bias {
        tensors.push(tensor_to_named("head.output.bias".to_string(), bias.val())?);
    }

    Ok(tensors)
}

struct TensorSource<'a, B: Backend> {
    by_name: HashMap<&'a str, &'a NamedTensor>,
    device: &'a B::Device,
}

impl<B: Backend> TensorSource<'_, B> {
    fn take<const D: usize>(&self, name: &str, expected: [usize; D]) -> Result<Tensor<B, D>> {
        let named = self.by_name.get(name).ok_or_else(|| {
            ClassifierError::Inference(format!("weights file has no tensor named {}", name))
        })?;

        if named.shape != expected.to_vec() {
            return Err(ClassifierError::Inference(format!(
                "tensor {} has shape {:?}, model expects {:?}",
                name, named.shape, expected
            )));
        }

        Ok(Tensor::from_data(
            TensorData::new(named.values.clone(), expected),
            self.device,
        ))
    }

    fn param<const D: usize>(&self, name: &str, current: &Param<Tensor<B, D>>) -> Result<Param<Tensor<B, D>>> {
        let tensor = self.take(name, current.val().dims())?;
        Ok(Param::from_tensor(tensor))
    }

    fn state<const D: usize>(
        &self,
        name: &str,
        current: &RunningState<Tensor<B, D>>,
    ) -> Result<RunningState<Tensor<B, D>>> {
        let tensor = self.take(name, current.value().dims())?;
        Ok(RunningState::new(tensor))
    }
}

fn apply_layers<B: Backend>(backbone: &mut Backbone<B>, source: &TensorSource<'_, B>) -> Result<()> {
    for (i, layer) in backbone.layers_mut().into_iter().enumerate() {
        let prefix = format!("backbone.{i}");
        layer.conv.weight = source.param(&format!("{prefix}.conv.weight"), &layer.conv.weight)?;
        layer.bn.gamma = source.param(&format!("{prefix}.bn.gamma"), &layer.bn.gamma)?;
        layer.bn.beta = source.param(&format!("{prefix}.bn.beta"), &layer.bn.beta)?;
        layer.bn.running_mean =
            source.state(&format!("{prefix}.bn.running_mean"), &layer.bn.running_mean)?;
        layer.bn.running_var =
            source.state(&format!("{prefix}.bn.running_var"), &layer.bn.running_var)?;
    }
    Ok(())
}

/// Replace every backbone weight with the `backbone.{i}.*` tensor of the same name
pub fn apply_backbone_tensors<B: Backend>(
    mut backbone: Backbone<B>,
    tensors: &[NamedTensor],
    device: &B::Device,
) -> Result<Backbone<B>> {
    let source = TensorSource::<B> {
        by_name: tensors.iter().map(|t| (t.name.as_str(), t)).collect(),
        device,
    };
    apply_layers(&mut backbone, &source)?;
    Ok(backbone)
}

/// Replace every weight of `model` with the tensor of the same name
pub fn apply_named_tensors<B: Backend>(
    mut model: ThumbnailClassifier<B>,
    tensors: &[NamedTensor],
    device: &B::Device,
) -> Result<ThumbnailClassifier<B>> {
    let source = TensorSource::<B> {
        by_name: tensors.iter().map(|t| (t.name.as_str(), t)).collect(),
        device,
    };
    apply_layers(&mut model.backbone, &source)?;

    for (j, block) in model.head.blocks.iter_mut().enumerate() {
        block.linear.weight = source.param(&format!("head.dense{j}.weight"), &block.linear.weight)?;
        if let Some(bias) = block.linear.bias.take() {
            block.linear.bias = Some(source.param(&format!("head.dense{j}.bias"), &bias)?);
        }
    }

    model.head.output.weight = source.param("head.output.weight", &model.head.output.weight)?;
    if let Some(bias) = model.head.output.bias.take() {
        model.head.output.bias = Some(source.param("head.output.bias", &bias)?);
    }

    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingConfig;
    use crate::model::assembler::ModelBlueprint;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn blueprint() -> ModelBlueprint {
        let mut config = TrainingConfig::default();
        config.backbone.width_multiplier = 0.25;
        config.backbone.last_channels = 32;
        config.head.hidden_units = vec![16];
        config.head.dropout = vec![0.5];
        ModelBlueprint::from_config(&config, 2)
    }

    #[test]
    fn test_collect_order_and_names() {
        let device = Default::default();
        let model = blueprint().init::<TestBackend>(&device);
        let tensors = collect_named_tensors(&model).unwrap();

        assert_eq!(tensors[0].name, "backbone.0.conv.weight");
        assert_eq!(tensors[4].name, "backbone.0.bn.running_var");
        assert_eq!(tensors.last().unwrap().name, "head.output.bias");
        assert_eq!(tensors.len(), 52 * 5 + 4);
    }

    #[test]
    fn test_apply_restores_outputs() {
        let device = Default::default();
        let source = blueprint().init::<TestBackend>(&device);
        let tensors = collect_named_tensors(&source).unwrap();

        let fresh = blueprint().init::<TestBackend>(&device);
        let restored = apply_named_tensors(fresh, &tensors, &device).unwrap();

        let images = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let a = source.forward_softmax(images.clone());
        let b = restored.forward_softmax(images);
        let diff = (a - b).abs().max().into_scalar();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_apply_rejects_wrong_shape() {
        let device = Default::default();
        let model = blueprint().init::<TestBackend>(&device);
        let mut tensors = collect_named_tensors(&model).unwrap();
        tensors[0].shape = vec![1, 2, 3, 4];

        let err = apply_named_tensors(model, &tensors, &device).unwrap_err();
        assert!(format!("{}", err).contains("backbone.0.conv.weight"));
    }
}

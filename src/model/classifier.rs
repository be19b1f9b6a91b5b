//! Transfer-Learning Classifier
//!
//! Backbone → global average pooling → dense blocks (ReLU + dropout) → output
//! logits. The classifier tracks which backbone layers are trainable through a
//! single index: every layer before `trainable_from` is frozen.

use burn::{
    module::Module,
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

use super::backbone::Backbone;
use crate::config::HeadSettings;

/// Dense layer with ReLU and dropout
#[derive(Module, Debug)]
pub struct DenseBlock<B: Backend> {
    pub linear: Linear<B>,
    pub activation: Relu,
    pub dropout: Dropout,
    pub units: usize,
}

impl<B: Backend> DenseBlock<B> {
    pub fn new(inputs: usize, units: usize, dropout: f64, device: &B::Device) -> Self {
        Self {
            linear: LinearConfig::new(inputs, units).init(device),
            activation: Relu::new(),
            dropout: DropoutConfig::new(dropout).init(),
            units,
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.linear.forward(x);
        let x = self.activation.forward(x);
        self.dropout.forward(x)
    }
}

/// Trainable classification head
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    pub pool: AdaptiveAvgPool2d,
    pub blocks: Vec<DenseBlock<B>>,
    pub output: Linear<B>,
    num_classes: usize,
}

impl<B: Backend> ClassifierHead<B> {
    pub fn new(
        in_features: usize,
        num_classes: usize,
        settings: &HeadSettings,
        device: &B::Device,
    ) -> Self {
        let mut inputs = in_features;
        let mut blocks = Vec::with_capacity(settings.hidden_units.len());
        for (&units, &dropout) in settings.hidden_units.iter().zip(&settings.dropout) {
            blocks.push(DenseBlock::new(inputs, units, dropout, device));
            inputs = units;
        }

        Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            blocks,
            output: LinearConfig::new(inputs, num_classes).init(device),
            num_classes,
        }
    }

    /// Feature map [B, C, H, W] → logits [B, num_classes]
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pool.forward(features);
        let [batch_size, channels, _, _] = x.dims();
        let mut x = x.reshape([batch_size, channels]);

        for block in &self.blocks {
            x = block.forward(x);
        }

        self.output.forward(x)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

/// Parameter partition of the classifier at a given moment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainableSummary {
    pub backbone_layers: usize,
    pub trainable_backbone_layers: usize,
    pub trainable_params: usize,
    pub frozen_params: usize,
}

/// Backbone plus head, with layer-level freezing
#[derive(Module, Debug)]
pub struct ThumbnailClassifier<B: Backend> {
    pub backbone: Backbone<B>,
    pub head: ClassifierHead<B>,
    trainable_from: usize,
}

impl<B: Backend> ThumbnailClassifier<B> {
    /// Compose a classifier; the whole backbone starts frozen
    pub fn new(backbone: Backbone<B>, head: ClassifierHead<B>) -> Self {
        let trainable_from = backbone.num_layers();
        Self {
            backbone,
            head,
            trainable_from,
        }
    }

    /// Forward pass returning logits [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images, self.trainable_from);
        self.head.forward(features)
    }

    /// Forward pass with softmax for inference
    pub fn forward_softmax(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        burn::tensor::activation::softmax(self.forward(images), 1)
    }

    pub fn num_classes(&self) -> usize {
        self.head.num_classes()
    }

    /// Freeze every backbone layer
    pub fn freeze_backbone(&mut self) {
        self.trainable_from = self.backbone.num_layers();
    }

    /// Make every backbone layer trainable
    pub fn unfreeze_backbone(&mut self) {
        self.trainable_from = 0;
    }

    /// Unfreeze the backbone, then re-freeze all but its last `count` layers
    pub fn freeze_all_but_last(&mut self, count: usize) {
        self.unfreeze_backbone();
        let layers = self.backbone.num_layers();
        self.trainable_from = layers - count.min(layers);
    }

    /// Index of the first trainable backbone layer
    pub fn trainable_from(&self) -> usize {
        self.trainable_from
    }

    pub fn is_backbone_layer_trainable(&self, index: usize) -> bool {
        index >= self.trainable_from && index < self.backbone.num_layers()
    }

    pub fn trainable_summary(&self) -> TrainableSummary {
        let layers = self.backbone.layers();
        let (trainable, frozen): (Vec<_>, Vec<_>) = layers
            .iter()
            .enumerate()
            .partition(|(i, _)| *i >= self.trainable_from);

        let trainable_params = self.head.num_params()
            + trainable.iter().map(|(_, l)| l.num_params()).sum::<usize>();
        let frozen_params = frozen.iter().map(|(_, l)| l.num_params()).sum::<usize>();

        TrainableSummary {
            backbone_layers: layers.len(),
            trainable_backbone_layers: trainable.len(),
            trainable_params,
            frozen_params,
        }
    }
}

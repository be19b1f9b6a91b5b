//! Pretrained Feature Extractor
//!
//! A MobileNetV2-style backbone built from conv + batch-norm (+ ReLU6) units
//! arranged as inverted-residual blocks. For freezing purposes the backbone is
//! an ordered list of those units ("layers"): the stem, the units of every
//! block in order, then the final 1x1 convolution.
//!
//! Frozen layers run batch normalization from their running statistics, so a
//! frozen backbone behaves the same in training and in evaluation.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

/// Epsilon used by every batch-norm layer of the backbone
pub const BN_EPSILON: f64 = 1e-5;

/// Inverted residual settings: (expansion, output channels, repeats, first stride)
pub const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

/// Configuration for the backbone
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// Channel width multiplier
    #[config(default = "1.0")]
    pub width_multiplier: f64,

    /// Channels of the final 1x1 convolution (scaled up when width > 1)
    #[config(default = "1280")]
    pub last_channels: usize,

    /// Number of input channels (3 for RGB)
    #[config(default = "3")]
    pub in_channels: usize,
}

/// Round channel counts to a multiple of 8, never dropping more than 10%
pub fn make_divisible(value: f64, divisor: usize) -> usize {
    let d = divisor as f64;
    let mut rounded = (((value + d / 2.0) / d).floor() * d).max(d) as usize;
    if (rounded as f64) < 0.9 * value {
        rounded += divisor;
    }
    rounded
}

/// Convolution followed by batch normalization and an optional ReLU6
#[derive(Module, Debug)]
pub struct ConvBnAct<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
    /// `Some` applies ReLU capped at 6, `None` keeps the unit linear
    pub activation: Option<Relu>,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub groups: usize,
}

impl<B: Backend> ConvBnAct<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        groups: usize,
        relu6: bool,
        device: &B::Device,
    ) -> Self {
        let padding = kernel_size / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(groups)
            .with_bias(false)
            .init(device);

        let bn = BatchNormConfig::new(out_channels)
            .with_epsilon(BN_EPSILON)
            .init(device);

        Self {
            conv,
            bn,
            activation: if relu6 { Some(Relu::new()) } else { None },
            in_channels,
            out_channels,
            kernel_size,
            stride,
            groups,
        }
    }

    /// Forward pass; `frozen` switches batch norm to its running statistics
    pub fn forward(&self, x: Tensor<B, 4>, frozen: bool) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = if frozen {
            self.frozen_batch_norm(x)
        } else {
            self.bn.forward(x)
        };

        match &self.activation {
            Some(relu) => relu.forward(x).clamp_max(6.0),
            None => x,
        }
    }

    fn frozen_batch_norm(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let channels = self.out_channels;
        let mean = self.bn.running_mean.value().reshape([1, channels, 1, 1]);
        let var = self.bn.running_var.value().reshape([1, channels, 1, 1]);
        let gamma = self.bn.gamma.val().detach().reshape([1, channels, 1, 1]);
        let beta = self.bn.beta.val().detach().reshape([1, channels, 1, 1]);

        (x - mean) / var.add_scalar(BN_EPSILON).sqrt() * gamma + beta
    }

    /// Activation name used in exported topologies
    pub fn activation_name(&self) -> &'static str {
        if self.activation.is_some() {
            "relu6"
        } else {
            "linear"
        }
    }
}

/// Expand (1x1) → depthwise (3x3) → project (1x1, linear), with a skip
/// connection when the block keeps resolution and channel count
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    pub expand: Option<ConvBnAct<B>>,
    pub depthwise: ConvBnAct<B>,
    pub project: ConvBnAct<B>,
}

impl<B: Backend> InvertedResidual<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        expansion: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expansion;
        let expand = if expansion != 1 {
            Some(ConvBnAct::new(in_channels, hidden, 1, 1, 1, true, device))
        } else {
            None
        };

        Self {
            expand,
            depthwise: ConvBnAct::new(hidden, hidden, 3, stride, hidden, true, device),
            project: ConvBnAct::new(hidden, out_channels, 1, 1, 1, false, device),
        }
    }

    pub fn num_layers(&self) -> usize {
        if self.expand.is_some() {
            3
        } else {
            2
        }
    }

    pub fn has_residual(&self) -> bool {
        let in_channels = match &self.expand {
            Some(expand) => expand.in_channels,
            None => self.depthwise.in_channels,
        };
        self.depthwise.stride == 1 && in_channels == self.project.out_channels
    }

    /// `first_index` is the flat index of this block's first unit
    pub fn forward(&self, x: Tensor<B, 4>, first_index: usize, trainable_from: usize) -> Tensor<B, 4> {
        let mut index = first_index;
        let mut out = x.clone();

        if let Some(expand) = &self.expand {
            out = expand.forward(out, index < trainable_from);
            index += 1;
        }
        out = self.depthwise.forward(out, index < trainable_from);
        index += 1;
        out = self.project.forward(out, index < trainable_from);

        if self.has_residual() {
            out + x
        } else {
            out
        }
    }
}

/// MobileNetV2-style feature extractor
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    pub stem: ConvBnAct<B>,
    pub blocks: Vec<InvertedResidual<B>>,
    pub last: ConvBnAct<B>,
}

impl<B: Backend> Backbone<B> {
    /// Create a backbone with freshly initialized weights
    pub fn new(config: &BackboneConfig, device: &B::Device) -> Self {
        let width = config.width_multiplier;
        let mut in_channels = make_divisible(32.0 * width, 8);
        let stem = ConvBnAct::new(config.in_channels, in_channels, 3, 2, 1, true, device);

        let mut blocks = Vec::new();
        for (expansion, channels, repeats, first_stride) in INVERTED_RESIDUAL_SETTINGS {
            let out_channels = make_divisible(channels as f64 * width, 8);
            for i in 0..repeats {
                let stride = if i == 0 { first_stride } else { 1 };
                blocks.push(InvertedResidual::new(
                    in_channels,
                    out_channels,
                    stride,
                    expansion,
                    device,
                ));
                in_channels = out_channels;
            }
        }

        let last_channels = if width > 1.0 {
            make_divisible(config.last_channels as f64 * width, 8)
        } else {
            config.last_channels
        };
        let last = ConvBnAct::new(in_channels, last_channels, 1, 1, 1, true, device);

        Self { stem, blocks, last }
    }

    /// Number of freezable layers
    pub fn num_layers(&self) -> usize {
        2 + self.blocks.iter().map(|b| b.num_layers()).sum::<usize>()
    }

    /// Channels of the feature map fed to the head
    pub fn out_channels(&self) -> usize {
        self.last.out_channels
    }

    /// Layers at index `< trainable_from` run frozen. The output of a fully
    /// frozen prefix is detached so no gradient flows back into it.
    pub fn forward(&self, x: Tensor<B, 4>, trainable_from: usize) -> Tensor<B, 4> {
        let mut x = self.stem.forward(x, 0 < trainable_from);
        let mut index = 1;
        if index <= trainable_from {
            x = x.detach();
        }

        for block in &self.blocks {
            x = block.forward(x, index, trainable_from);
            index += block.num_layers();
            if index <= trainable_from {
                x = x.detach();
            }
        }

        let x = self.last.forward(x, index < trainable_from);
        if index < trainable_from {
            x.detach()
        } else {
            x
        }
    }

    /// Layers in flat order
    pub fn layers(&self) -> Vec<&ConvBnAct<B>> {
        let mut layers = vec![&self.stem];
        for block in &self.blocks {
            if let Some(expand) = &block.expand {
                layers.push(expand);
            }
            layers.push(&block.depthwise);
            layers.push(&block.project);
        }
        layers.push(&self.last);
        layers
    }

    /// Mutable layers in flat order
    pub fn layers_mut(&mut self) -> Vec<&mut ConvBnAct<B>> {
        let mut layers = vec![&mut self.stem];
        for block in self.blocks.iter_mut() {
            if let Some(expand) = block.expand.as_mut() {
                layers.push(expand);
            }
            layers.push(&mut block.depthwise);
            layers.push(&mut block.project);
        }
        layers.push(&mut self.last);
        layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn tiny_config() -> BackboneConfig {
        BackboneConfig::new()
            .with_width_multiplier(0.25)
            .with_last_channels(32)
    }

    #[test]
    fn test_make_divisible() {
        assert_eq!(make_divisible(32.0, 8), 32);
        assert_eq!(make_divisible(8.0, 8), 8);
        assert_eq!(make_divisible(4.0, 8), 8);
        assert_eq!(make_divisible(24.0 * 0.35, 8), 8);
        assert_eq!(make_divisible(96.0 * 0.75, 8), 72);
    }

    #[test]
    fn test_full_width_layer_count() {
        let device = Default::default();
        let backbone = Backbone::<TestBackend>::new(&BackboneConfig::new(), &device);
        assert_eq!(backbone.blocks.len(), 17);
        assert_eq!(backbone.num_layers(), 52);
        assert_eq!(backbone.layers().len(), 52);
        assert_eq!(backbone.out_channels(), 1280);
    }

    #[test]
    fn test_forward_output_shape() {
        let device = Default::default();
        let backbone = Backbone::<TestBackend>::new(&tiny_config(), &device);
        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);

        let out = backbone.forward(x, backbone.num_layers());
        assert_eq!(out.dims(), [2, 32, 1, 1]);
    }

    #[test]
    fn test_residual_only_when_shape_preserved() {
        let device = Default::default();
        let backbone = Backbone::<TestBackend>::new(&BackboneConfig::new(), &device);
        assert!(!backbone.blocks[0].has_residual());
        assert!(!backbone.blocks[1].has_residual());
        assert!(backbone.blocks[2].has_residual());
    }

    #[test]
    fn test_frozen_batch_norm_matches_inference_mode() {
        let device = Default::default();
        let unit = ConvBnAct::<TestBackend>::new(3, 8, 3, 1, 1, true, &device);
        let x = Tensor::<TestBackend, 4>::ones([1, 3, 6, 6], &device);

        // NdArray has no autodiff, so the regular path already uses running stats.
        let regular = unit.forward(x.clone(), false);
        let frozen = unit.forward(x, true);
        let diff = (regular - frozen).abs().max().into_scalar();
        assert!(diff < 1e-5);
    }
}

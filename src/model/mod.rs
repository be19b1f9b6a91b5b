//! Model module
//!
//! - `backbone`: MobileNetV2-style pretrained feature extractor
//! - `classifier`: dense head and the layer-level freezing control
//! - `assembler`: builds the run's model from a pretrained backbone record
//! - `weights`: named, ordered weight access for export and reload
//! - `pretrained`: imports timm MobileNetV2 safetensors into a backbone record

pub mod assembler;
pub mod backbone;
pub mod classifier;
pub mod pretrained;
pub mod weights;

pub use assembler::{
    assemble, load_backbone, record_file, save_backbone, ModelBlueprint, WeightsRecorder,
};
pub use backbone::{Backbone, BackboneConfig, ConvBnAct, InvertedResidual};
pub use classifier::{ClassifierHead, DenseBlock, ThumbnailClassifier, TrainableSummary};
pub use pretrained::{import_pretrained, PretrainedSource, DEFAULT_HUB_FILE, DEFAULT_HUB_REPO};
pub use weights::{apply_backbone_tensors, apply_named_tensors, collect_named_tensors, NamedTensor};

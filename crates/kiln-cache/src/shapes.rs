//! Static input shapes for compilation.
//!
//! The accelerator compiler only accepts static shapes, so every model is
//! compiled for fixed axis values. These helpers collect the mandatory axes
//! of each model family and order them into the `input_shapes` vector that
//! enters a [`ModelFingerprint`](crate::keys::ModelFingerprint).
//!
//! Stable-diffusion pipelines are split into four separately compiled
//! components whose shapes are partly derived from the pipeline config.

use std::collections::BTreeMap;
use std::fmt;

use kiln_core::Precision;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Task name that adds the `num_choices` axis to text encoders.
pub const MULTIPLE_CHOICE_TASK: &str = "multiple-choice";

/// VAE scale factor used when the VAE lists no output blocks.
pub const DEFAULT_VAE_SCALE_FACTOR: usize = 8;

/// Errors that can occur while resolving input shapes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    /// A mandatory axis has no value.
    #[error("missing value for mandatory axis `{axis}` of {scope}")]
    MissingAxis {
        /// Model family or component name.
        scope: String,
        /// Axis name.
        axis: String,
    },

    /// An axis value is unusable.
    #[error("invalid value {value} for axis `{axis}`")]
    InvalidAxis {
        /// Axis name.
        axis: String,
        /// Rejected value.
        value: usize,
    },
}

/// Result type for shape operations.
pub type Result<T> = std::result::Result<T, ShapeError>;

/// Axis name to value.
pub type AxisValues = BTreeMap<String, usize>;

/// Model families sharing the same mandatory axes.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
    /// Encoder-only text models (BERT and friends).
    TextEncoder,
    /// Vision models.
    Vision,
    /// Multi-modal text and vision models.
    TextAndVision,
    /// Decoder-only text models.
    TextDecoder,
    /// Encoder-decoder text models.
    TextSeq2Seq,
}

impl ModelFamily {
    /// Mandatory axes for `task`, in input-shape order.
    #[must_use]
    pub fn mandatory_axes(self, task: &str) -> Vec<&'static str> {
        match self {
            Self::TextEncoder => {
                let mut axes = vec!["batch_size", "sequence_length"];
                if task == MULTIPLE_CHOICE_TASK {
                    axes.push("num_choices");
                }
                axes
            }
            Self::Vision => vec!["batch_size", "num_channels", "width", "height"],
            Self::TextAndVision => vec![
                "batch_size",
                "sequence_length",
                "num_channels",
                "width",
                "height",
            ],
            Self::TextDecoder | Self::TextSeq2Seq => vec!["batch_size", "sequence_length"],
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::TextEncoder => "text-encoder",
            Self::Vision => "vision",
            Self::TextAndVision => "text-and-vision",
            Self::TextDecoder => "text-decoder",
            Self::TextSeq2Seq => "text-seq2seq",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order the mandatory axes of `family` for `task` into an input-shape
/// vector. Extra axes are ignored.
pub fn input_shapes_for(family: ModelFamily, task: &str, axes: &AxisValues) -> Result<Vec<usize>> {
    ordered(&family.to_string(), &family.mandatory_axes(task), |axis| {
        axes.get(axis).copied()
    })
}

fn ordered<F>(scope: &str, axes: &[&str], lookup: F) -> Result<Vec<usize>>
where
    F: Fn(&str) -> Option<usize>,
{
    axes.iter()
        .map(|&axis| match lookup(axis) {
            Some(0) => Err(ShapeError::InvalidAxis {
                axis: axis.to_string(),
                value: 0,
            }),
            Some(value) => Ok(value),
            None => Err(ShapeError::MissingAxis {
                scope: scope.to_string(),
                axis: axis.to_string(),
            }),
        })
        .collect()
}

/// Separately compiled parts of a stable-diffusion pipeline.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffusionComponent {
    /// CLIP text encoder.
    TextEncoder,
    /// Denoising U-Net.
    Unet,
    /// VAE encoder.
    VaeEncoder,
    /// VAE decoder.
    VaeDecoder,
}

impl DiffusionComponent {
    /// All components, in export order.
    pub const ALL: [Self; 4] = [Self::TextEncoder, Self::Unet, Self::VaeEncoder, Self::VaeDecoder];

    /// Component name, also used as its subdirectory.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::TextEncoder => "text_encoder",
            Self::Unet => "unet",
            Self::VaeEncoder => "vae_encoder",
            Self::VaeDecoder => "vae_decoder",
        }
    }

    /// Mandatory axes, in input-shape order.
    #[must_use]
    pub fn axes(self) -> &'static [&'static str] {
        match self {
            Self::TextEncoder => &["batch_size", "sequence_length"],
            Self::Unet => &[
                "batch_size",
                "sequence_length",
                "num_channels",
                "height",
                "width",
            ],
            Self::VaeEncoder | Self::VaeDecoder => &["batch_size", "num_channels", "height", "width"],
        }
    }
}

impl fmt::Display for DiffusionComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// User-supplied axis values for a stable-diffusion export. Unset values are
/// filled in by [`infer_diffusion_shapes`] or must be provided later.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffusionShapeArgs {
    /// Batch size, shared by every component.
    pub batch_size: Option<usize>,
    /// Text encoder and U-Net sequence length.
    pub sequence_length: Option<usize>,
    /// U-Net input channels.
    pub unet_num_channels: Option<usize>,
    /// VAE encoder input channels.
    pub vae_encoder_num_channels: Option<usize>,
    /// VAE decoder (latent) channels.
    pub vae_decoder_num_channels: Option<usize>,
    /// Image height in pixels.
    pub height: Option<usize>,
    /// Image width in pixels.
    pub width: Option<usize>,
}

/// Per-component axis values, possibly incomplete.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffusionShapes {
    components: BTreeMap<DiffusionComponent, BTreeMap<String, Option<usize>>>,
}

impl DiffusionShapes {
    /// Value of `axis` for `component`, if set.
    #[must_use]
    pub fn get(&self, component: DiffusionComponent, axis: &str) -> Option<usize> {
        self.components
            .get(&component)
            .and_then(|axes| axes.get(axis).copied().flatten())
    }

    /// Set `axis` of `component`.
    pub fn set(&mut self, component: DiffusionComponent, axis: &str, value: usize) {
        self.components
            .entry(component)
            .or_default()
            .insert(axis.to_string(), Some(value));
    }

    /// Axis map of `component`, including unset axes.
    #[must_use]
    pub fn component(&self, component: DiffusionComponent) -> Option<&BTreeMap<String, Option<usize>>> {
        self.components.get(&component)
    }

    /// Ordered input shapes of `component`; fails on any unset axis.
    pub fn input_shapes(&self, component: DiffusionComponent) -> Result<Vec<usize>> {
        ordered(component.name(), component.axes(), |axis| {
            self.get(component, axis)
        })
    }
}

/// Build the mandatory axis maps of every diffusion component from shared
/// arguments.
#[must_use]
pub fn build_diffusion_mandatory_shapes(args: &DiffusionShapeArgs) -> DiffusionShapes {
    let mut components = BTreeMap::new();
    for component in DiffusionComponent::ALL {
        let axes = component
            .axes()
            .iter()
            .map(|&axis| {
                let value = match (component, axis) {
                    (_, "batch_size") => args.batch_size,
                    (_, "sequence_length") => args.sequence_length,
                    (_, "height") => args.height,
                    (_, "width") => args.width,
                    (DiffusionComponent::Unet, "num_channels") => args.unet_num_channels,
                    (DiffusionComponent::VaeEncoder, "num_channels") => {
                        args.vae_encoder_num_channels
                    }
                    (DiffusionComponent::VaeDecoder, "num_channels") => {
                        args.vae_decoder_num_channels
                    }
                    _ => None,
                };
                (axis.to_string(), value)
            })
            .collect();
        components.insert(component, axes);
    }
    DiffusionShapes { components }
}

/// The parts of a stable-diffusion pipeline config that determine shapes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffusionPipelineConfig {
    /// Tokenizer maximum length.
    pub tokenizer_max_length: usize,
    /// U-Net input channels.
    pub unet_in_channels: usize,
    /// VAE input channels.
    pub vae_in_channels: usize,
    /// VAE latent channels.
    pub vae_latent_channels: usize,
    /// VAE output channels per block.
    #[serde(default)]
    pub vae_block_out_channels: Vec<usize>,
}

impl DiffusionPipelineConfig {
    /// `2^(blocks - 1)`, or [`DEFAULT_VAE_SCALE_FACTOR`] without blocks.
    ///
    /// Fails when the block count is too large for the factor to fit a `usize`.
    pub fn vae_scale_factor(&self) -> Result<usize> {
        let blocks = self.vae_block_out_channels.len();
        if blocks == 0 {
            return Ok(DEFAULT_VAE_SCALE_FACTOR);
        }
        u32::try_from(blocks - 1)
            .ok()
            .and_then(|shift| 1usize.checked_shl(shift))
            .ok_or_else(|| ShapeError::InvalidAxis {
                axis: "vae_block_out_channels".to_string(),
                value: blocks,
            })
    }
}

/// Fill the derived axes of `shapes` from the pipeline config.
///
/// Sequence length comes from the tokenizer, channel counts from the U-Net
/// and VAE configs. The U-Net `height` and `width` must be set: they are
/// given in pixels and get divided by the VAE scale factor for the U-Net and
/// both VAE components.
pub fn infer_diffusion_shapes(
    shapes: &mut DiffusionShapes,
    config: &DiffusionPipelineConfig,
) -> Result<()> {
    use DiffusionComponent::{TextEncoder, Unet, VaeDecoder, VaeEncoder};

    let pixel = |axis: &str| {
        shapes.get(Unet, axis).ok_or_else(|| ShapeError::MissingAxis {
            scope: Unet.name().to_string(),
            axis: axis.to_string(),
        })
    };
    let scale = config.vae_scale_factor()?;
    let height = pixel("height")? / scale;
    let width = pixel("width")? / scale;
    if height == 0 || width == 0 {
        return Err(ShapeError::InvalidAxis {
            axis: if height == 0 { "height" } else { "width" }.to_string(),
            value: 0,
        });
    }

    let sequence_length = config.tokenizer_max_length;
    shapes.set(TextEncoder, "sequence_length", sequence_length);

    shapes.set(Unet, "sequence_length", sequence_length);
    shapes.set(Unet, "num_channels", config.unet_in_channels);

    shapes.set(VaeEncoder, "num_channels", config.vae_in_channels);
    shapes.set(VaeDecoder, "num_channels", config.vae_latent_channels);

    for component in [Unet, VaeEncoder, VaeDecoder] {
        shapes.set(component, "height", height);
        shapes.set(component, "width", width);
    }
    Ok(())
}

/// Precision each diffusion component is exported with by default.
#[must_use]
pub fn default_component_precisions() -> BTreeMap<DiffusionComponent, Precision> {
    DiffusionComponent::ALL
        .into_iter()
        .map(|component| (component, Precision::Float32))
        .collect()
}

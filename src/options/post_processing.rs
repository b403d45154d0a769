use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How the exposure controller fetches the 1x1 luminance texel.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ExposureReadback {
    /// Read this frame's texel, stalling until the GPU is done.
    #[default]
    Blocking,
    /// Consume last frame's texel and start this frame's copy. No stall,
    /// one frame of exposure latency.
    Delayed,
}

/// Post-processing chain settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[schemars(title = "Effects", inline)]
#[serde(default)]
pub struct PostProcessingOptions {
    /// Run the downsample, exposure, bloom and blur chain. When off the
    /// scene is presented as-is.
    #[schemars(title = "Enable Effects")]
    pub enable_effects: bool,
    /// Display gamma. Only applied when the output is not sRGB.
    #[schemars(title = "Gamma", range(min = 1.0, max = 3.0), extend("step" = 0.1))]
    pub gamma: f32,
    /// Luminance below which the bright-pass suppresses pixels.
    #[schemars(title = "Bloom Threshold", range(min = 0.0, max = 4.0), extend("step" = 0.05))]
    pub bright_pass_threshold: f32,
    /// Exposure the controller starts from, clamped to `[0, 5]`.
    #[schemars(skip)]
    pub initial_exposure: f32,
    /// Luminance readback strategy.
    #[schemars(title = "Exposure Readback")]
    pub exposure_readback: ExposureReadback,
}

impl Default for PostProcessingOptions {
    fn default() -> Self {
        Self {
            enable_effects: true,
            gamma: 2.2,
            bright_pass_threshold: 1.0,
            initial_exposure: 0.0,
            exposure_readback: ExposureReadback::Blocking,
        }
    }
}

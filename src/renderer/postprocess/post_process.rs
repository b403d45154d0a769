//! Frame orchestration for the post-processing chain.
//!
//! The external scene renderer draws into the `scene` target; calling
//! [`PostProcessPipeline::render_scene`] then walks the
//! [`FrameStage`] sequence and leaves the final image in the default
//! framebuffer.

use super::bloom::BloomBlurChain;
use super::composite::{CompositeInputs, Compositor};
use super::downsample::DownsampleChain;
use super::exposure::ExposureController;
use super::quad::FullScreenQuad;
use super::screen_pass::PassContext;
use super::targets::{
    RenderTarget, RenderTargetRegistry, StageTarget, TargetName,
};
use crate::error::PostFxError;
use crate::gpu::backend::{RenderBackend, TextureHandle};
use crate::gpu::shader_program::{
    CompositeParameters, HighPassParameters, Program, ShaderBindings,
};
use crate::options::PostProcessingOptions;

/// One step of the per-frame state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStage {
    /// Scene → 64 → … → 1 luminance cascade.
    Downsample,
    /// Fold the 1x1 luminance texel into the exposure.
    Exposure,
    /// Threshold the scene into the bright-pass target.
    BrightPass,
    /// Wide blur stage `n` of the bloom chain.
    Bloom(usize),
    /// Narrow blur stage `n` of the blur chain.
    Blur(usize),
    /// Combine into the default framebuffer.
    Composite,
    /// Recreate the scene target if the display size changed.
    ResizeCheck,
}

const EFFECTS_SEQUENCE: [FrameStage; 9] = [
    FrameStage::Downsample,
    FrameStage::Exposure,
    FrameStage::BrightPass,
    FrameStage::Bloom(0),
    FrameStage::Bloom(1),
    FrameStage::Blur(0),
    FrameStage::Blur(1),
    FrameStage::Composite,
    FrameStage::ResizeCheck,
];

const PASSTHROUGH_SEQUENCE: [FrameStage; 2] =
    [FrameStage::Composite, FrameStage::ResizeCheck];

impl FrameStage {
    /// Stages run each frame, in order.
    #[must_use]
    pub const fn sequence(effects_enabled: bool) -> &'static [Self] {
        if effects_enabled {
            &EFFECTS_SEQUENCE
        } else {
            &PASSTHROUGH_SEQUENCE
        }
    }
}

/// Textures produced so far in the current frame.
struct FrameOutputs {
    luminance: TextureHandle,
    bloom: TextureHandle,
    blur: TextureHandle,
}

/// Owns the render targets, quad, shader bindings and exposure state of
/// the post-processing chain.
#[derive(Debug)]
pub struct PostProcessPipeline {
    registry: RenderTargetRegistry,
    quad: FullScreenQuad,
    shaders: ShaderBindings,
    downsample: DownsampleChain,
    exposure: ExposureController,
    bloom: BloomBlurChain,
    compositor: Compositor,
    effects_enabled: bool,
}

impl PostProcessPipeline {
    /// Allocate the scene target and, if effects are on, the fixed effect
    /// targets.
    ///
    /// If an effect target cannot be created the pipeline keeps running
    /// with effects disabled for the rest of the session.
    ///
    /// # Errors
    ///
    /// [`PostFxError::CreationFailed`] if the scene target itself cannot be
    /// created.
    pub fn new<B: RenderBackend>(
        backend: &mut B,
        options: &PostProcessingOptions,
    ) -> Result<Self, PostFxError> {
        let mut registry = RenderTargetRegistry::new();
        let (width, height) = backend.display_size();
        let _ = registry.ensure_primary(backend, width, height)?;

        let mut effects_enabled = options.enable_effects;
        if effects_enabled {
            if let Err(e) = allocate_effect_targets(&mut registry, backend) {
                log::error!(
                    "effect targets unavailable ({e}); post-processing \
                     disabled for this session"
                );
                for stage in StageTarget::ALL {
                    if stage != StageTarget::Scene {
                        registry.destroy(backend, stage);
                    }
                }
                effects_enabled = false;
            }
        }

        let mut shaders = ShaderBindings::new();
        shaders.register(
            Program::HighPass,
            Box::new(HighPassParameters {
                threshold: options.bright_pass_threshold,
            }),
        );
        shaders.register(
            Program::Composite,
            Box::new(CompositeParameters::for_output(
                options.gamma,
                backend.output_is_srgb(),
            )),
        );

        log::info!(
            "post-processing pipeline ready: {width}x{height}, effects {}, \
             {} targets",
            if effects_enabled { "on" } else { "off" },
            registry.len()
        );

        Ok(Self {
            registry,
            quad: FullScreenQuad::new(),
            shaders,
            downsample: DownsampleChain,
            exposure: ExposureController::new(
                options.initial_exposure,
                options.exposure_readback,
            ),
            bloom: BloomBlurChain,
            compositor: Compositor,
            effects_enabled,
        })
    }

    /// Run one frame of post-processing and write the result to the
    /// default framebuffer.
    ///
    /// The scene target must already hold this frame's rendering. If an
    /// earlier resize left no scene target, one is created at the display
    /// size first.
    ///
    /// # Errors
    ///
    /// Any failure aborts the rest of the frame. Draw state is restored, so
    /// the next call starts cleanly.
    pub fn render_scene<B: RenderBackend>(
        &mut self,
        backend: &mut B,
    ) -> Result<(), PostFxError> {
        if !self.registry.contains(StageTarget::Scene) {
            let (width, height) = backend.display_size();
            log::debug!("scene target missing, recreating at {width}x{height}");
            let _ = self.registry.ensure_primary(&mut *backend, width, height)?;
        }
        let scene = self.registry.get(StageTarget::Scene)?;
        let mut outputs = FrameOutputs {
            luminance: scene.color,
            bloom: scene.color,
            blur: scene.color,
        };

        for &stage in FrameStage::sequence(self.effects_enabled) {
            let mut ctx = PassContext {
                backend: &mut *backend,
                quad: &mut self.quad,
                shaders: &mut self.shaders,
            };
            match stage {
                FrameStage::Downsample => {
                    outputs.luminance = self.downsample.generate(
                        &mut ctx,
                        &self.registry,
                        &scene,
                    )?;
                }
                FrameStage::Exposure => {
                    let texel = self.registry.get(StageTarget::Down1)?.color;
                    if outputs.luminance == texel {
                        self.exposure.update(&mut *ctx.backend, texel)?;
                    } else {
                        log::trace!(
                            "luminance cascade incomplete, keeping exposure"
                        );
                    }
                }
                FrameStage::BrightPass => {
                    outputs.bloom = self.bloom.bright_pass(
                        &mut ctx,
                        &self.registry,
                        scene.color,
                    )?;
                }
                FrameStage::Bloom(i) => {
                    outputs.bloom = self.bloom.bloom(
                        &mut ctx,
                        &self.registry,
                        i,
                        outputs.bloom,
                    )?;
                }
                FrameStage::Blur(i) => {
                    outputs.blur = self.bloom.blur(
                        &mut ctx,
                        &self.registry,
                        i,
                        outputs.blur,
                    )?;
                }
                FrameStage::Composite => {
                    if self.effects_enabled {
                        self.compositor.composite(
                            &mut ctx,
                            &scene,
                            CompositeInputs {
                                bloom: outputs.bloom,
                                blur: outputs.blur,
                                exposure: self.exposure.exposure(),
                            },
                        )?;
                    } else {
                        self.compositor.present_scene(&mut ctx, &scene)?;
                    }
                }
                FrameStage::ResizeCheck => {
                    let (width, height) = backend.display_size();
                    let _ = self.registry.ensure_primary(
                        &mut *backend,
                        width,
                        height,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Current smoothed exposure.
    #[must_use]
    pub fn exposure(&self) -> f32 {
        self.exposure.exposure()
    }

    /// Handles of a named target, for debug rendering or for the scene
    /// renderer to draw into `scene`.
    ///
    /// # Errors
    ///
    /// [`PostFxError::NotFound`] if no such target exists.
    pub fn render_target(
        &self,
        name: impl Into<TargetName>,
    ) -> Result<RenderTarget, PostFxError> {
        self.registry.get(name)
    }

    /// Whether the effects chain runs. `false` if disabled by options or
    /// after an allocation failure at construction.
    #[must_use]
    pub fn effects_enabled(&self) -> bool {
        self.effects_enabled
    }

    /// The stages [`Self::render_scene`] walks each frame.
    #[must_use]
    pub fn frame_stages(&self) -> &'static [FrameStage] {
        FrameStage::sequence(self.effects_enabled)
    }

    /// Names of every live target, sorted.
    #[must_use]
    pub fn target_names(&self) -> Vec<TargetName> {
        self.registry.names()
    }

    /// Release every GPU resource the pipeline owns.
    pub fn release<B: RenderBackend>(mut self, backend: &mut B) {
        self.quad.release(backend);
        self.registry.release_all(backend);
        log::debug!("post-processing pipeline released");
    }
}

fn allocate_effect_targets<B: RenderBackend>(
    registry: &mut RenderTargetRegistry,
    backend: &mut B,
) -> Result<(), PostFxError> {
    DownsampleChain::allocate(registry, backend)?;
    BloomBlurChain::allocate(registry, backend)
}

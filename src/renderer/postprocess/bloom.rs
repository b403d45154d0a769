//! Bright-pass extraction, the wide bloom chain and the narrow blur chain.
//!
//! Bloom: scene → bright-pass → bloom0 → bloom1, blurred at
//! [`BLOOM_RADIUS`]. Blur: scene → blur0 → blur1, blurred at
//! [`BLUR_RADIUS`]. Both chains run at [`EFFECT_TARGET_SIZE`] regardless
//! of the window size.

use super::screen_pass::{PassContext, ScreenPass};
use super::targets::{
    RenderTargetRegistry, StageTarget, TargetName, EFFECT_TARGET_SIZE,
};
use crate::error::PostFxError;
use crate::gpu::backend::{RenderBackend, TextureHandle};
use crate::gpu::shader_program::{Program, UniformValue};

/// Blur radius of each bloom stage, in texels.
pub const BLOOM_RADIUS: f32 = 16.0;
/// Blur radius of each blur stage, in texels.
pub const BLUR_RADIUS: f32 = 2.0;
/// Number of stages in each of the bloom and blur chains.
pub const BLOOM_STAGES: usize = 2;

/// The bright-pass, bloom and blur passes.
#[derive(Debug, Default, Clone, Copy)]
pub struct BloomBlurChain;

impl BloomBlurChain {
    /// Allocate the bright-pass, bloom and blur targets.
    ///
    /// # Errors
    ///
    /// Propagates [`PostFxError::CreationFailed`].
    pub fn allocate<B: RenderBackend>(
        registry: &mut RenderTargetRegistry,
        backend: &mut B,
    ) -> Result<(), PostFxError> {
        let stages = [StageTarget::HighPass]
            .into_iter()
            .chain((0..BLOOM_STAGES).filter_map(StageTarget::bloom))
            .chain((0..BLOOM_STAGES).filter_map(StageTarget::blur));
        for stage in stages {
            let _ = registry.create_or_replace(
                backend,
                stage,
                EFFECT_TARGET_SIZE,
                EFFECT_TARGET_SIZE,
                true,
                false,
            )?;
        }
        Ok(())
    }

    /// Threshold `scene` into the bright-pass target.
    ///
    /// # Errors
    ///
    /// [`PostFxError::NotFound`] if the target is missing, or a draw
    /// failure.
    pub(crate) fn bright_pass<B: RenderBackend>(
        self,
        ctx: &mut PassContext<'_, B>,
        registry: &RenderTargetRegistry,
        scene: TextureHandle,
    ) -> Result<TextureHandle, PostFxError> {
        ScreenPass {
            label: StageTarget::HighPass.name(),
            target: registry.get(StageTarget::HighPass)?,
            program: Program::HighPass,
            source: scene,
            uniforms: &[],
        }
        .run(ctx)
    }

    /// Run bloom stage `index` over `input`.
    ///
    /// # Errors
    ///
    /// [`PostFxError::NotFound`] for an unknown stage or missing target,
    /// or a draw failure.
    pub(crate) fn bloom<B: RenderBackend>(
        self,
        ctx: &mut PassContext<'_, B>,
        registry: &RenderTargetRegistry,
        index: usize,
        input: TextureHandle,
    ) -> Result<TextureHandle, PostFxError> {
        let stage = StageTarget::bloom(index).ok_or_else(|| {
            PostFxError::NotFound(TargetName::from(format!(
                "sceneBloom{index}"
            )))
        })?;
        blur_stage(ctx, registry, stage, BLOOM_RADIUS, input)
    }

    /// Run blur stage `index` over `input`.
    ///
    /// # Errors
    ///
    /// [`PostFxError::NotFound`] for an unknown stage or missing target,
    /// or a draw failure.
    pub(crate) fn blur<B: RenderBackend>(
        self,
        ctx: &mut PassContext<'_, B>,
        registry: &RenderTargetRegistry,
        index: usize,
        input: TextureHandle,
    ) -> Result<TextureHandle, PostFxError> {
        let stage = StageTarget::blur(index).ok_or_else(|| {
            PostFxError::NotFound(TargetName::from(format!("sceneBlur{index}")))
        })?;
        blur_stage(ctx, registry, stage, BLUR_RADIUS, input)
    }
}

fn blur_stage<B: RenderBackend>(
    ctx: &mut PassContext<'_, B>,
    registry: &RenderTargetRegistry,
    stage: StageTarget,
    radius: f32,
    input: TextureHandle,
) -> Result<TextureHandle, PostFxError> {
    let uniforms = [("radius", UniformValue::Float(radius))];
    ScreenPass {
        label: stage.name(),
        target: registry.get(stage)?,
        program: Program::Blur,
        source: input,
        uniforms: &uniforms,
    }
    .run(ctx)
}

//! Luminance cascade: the scene box-filtered down to a single texel.
//!
//! Stages run strictly largest-first (64 → 32 → … → 1). Each one samples
//! its predecessor, so the order is a read-after-write dependency and no
//! stage may be skipped or reordered.

use super::screen_pass::{PassContext, ScreenPass};
use super::targets::{RenderTarget, RenderTargetRegistry, StageTarget};
use crate::error::PostFxError;
use crate::gpu::backend::{RenderBackend, TextureHandle};
use crate::gpu::shader_program::{Program, UniformValue};

/// Builds the downsample cascade each frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct DownsampleChain;

impl DownsampleChain {
    /// Allocate the fixed-size stage targets.
    ///
    /// # Errors
    ///
    /// Propagates [`PostFxError::CreationFailed`].
    pub fn allocate<B: RenderBackend>(
        registry: &mut RenderTargetRegistry,
        backend: &mut B,
    ) -> Result<(), PostFxError> {
        for stage in StageTarget::DOWNSAMPLE {
            let size = stage.fixed_size().unwrap_or(1);
            let _ = registry
                .create_or_replace(backend, stage, size, size, true, false)?;
        }
        Ok(())
    }

    /// Run every stage, starting from `scene`. Returns the texture the last
    /// stage produced (the 1x1 target unless a stage failed closed).
    ///
    /// # Errors
    ///
    /// [`PostFxError::NotFound`] if a stage target is missing, or any draw
    /// failure from the backend.
    pub(crate) fn generate<B: RenderBackend>(
        self,
        ctx: &mut PassContext<'_, B>,
        registry: &RenderTargetRegistry,
        scene: &RenderTarget,
    ) -> Result<TextureHandle, PostFxError> {
        let mut source = scene.color;
        for stage in StageTarget::DOWNSAMPLE {
            let target = registry.get(stage)?;
            let uniforms =
                [("size", UniformValue::Float(target.width as f32))];
            source = ScreenPass {
                label: stage.name(),
                target,
                program: Program::Downsample,
                source,
                uniforms: &uniforms,
            }
            .run(ctx)?;
        }
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::recording::RecordingBackend;
    use crate::gpu::shader_program::ShaderBindings;
    use crate::renderer::postprocess::quad::FullScreenQuad;

    #[test]
    fn each_stage_reads_the_next_larger_one() {
        let mut backend = RecordingBackend::new(640, 480);
        let mut registry = RenderTargetRegistry::new();
        let _ = registry.ensure_primary(&mut backend, 640, 480).unwrap();
        DownsampleChain::allocate(&mut registry, &mut backend).unwrap();
        let scene = registry.get(StageTarget::Scene).unwrap();
        backend.clear_log();

        let mut quad = FullScreenQuad::new();
        let mut shaders = ShaderBindings::new();
        let last = DownsampleChain
            .generate(
                &mut PassContext {
                    backend: &mut backend,
                    quad: &mut quad,
                    shaders: &mut shaders,
                },
                &registry,
                &scene,
            )
            .unwrap();
        assert_eq!(last, registry.get(StageTarget::Down1).unwrap().color);

        let draws = backend.draws();
        assert_eq!(draws.len(), StageTarget::DOWNSAMPLE.len());
        let mut expected_source = scene.color;
        let mut previous_size = u32::MAX;
        for (draw, stage) in draws.iter().zip(StageTarget::DOWNSAMPLE) {
            let target = registry.get(stage).unwrap();
            assert_eq!(draw.framebuffer, Some(target.framebuffer));
            assert_eq!(draw.textures[0], Some(expected_source));
            assert_eq!(draw.viewport.width, target.width);
            assert!(target.width < previous_size);
            if expected_source != scene.color {
                assert_eq!(previous_size, target.width * 2);
            }
            assert_eq!(
                draw.uniform("size"),
                Some(UniformValue::Float(target.width as f32))
            );
            previous_size = target.width;
            expected_source = target.color;
        }
    }

    #[test]
    fn missing_stage_target_is_reported() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut registry = RenderTargetRegistry::new();
        let _ = registry.ensure_primary(&mut backend, 64, 64).unwrap();
        let scene = registry.get(StageTarget::Scene).unwrap();
        let mut quad = FullScreenQuad::new();
        let mut shaders = ShaderBindings::new();
        let err = DownsampleChain
            .generate(
                &mut PassContext {
                    backend: &mut backend,
                    quad: &mut quad,
                    shaders: &mut shaders,
                },
                &registry,
                &scene,
            )
            .unwrap_err();
        assert!(matches!(err, PostFxError::NotFound(_)));
    }
}

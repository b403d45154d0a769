//! Final pass into the default framebuffer.

use super::screen_pass::{DrawScope, PassContext};
use super::targets::RenderTarget;
use crate::error::PostFxError;
use crate::gpu::backend::{RenderBackend, TextureHandle, Viewport};
use crate::gpu::shader_program::{Program, UniformSink, UniformValue};

/// Texture unit the scene color is bound to.
pub const SCENE_UNIT: u32 = 0;
/// Texture unit the last bloom stage is bound to.
pub const BLOOM_UNIT: u32 = 1;
/// Texture unit the scene depth is bound to.
pub const DEPTH_UNIT: u32 = 2;
/// Texture unit the last blur stage is bound to.
pub const BLUR_UNIT: u32 = 3;

/// Inputs of the effects composite.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CompositeInputs {
    pub bloom: TextureHandle,
    pub blur: TextureHandle,
    pub exposure: f32,
}

/// Combines scene, bloom, blur and depth onto the screen.
#[derive(Debug, Default, Clone, Copy)]
pub struct Compositor;

impl Compositor {
    /// Draw the effects composite. Falls back to [`Self::present_scene`]
    /// when the composite program is unavailable.
    ///
    /// # Errors
    ///
    /// Propagates draw failures.
    pub(crate) fn composite<B: RenderBackend>(
        self,
        ctx: &mut PassContext<'_, B>,
        scene: &RenderTarget,
        inputs: CompositeInputs,
    ) -> Result<(), PostFxError> {
        if !ctx.backend.program_ready(Program::Composite) {
            ctx.shaders.report_unavailable(Program::Composite);
            return self.present_scene(ctx, scene);
        }

        let mut scope = DrawScope::enter(&mut *ctx.backend);
        scope.bind_framebuffer(None);
        let viewport = display_viewport(&*scope);
        scope.set_viewport(viewport);
        ctx.shaders.enable(&mut *scope, Some(Program::Composite));

        scope.bind_texture(BLOOM_UNIT, Some(inputs.bloom));
        scene.bind_depth_texture(&mut *scope, DEPTH_UNIT);
        scope.bind_texture(BLUR_UNIT, Some(inputs.blur));
        scene.bind_texture(&mut *scope, SCENE_UNIT);

        for (&name, unit) in Program::Composite
            .samplers()
            .iter()
            .zip([SCENE_UNIT, BLOOM_UNIT, DEPTH_UNIT, BLUR_UNIT])
        {
            scope.set_uniform(name, UniformValue::Sampler(unit));
        }
        scope.set_uniform("exposure", UniformValue::Float(inputs.exposure));

        ctx.quad.render(&mut *scope)?;

        scene.unbind_texture(&mut *scope, SCENE_UNIT);
        ctx.shaders.enable(&mut *scope, None);
        Ok(())
    }

    /// Draw the scene color as-is with plain texturing.
    ///
    /// # Errors
    ///
    /// Propagates draw failures.
    pub(crate) fn present_scene<B: RenderBackend>(
        self,
        ctx: &mut PassContext<'_, B>,
        scene: &RenderTarget,
    ) -> Result<(), PostFxError> {
        let mut scope = DrawScope::enter(&mut *ctx.backend);
        scope.bind_framebuffer(None);
        let viewport = display_viewport(&*scope);
        scope.set_viewport(viewport);
        ctx.shaders.enable(&mut *scope, None);
        scene.bind_texture(&mut *scope, SCENE_UNIT);
        ctx.quad.render(&mut *scope)?;
        scene.unbind_texture(&mut *scope, SCENE_UNIT);
        Ok(())
    }
}

fn display_viewport<B: RenderBackend + ?Sized>(backend: &B) -> Viewport {
    let (width, height) = backend.display_size();
    Viewport::new(width, height)
}

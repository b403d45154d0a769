//! One full-screen pass from a source texture into a target, and the
//! guard that restores draw state around it.

use std::ops::{Deref, DerefMut};

use super::quad::FullScreenQuad;
use super::targets::RenderTarget;
use crate::error::PostFxError;
use crate::gpu::backend::{
    FramebufferHandle, RenderBackend, TextureHandle, Viewport,
};
use crate::gpu::shader_program::{
    Program, ShaderBindings, UniformSink, UniformValue,
};

/// Scoped override of the mutable draw state.
///
/// Saves the bound framebuffer, program and viewport on entry and puts
/// them back on drop, whichever way the scope is left.
pub struct DrawScope<'a, B: RenderBackend + ?Sized> {
    backend: &'a mut B,
    framebuffer: Option<FramebufferHandle>,
    program: Option<Program>,
    viewport: Viewport,
}

impl<'a, B: RenderBackend + ?Sized> DrawScope<'a, B> {
    /// Capture the current draw state of `backend`.
    #[must_use]
    pub fn enter(backend: &'a mut B) -> Self {
        let framebuffer = backend.bound_framebuffer();
        let program = backend.bound_program();
        let viewport = backend.viewport();
        Self {
            backend,
            framebuffer,
            program,
            viewport,
        }
    }
}

impl<B: RenderBackend + ?Sized> Deref for DrawScope<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        self.backend
    }
}

impl<B: RenderBackend + ?Sized> DerefMut for DrawScope<'_, B> {
    fn deref_mut(&mut self) -> &mut B {
        self.backend
    }
}

impl<B: RenderBackend + ?Sized> Drop for DrawScope<'_, B> {
    fn drop(&mut self) {
        if self.backend.bound_framebuffer() != self.framebuffer {
            self.backend.bind_framebuffer(self.framebuffer);
        }
        if self.backend.bound_program() != self.program {
            self.backend.bind_program(self.program);
        }
        if self.backend.viewport() != self.viewport {
            self.backend.set_viewport(self.viewport);
        }
    }
}

/// Everything a stage needs to issue draws.
pub(crate) struct PassContext<'a, B: RenderBackend> {
    pub backend: &'a mut B,
    pub quad: &'a mut FullScreenQuad,
    pub shaders: &'a mut ShaderBindings,
}

/// One full-screen pass from a source texture into a fixed target.
pub(crate) struct ScreenPass<'a> {
    pub label: &'static str,
    pub target: RenderTarget,
    pub program: Program,
    pub source: TextureHandle,
    pub uniforms: &'a [(&'static str, UniformValue)],
}

impl ScreenPass<'_> {
    /// Run the per-stage protocol: bind target, viewport, clear, enable
    /// program, uniforms, source on unit 0, draw, unbind.
    ///
    /// Returns the texture downstream stages should read. That is the
    /// target's color texture, or `source` unchanged when the program is
    /// unavailable.
    pub(crate) fn run<B: RenderBackend>(
        &self,
        ctx: &mut PassContext<'_, B>,
    ) -> Result<TextureHandle, PostFxError> {
        if !ctx.backend.program_ready(self.program) {
            ctx.shaders.report_unavailable(self.program);
            log::trace!("{} skipped, forwarding input", self.label);
            return Ok(self.source);
        }

        let mut scope = DrawScope::enter(&mut *ctx.backend);
        self.target.bind(&mut *scope);
        scope.set_viewport(self.target.viewport());
        scope.clear();
        ctx.shaders.enable(&mut *scope, Some(self.program));
        for &(name, value) in self.uniforms {
            scope.set_uniform(name, value);
        }
        scope.bind_texture(0, Some(self.source));
        ctx.quad.render(&mut *scope)?;
        self.target.unbind(&mut *scope);
        Ok(self.target.color)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::recording::{Command, RecordingBackend};
    use crate::renderer::postprocess::targets::RenderTargetRegistry;

    fn fixture() -> (RecordingBackend, RenderTarget, TextureHandle) {
        let mut backend = RecordingBackend::new(320, 200);
        let mut registry = RenderTargetRegistry::new();
        let source = registry
            .create_or_replace(&mut backend, "src", 32, 32, true, false)
            .unwrap()
            .color;
        let target = registry
            .create_or_replace(&mut backend, "dst", 16, 16, true, false)
            .unwrap();
        backend.clear_log();
        (backend, target, source)
    }

    #[test]
    fn pass_follows_stage_protocol_and_restores_state() {
        let (mut backend, target, source) = fixture();
        let mut quad = FullScreenQuad::new();
        let mut shaders = ShaderBindings::new();
        let uniforms = [("radius", UniformValue::Float(2.0))];
        let pass = ScreenPass {
            label: "test",
            target,
            program: Program::Blur,
            source,
            uniforms: &uniforms,
        };
        let output = pass
            .run(&mut PassContext {
                backend: &mut backend,
                quad: &mut quad,
                shaders: &mut shaders,
            })
            .unwrap();
        assert_eq!(output, target.color);

        let draws = backend.draws();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].framebuffer, Some(target.framebuffer));
        assert_eq!(draws[0].viewport, Viewport::new(16, 16));
        assert_eq!(draws[0].textures[0], Some(source));
        assert_eq!(draws[0].uniform("radius"), Some(UniformValue::Float(2.0)));

        let clear_at = backend
            .commands
            .iter()
            .position(|c| matches!(c, Command::Clear))
            .unwrap();
        let draw_at = backend
            .commands
            .iter()
            .position(|c| matches!(c, Command::Draw(_)))
            .unwrap();
        assert!(clear_at < draw_at);

        assert_eq!(backend.bound_framebuffer(), None);
        assert_eq!(backend.bound_program(), None);
        assert_eq!(backend.viewport(), Viewport::new(320, 200));
    }

    #[test]
    fn unavailable_program_forwards_source() {
        let (mut backend, target, source) = fixture();
        let _ = backend.broken_programs.insert(Program::Blur);
        let mut quad = FullScreenQuad::new();
        let mut shaders = ShaderBindings::new();
        let pass = ScreenPass {
            label: "test",
            target,
            program: Program::Blur,
            source,
            uniforms: &[],
        };
        let output = pass
            .run(&mut PassContext {
                backend: &mut backend,
                quad: &mut quad,
                shaders: &mut shaders,
            })
            .unwrap();
        assert_eq!(output, source);
        assert!(backend.draws().is_empty());
    }

    #[test]
    fn scope_restores_state_on_error_path() {
        let mut backend = RecordingBackend::new(100, 50);
        let failing: Result<(), PostFxError> = (|| {
            let mut scope = DrawScope::enter(&mut backend);
            scope.set_viewport(Viewport::new(4, 4));
            scope.bind_program(Some(Program::Downsample));
            Err(PostFxError::Readback("boom".to_owned()))
        })();
        assert!(failing.is_err());
        assert_eq!(backend.viewport(), Viewport::new(100, 50));
        assert_eq!(backend.bound_program(), None);
    }
}

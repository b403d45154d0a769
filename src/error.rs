//! Crate-level error types.

use std::fmt;

use crate::gpu::render_context::RenderContextError;
use crate::renderer::postprocess::targets::TargetName;

/// Kind of GPU resource whose creation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Color texture of a render target.
    ColorTexture,
    /// Sampleable depth texture of a render target.
    DepthTexture,
    /// Depth render-buffer of a render target.
    DepthBuffer,
    /// Framebuffer object tying attachments together.
    Framebuffer,
    /// Vertex data of the full-screen quad.
    QuadMesh,
    /// Compiled shader program or render pipeline.
    Program,
    /// Per-draw bind group or uniform block.
    BindGroup,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ColorTexture => "color texture",
            Self::DepthTexture => "depth texture",
            Self::DepthBuffer => "depth buffer",
            Self::Framebuffer => "framebuffer",
            Self::QuadMesh => "quad mesh",
            Self::Program => "shader program",
            Self::BindGroup => "bind group",
        };
        f.write_str(name)
    }
}

/// Errors produced by the afterimage crate.
#[derive(Debug)]
pub enum PostFxError {
    /// No render target is registered under the requested name.
    NotFound(TargetName),
    /// A GPU resource could not be allocated.
    CreationFailed {
        /// What was being created.
        resource: ResourceKind,
        /// Backend diagnostic.
        reason: String,
    },
    /// Reading a texel back from the GPU failed.
    Readback(String),
    /// GPU context initialization failure.
    Gpu(RenderContextError),
    /// The presentation surface could not provide a frame.
    Surface(wgpu::SurfaceError),
    /// Generic I/O failure.
    Io(std::io::Error),
    /// TOML options parsing/serialization failure.
    OptionsParse(String),
}

impl PostFxError {
    /// Shorthand for a [`PostFxError::CreationFailed`].
    pub(crate) fn creation(
        resource: ResourceKind,
        reason: impl Into<String>,
    ) -> Self {
        Self::CreationFailed {
            resource,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for PostFxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(name) => {
                write!(f, "render target '{name}' not found")
            }
            Self::CreationFailed { resource, reason } => {
                write!(f, "failed to create {resource}: {reason}")
            }
            Self::Readback(msg) => write!(f, "texel readback failed: {msg}"),
            Self::Gpu(e) => write!(f, "GPU error: {e}"),
            Self::Surface(e) => write!(f, "surface error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::OptionsParse(msg) => {
                write!(f, "options parse error: {msg}")
            }
        }
    }
}

impl std::error::Error for PostFxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Gpu(e) => Some(e),
            Self::Surface(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RenderContextError> for PostFxError {
    fn from(e: RenderContextError) -> Self {
        Self::Gpu(e)
    }
}

impl From<wgpu::SurfaceError> for PostFxError {
    fn from(e: wgpu::SurfaceError) -> Self {
        Self::Surface(e)
    }
}

impl From<std::io::Error> for PostFxError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

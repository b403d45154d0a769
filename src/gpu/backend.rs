//! Immediate-mode GPU command surface consumed by the post-processing
//! pipeline.
//!
//! The pipeline issues its commands in a fixed order through this trait:
//! bind a framebuffer, set the viewport, clear, enable a program, bind
//! textures, draw the quad. [`WgpuBackend`](super::wgpu_backend::WgpuBackend)
//! executes them on a real device.

use glam::Mat4;

use super::shader_program::{Program, UniformSink};
use crate::error::PostFxError;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a backend-assigned id. Zero is never a valid id.
            #[must_use]
            pub const fn from_raw(raw: u64) -> Option<Self> {
                if raw == 0 {
                    None
                } else {
                    Some(Self(raw))
                }
            }

            /// The backend-assigned id.
            #[must_use]
            pub const fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

handle!(
    /// Handle to a color or depth texture.
    TextureHandle
);
handle!(
    /// Handle to a depth render-buffer (attachment-only depth storage).
    RenderbufferHandle
);
handle!(
    /// Handle to a framebuffer object.
    FramebufferHandle
);
handle!(
    /// Handle to uploaded quad vertex data.
    MeshHandle
);

/// Color storage precision of a render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorFormat {
    /// 16-bit float components.
    Hdr,
    /// 8-bit normalized components.
    Ldr,
}

impl ColorFormat {
    /// Pick the format for a target's `hdr` flag.
    #[must_use]
    pub const fn from_hdr(hdr: bool) -> Self {
        if hdr {
            Self::Hdr
        } else {
            Self::Ldr
        }
    }
}

/// Attachments combined into one framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferAttachments {
    /// Color attachment 0.
    pub color: TextureHandle,
    /// Sampleable depth attachment.
    pub depth_texture: Option<TextureHandle>,
    /// Attachment-only depth storage.
    pub depth_buffer: Option<RenderbufferHandle>,
}

/// Pixel rectangle anchored at the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Viewport {
    /// Viewport covering `width` x `height`.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// One vertex of the full-screen quad.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct QuadVertex {
    /// Position in normalized device coordinates.
    pub position: [f32; 2],
    /// Texture coordinate, origin at the bottom-left.
    pub uv: [f32; 2],
}

/// GPU operations the post-processing pipeline needs.
///
/// Creation methods return [`PostFxError::CreationFailed`] instead of a
/// zero handle. Binding state (framebuffer, program, textures, viewport,
/// uniforms) persists until changed, as in a classic GL context.
pub trait RenderBackend: UniformSink {
    /// Allocate a color texture (bilinear filtering, clamp to edge).
    ///
    /// # Errors
    ///
    /// [`PostFxError::CreationFailed`] if the backend rejects the request.
    fn create_color_texture(
        &mut self,
        width: u32,
        height: u32,
        format: ColorFormat,
    ) -> Result<TextureHandle, PostFxError>;

    /// Allocate a sampleable depth texture (nearest filtering).
    ///
    /// # Errors
    ///
    /// [`PostFxError::CreationFailed`] if the backend rejects the request.
    fn create_depth_texture(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<TextureHandle, PostFxError>;

    /// Allocate attachment-only depth storage.
    ///
    /// # Errors
    ///
    /// [`PostFxError::CreationFailed`] if the backend rejects the request.
    fn create_depth_buffer(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<RenderbufferHandle, PostFxError>;

    /// Combine attachments into a framebuffer.
    ///
    /// # Errors
    ///
    /// [`PostFxError::CreationFailed`] if an attachment is not live or
    /// the attachment sizes disagree.
    fn create_framebuffer(
        &mut self,
        attachments: &FramebufferAttachments,
    ) -> Result<FramebufferHandle, PostFxError>;

    /// Upload quad vertices (drawn as a triangle strip).
    ///
    /// # Errors
    ///
    /// [`PostFxError::CreationFailed`] if the backend rejects the request.
    fn create_quad_mesh(
        &mut self,
        vertices: &[QuadVertex; 4],
    ) -> Result<MeshHandle, PostFxError>;

    /// Release a texture. Unknown handles are ignored.
    fn delete_texture(&mut self, texture: TextureHandle);

    /// Release a depth buffer. Unknown handles are ignored.
    fn delete_depth_buffer(&mut self, buffer: RenderbufferHandle);

    /// Release a framebuffer. Unknown handles are ignored.
    fn delete_framebuffer(&mut self, framebuffer: FramebufferHandle);

    /// Release quad vertex data. Unknown handles are ignored.
    fn delete_quad_mesh(&mut self, mesh: MeshHandle);

    /// Bind a framebuffer as draw target; `None` is the default framebuffer.
    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferHandle>);

    /// Currently bound draw target.
    fn bound_framebuffer(&self) -> Option<FramebufferHandle>;

    /// Set the viewport for subsequent draws.
    fn set_viewport(&mut self, viewport: Viewport);

    /// Current viewport.
    fn viewport(&self) -> Viewport;

    /// Clear color and depth of the bound draw target.
    fn clear(&mut self);

    /// Enable a program; `None` selects plain texturing.
    fn bind_program(&mut self, program: Option<Program>);

    /// Currently enabled program.
    fn bound_program(&self) -> Option<Program>;

    /// Whether `program` compiled and can be drawn with.
    fn program_ready(&self, program: Program) -> bool;

    /// Bind `texture` to texture `unit`; `None` unbinds it.
    fn bind_texture(&mut self, unit: u32, texture: Option<TextureHandle>);

    /// Draw `mesh` with the current state and the given projection.
    ///
    /// # Errors
    ///
    /// [`PostFxError::CreationFailed`] if the draw target, mesh or program
    /// state cannot be turned into GPU work.
    fn draw_quad(
        &mut self,
        mesh: MeshHandle,
        projection: &Mat4,
    ) -> Result<(), PostFxError>;

    /// Read texel (0, 0) of `texture` as RGBA floats, blocking until the
    /// GPU has produced it.
    ///
    /// # Errors
    ///
    /// [`PostFxError::Readback`] if the copy or the mapping fails.
    fn read_texel(&mut self, texture: TextureHandle)
        -> Result<[f32; 4], PostFxError>;

    /// Start an asynchronous copy of texel (0, 0). Ignored while a previous
    /// copy is still in flight.
    ///
    /// # Errors
    ///
    /// [`PostFxError::Readback`] if the copy cannot be issued.
    fn begin_texel_readback(
        &mut self,
        texture: TextureHandle,
    ) -> Result<(), PostFxError>;

    /// Take the result of a completed asynchronous copy, if any.
    ///
    /// # Errors
    ///
    /// [`PostFxError::Readback`] if the pending copy failed.
    fn poll_texel_readback(&mut self) -> Result<Option<[f32; 4]>, PostFxError>;

    /// Current display (default framebuffer) size.
    fn display_size(&self) -> (u32, u32);

    /// Whether the default framebuffer applies sRGB encoding on write.
    fn output_is_srgb(&self) -> bool;
}

//! GPU abstraction and its wgpu implementation.
//!
//! The post-processing chain talks to the GPU only through
//! [`backend::RenderBackend`]. [`wgpu_backend::WgpuBackend`] implements it
//! on top of a wgpu device, using naga-oil for shader composition.

/// Handles, formats and the backend trait the pipeline is written against.
pub mod backend;
/// Shared wgpu boilerplate for the full-screen quad programs.
pub mod pipeline_helpers;
/// wgpu device, surface, and queue initialization.
pub mod render_context;
/// WGSL shader composition with `#import` support via naga-oil.
pub mod shader_composer;
/// Shader programs and the parameter objects bound with them.
pub mod shader_program;
/// Owned output texture for headless rendering.
pub mod texture;
/// [`backend::RenderBackend`] implemented on wgpu.
pub mod wgpu_backend;

#[cfg(test)]
pub(crate) mod recording;

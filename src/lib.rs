// -- Lint policy ---------------------------------------------------------
// This is the single source of truth for crate-wide lints.

// Broad lint groups
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
// Documentation
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::bare_urls)]
// No panicking in library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
// No debug/print artifacts
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
// Import hygiene
#![deny(clippy::wildcard_imports)]
// Complexity limits (thresholds in clippy.toml)
#![deny(clippy::cognitive_complexity)]
#![deny(clippy::too_many_lines)]
#![deny(clippy::excessive_nesting)]
// Function signature hygiene
#![deny(clippy::too_many_arguments)]
#![deny(clippy::fn_params_excessive_bools)]
// Clone / pass-by-value hygiene
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::implicit_clone)]
// String hygiene
#![deny(clippy::inefficient_to_string)]
#![deny(clippy::redundant_closure_for_method_calls)]
#![deny(clippy::manual_string_new)]
#![deny(clippy::str_to_string)]
// Cargo lints (warn, not deny since cargo lints can be noisy)
#![warn(clippy::cargo)]
// Unused / redundant code
#![deny(unused_results)]
#![deny(unused_qualifications)]
// Cast hygiene
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]

//! HDR post-processing chain with automatic exposure, bloom and depth blur.
//!
//! An external renderer draws the scene into the `scene` render target.
//! [`PostProcessPipeline::render_scene`] then derives the average scene
//! luminance through a downsample cascade, adapts exposure towards a
//! mid-grey target, builds bloom and blur from a bright-pass copy, and
//! composites everything with gamma correction into the default
//! framebuffer.
//!
//! # Key entry points
//!
//! - [`PostProcessPipeline`] - owns every render target and runs a frame
//! - [`gpu::backend::RenderBackend`] - the GPU command surface the chain is
//!   written against
//! - [`WgpuBackend`] - the wgpu implementation of that surface
//! - [`Options`] - runtime configuration, loadable from TOML
//!
//! # Architecture
//!
//! Each frame walks a fixed [`FrameStage`] sequence: downsample → exposure
//! → bright pass → bloom → blur → composite → resize check. Every pass
//! draws one full-screen quad into a render target looked up by name in
//! the [`RenderTargetRegistry`]. If an effect target cannot be allocated,
//! or a program is not ready, the chain degrades to presenting the scene
//! unchanged instead of failing the frame.

pub mod error;
pub mod gpu;
pub mod options;
pub mod renderer;

pub use error::{PostFxError, ResourceKind};
pub use gpu::backend::RenderBackend;
pub use gpu::wgpu_backend::WgpuBackend;
pub use options::{ExposureReadback, Options, PostProcessingOptions};
pub use renderer::postprocess::post_process::{FrameStage, PostProcessPipeline};
pub use renderer::postprocess::targets::{RenderTargetRegistry, TargetName};

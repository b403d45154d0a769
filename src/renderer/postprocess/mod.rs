//! Post-processing chain: luminance cascade, auto-exposure, bright-pass
//! bloom, blur, and the final composite.

pub mod bloom;
pub mod composite;
pub mod downsample;
pub mod exposure;
pub mod post_process;
pub mod quad;
pub mod screen_pass;
pub mod targets;

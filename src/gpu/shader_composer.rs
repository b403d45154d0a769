use naga_oil::compose::{
    ComposableModuleDescriptor, Composer, ComposerError, NagaModuleDescriptor,
    ShaderLanguage, ShaderType,
};

use super::shader_program::Program;
use crate::error::{PostFxError, ResourceKind};

/// Wraps `naga_oil::compose::Composer` to provide shader composition with
/// `#import` support.
///
/// The shared `afterimage::fullscreen` module is registered at construction.
/// Programs pull it in with `#import afterimage::fullscreen::{..}`, and
/// composition produces `naga::Module` IR directly.
pub struct ShaderComposer {
    composer: Composer,
}

/// WGSL source of one shader file.
#[derive(Debug, Clone, Copy)]
pub struct ShaderSource {
    /// WGSL text, possibly with `#import` directives.
    pub source: &'static str,
    /// Path used in diagnostics.
    pub file_path: &'static str,
}

const SHARED_MODULES: &[ShaderSource] = &[ShaderSource {
    source: include_str!("../../assets/shaders/modules/fullscreen.wgsl"),
    file_path: "modules/fullscreen.wgsl",
}];

/// Source of `program`, or of the plain-texturing program for `None`.
#[must_use]
pub const fn program_source(program: Option<Program>) -> ShaderSource {
    match program {
        None => ShaderSource {
            source: include_str!("../../assets/shaders/screen/passthrough.wgsl"),
            file_path: "screen/passthrough.wgsl",
        },
        Some(Program::HighPass) => ShaderSource {
            source: include_str!("../../assets/shaders/screen/highpass.wgsl"),
            file_path: "screen/highpass.wgsl",
        },
        Some(Program::Blur) => ShaderSource {
            source: include_str!("../../assets/shaders/screen/blur.wgsl"),
            file_path: "screen/blur.wgsl",
        },
        Some(Program::Downsample) => ShaderSource {
            source: include_str!("../../assets/shaders/screen/downsample.wgsl"),
            file_path: "screen/downsample.wgsl",
        },
        Some(Program::Composite) => ShaderSource {
            source: include_str!("../../assets/shaders/screen/composite.wgsl"),
            file_path: "screen/composite.wgsl",
        },
    }
}

impl ShaderComposer {
    /// Create a composer with the shared modules registered.
    ///
    /// # Errors
    ///
    /// [`PostFxError::CreationFailed`] if a shared module does not parse.
    pub fn new() -> Result<Self, PostFxError> {
        let mut composer = Composer::default();
        for m in SHARED_MODULES {
            let added =
                composer.add_composable_module(ComposableModuleDescriptor {
                    source: m.source,
                    file_path: m.file_path,
                    language: ShaderLanguage::Wgsl,
                    ..Default::default()
                });
            if let Err(e) = added {
                return Err(PostFxError::creation(
                    ResourceKind::Program,
                    format!(
                        "shared module '{}': {}",
                        m.file_path,
                        e.emit_to_string(&composer)
                    ),
                ));
            }
        }
        Ok(Self { composer })
    }

    /// Compose a shader into a `naga::Module` without touching a device.
    ///
    /// # Errors
    ///
    /// The composer's diagnostic if the source or one of its imports does
    /// not compose.
    pub fn compose_naga(
        &mut self,
        shader: ShaderSource,
    ) -> Result<naga::Module, Box<ComposerError>> {
        self.composer
            .make_naga_module(NagaModuleDescriptor {
                source: shader.source,
                file_path: shader.file_path,
                shader_type: ShaderType::Wgsl,
                ..Default::default()
            })
            .map_err(Box::new)
    }

    /// Human-readable form of a composition error.
    #[must_use]
    pub fn describe(&self, error: &ComposerError) -> String {
        error.emit_to_string(&self.composer)
    }
}

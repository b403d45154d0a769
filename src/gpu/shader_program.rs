//! Shader programs used by the post-processing chain and the parameter
//! objects applied whenever one of them is enabled.

use std::fmt;
use std::str::FromStr;

use rustc_hash::{FxHashMap, FxHashSet};

use super::backend::RenderBackend;

/// The closed set of full-screen programs the pipeline binds.
///
/// Binding no program (`None` wherever an `Option<Program>` is taken)
/// selects plain texturing: the quad is drawn with the texture on unit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Program {
    /// Luminance threshold extraction (`highp`).
    HighPass,
    /// Radius-parameterised blur shared by bloom and blur chains (`blur`).
    Blur,
    /// 2x box downsample used by the luminance cascade (`down`).
    Downsample,
    /// Final exposure/bloom/blur/depth combine (`post`).
    Composite,
}

impl Program {
    /// Every program, in registration order.
    pub const ALL: [Self; 4] =
        [Self::HighPass, Self::Blur, Self::Downsample, Self::Composite];

    /// Conventional program name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::HighPass => "highp",
            Self::Blur => "blur",
            Self::Downsample => "down",
            Self::Composite => "post",
        }
    }

    /// Sampler uniform names, in texture-binding order.
    ///
    /// Each sampler reads texture unit `i` until an integer sampler uniform
    /// remaps it.
    #[must_use]
    pub const fn samplers(self) -> &'static [&'static str] {
        match self {
            Self::HighPass => &["texScene"],
            Self::Blur | Self::Downsample => &["texSource"],
            Self::Composite => &["texScene", "texBloom", "texDepth", "texBlur"],
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unknown program name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownProgram(pub String);

impl fmt::Display for UnknownProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown shader program '{}'", self.0)
    }
}

impl std::error::Error for UnknownProgram {}

impl FromStr for Program {
    type Err = UnknownProgram;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| UnknownProgram(s.to_owned()))
    }
}

/// A single uniform value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    /// Float uniform (`radius`, `size`, `exposure`, ...).
    Float(f32),
    /// Integer sampler uniform selecting a texture unit.
    Sampler(u32),
}

/// Anything that accepts uniform writes for the currently bound program.
pub trait UniformSink {
    /// Set a uniform on the currently bound program.
    fn set_uniform(&mut self, name: &'static str, value: UniformValue);
}

/// Per-program parameters pushed every time the program is enabled.
pub trait ShaderParameters {
    /// Push this object's uniforms into `sink`.
    fn apply_parameters(&self, sink: &mut dyn UniformSink);
}

/// Threshold for the bright-pass program.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HighPassParameters {
    /// Luminance below which pixels are suppressed.
    pub threshold: f32,
}

impl ShaderParameters for HighPassParameters {
    fn apply_parameters(&self, sink: &mut dyn UniformSink) {
        sink.set_uniform("threshold", UniformValue::Float(self.threshold));
    }
}

/// Output transfer parameters for the composite program.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositeParameters {
    /// Exponent applied to the final color.
    pub gamma: f32,
}

impl CompositeParameters {
    /// If the output is sRGB the hardware does gamma correction, so the
    /// exponent is 1.0. Otherwise apply `1 / display_gamma` in the shader.
    #[must_use]
    pub fn for_output(display_gamma: f32, output_is_srgb: bool) -> Self {
        let gamma = if output_is_srgb || display_gamma <= 0.0 {
            1.0
        } else {
            1.0 / display_gamma
        };
        Self { gamma }
    }
}

impl ShaderParameters for CompositeParameters {
    fn apply_parameters(&self, sink: &mut dyn UniformSink) {
        sink.set_uniform("gamma", UniformValue::Float(self.gamma));
    }
}

/// Enables programs and applies their registered parameter objects.
#[derive(Default)]
pub struct ShaderBindings {
    parameters: FxHashMap<Program, Box<dyn ShaderParameters>>,
    reported_unavailable: FxHashSet<Program>,
}

impl ShaderBindings {
    /// Empty bindings with no parameter objects.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the parameter object for `program`.
    pub fn register(
        &mut self,
        program: Program,
        parameters: Box<dyn ShaderParameters>,
    ) {
        let _ = self.parameters.insert(program, parameters);
    }

    /// Bind `program` (or plain texturing for `None`) and apply its
    /// parameters.
    pub fn enable<B: RenderBackend>(
        &self,
        backend: &mut B,
        program: Option<Program>,
    ) {
        backend.bind_program(program);
        if let Some(params) = program.and_then(|p| self.parameters.get(&p)) {
            params.apply_parameters(backend);
        }
    }

    /// Log, once per session, that `program` is unusable and its passes
    /// are being skipped.
    pub(crate) fn report_unavailable(&mut self, program: Program) {
        if self.reported_unavailable.insert(program) {
            log::warn!(
                "shader program '{program}' is unavailable; its passes forward \
                 their input unmodified"
            );
        }
    }
}

impl fmt::Debug for ShaderBindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut programs: Vec<_> = self.parameters.keys().copied().collect();
        programs.sort();
        f.debug_struct("ShaderBindings")
            .field("parameterised", &programs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Captured(Vec<(&'static str, UniformValue)>);

    impl UniformSink for Captured {
        fn set_uniform(&mut self, name: &'static str, value: UniformValue) {
            self.0.push((name, value));
        }
    }

    #[test]
    fn program_names_parse_back() {
        for program in Program::ALL {
            assert_eq!(program.name().parse::<Program>(), Ok(program));
        }
        assert!("chunk".parse::<Program>().is_err());
    }

    #[test]
    fn composite_gamma_depends_on_output_encoding() {
        assert_eq!(CompositeParameters::for_output(2.2, true).gamma, 1.0);
        let linear = CompositeParameters::for_output(2.0, false);
        assert!((linear.gamma - 0.5).abs() < 1e-6);
    }

    #[test]
    fn parameters_push_their_uniforms() {
        let mut sink = Captured::default();
        HighPassParameters { threshold: 0.8 }.apply_parameters(&mut sink);
        CompositeParameters { gamma: 1.0 }.apply_parameters(&mut sink);
        assert_eq!(
            sink.0,
            vec![
                ("threshold", UniformValue::Float(0.8)),
                ("gamma", UniformValue::Float(1.0)),
            ]
        );
    }

    #[test]
    fn composite_samplers_follow_unit_layout() {
        assert_eq!(
            Program::Composite.samplers(),
            &["texScene", "texBloom", "texDepth", "texBlur"]
        );
    }
}

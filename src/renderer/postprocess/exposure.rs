//! Eye adaptation driven by the 1x1 stage of the downsample cascade.

use web_time::Instant;

use crate::error::PostFxError;
use crate::gpu::backend::{RenderBackend, TextureHandle};
use crate::options::ExposureReadback;

/// Upper bound on the smoothed exposure.
pub const MAX_EXPOSURE: f32 = 5.0;
/// Fraction of the way the exposure moves toward its target per update.
pub const EXPOSURE_SMOOTHING: f32 = 0.01;
/// Luminance the exposure tries to map the scene average onto.
pub const TARGET_LUMINANCE: f32 = 0.5;

/// Rec. 709 luma of an RGBA texel.
#[must_use]
pub fn luminance(texel: [f32; 4]) -> f32 {
    0.2126 * texel[0] + 0.7152 * texel[1] + 0.0722 * texel[2]
}

/// Smoothed exposure scalar consumed by the composite pass.
#[derive(Debug, Clone)]
pub struct ExposureController {
    exposure: f32,
    readback: ExposureReadback,
}

impl ExposureController {
    /// Start at `initial` (clamped to `[0, MAX_EXPOSURE]`).
    #[must_use]
    pub fn new(initial: f32, readback: ExposureReadback) -> Self {
        let exposure = if initial.is_finite() {
            initial.clamp(0.0, MAX_EXPOSURE)
        } else {
            0.0
        };
        Self { exposure, readback }
    }

    /// Current smoothed exposure.
    #[must_use]
    pub fn exposure(&self) -> f32 {
        self.exposure
    }

    /// How the luminance texel is fetched.
    #[must_use]
    pub fn readback(&self) -> ExposureReadback {
        self.readback
    }

    /// Move the exposure one smoothing step toward
    /// `TARGET_LUMINANCE / luminance`.
    ///
    /// Non-positive and NaN luminance leave the exposure untouched.
    pub fn apply_sample(&mut self, luminance: f32) {
        if luminance.is_nan() || luminance <= 0.0 {
            return;
        }
        let target = TARGET_LUMINANCE / luminance;
        self.exposure += (target - self.exposure) * EXPOSURE_SMOOTHING;
        if self.exposure > MAX_EXPOSURE {
            self.exposure = MAX_EXPOSURE;
        }
    }

    /// Sample `texel_source` and fold the result into the exposure.
    ///
    /// In [`ExposureReadback::Delayed`] mode the sample folded in is the
    /// one requested on the previous call, and a new copy is started.
    ///
    /// # Errors
    ///
    /// [`PostFxError::Readback`] if the texel cannot be read.
    pub fn update<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        texel_source: TextureHandle,
    ) -> Result<(), PostFxError> {
        match self.readback {
            ExposureReadback::Blocking => {
                let texel =
                    read_luminance_texel_blocking(backend, texel_source)?;
                self.apply_sample(luminance(texel));
            }
            ExposureReadback::Delayed => {
                if let Some(texel) = backend.poll_texel_readback()? {
                    self.apply_sample(luminance(texel));
                }
                backend.begin_texel_readback(texel_source)?;
            }
        }
        Ok(())
    }
}

/// Read texel (0,0) of `texture`, waiting for the GPU.
///
/// This is the one synchronization point of a frame: everything queued so
/// far has to finish before the copy can be mapped.
///
/// # Errors
///
/// [`PostFxError::Readback`] if the copy or map fails.
pub fn read_luminance_texel_blocking<B: RenderBackend + ?Sized>(
    backend: &mut B,
    texture: TextureHandle,
) -> Result<[f32; 4], PostFxError> {
    let start = Instant::now();
    let texel = backend.read_texel(texture)?;
    log::trace!(
        "luminance readback stalled {:.3} ms",
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(texel)
}

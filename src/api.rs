//! High-level convenience API
use mzpeaks::prelude::*;

use crate::config::{ConfigError, DeconvolverConfig};
use crate::deconvoluter::{DummyMode, SpectralDeconvoluter, SpectrumInput};
use crate::solution::DeconvolvedSpectrum;

/// Deconvolute a single centroided MS1 peak list in one call.
///
/// This builds a fresh engine, including its averagine table, on every
/// invocation. When deconvoluting many spectra, build one
/// [`SpectralDeconvoluter`] and reuse it instead.
pub fn deconvolute_peaks<C: CentroidLike>(
    peaks: &[C],
    config: DeconvolverConfig,
) -> Result<DeconvolvedSpectrum, ConfigError> {
    let engine = SpectralDeconvoluter::new(config)?;
    let input = SpectrumInput::new(peaks, 0, 1);
    Ok(engine.deconvolute_spectrum(&input, DummyMode::None))
}

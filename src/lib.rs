//! FLASH-style charge state deconvolution of top-down mass spectra.
//!
//! Given a centroided spectrum of (m/z, intensity) pairs, this crate
//! reconstructs the neutral monoisotopic masses and charge envelopes that
//! produced the observed peaks. Every observed peak is mapped into a
//! logarithmic m/z bin lattice where each charge state becomes a constant
//! integer offset, candidate masses are validated by isotope-pattern cosine
//! against a precomputed averagine model, and multi-pass filtering removes
//! harmonic aliases, charge errors and overlapping duplicates.
//!
//! ```rust
//! use mzflash::{deconvolute_peaks, DeconvolverConfig};
//! use mzpeaks::CentroidPeak;
//!
//! let peaks: Vec<CentroidPeak> = vec![/* centroided peaks */];
//! let config = DeconvolverConfig {
//!     min_charge: 1,
//!     max_charge: 20,
//!     ..Default::default()
//! };
//! let deconvolved = deconvolute_peaks(&peaks, config).unwrap();
//! for peak_group in deconvolved.iter() {
//!     let _ = (peak_group.mono_mass(), peak_group.abs_charge_range());
//! }
//! ```
pub mod api;
pub mod averagine;
pub mod binning;
pub mod config;
pub mod deconvoluter;
pub mod dedup;
pub mod peak_group;
pub mod peaks;
pub mod scorer;
pub mod solution;

pub use crate::api::deconvolute_peaks;
pub use crate::averagine::PrecalculatedAveragine;
pub use crate::config::{ConfigError, DeconvolverConfig};
pub use crate::deconvoluter::{DummyMode, SpectralDeconvoluter, SpectrumInput};
pub use crate::peak_group::{DummyKind, PeakGroup};
pub use crate::peaks::{LogMzPeak, NEUTRON_SHIFT, PROTON};
pub use crate::solution::DeconvolvedSpectrum;

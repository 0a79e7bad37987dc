//! Deconvolution configuration
//!
//! All tunables live in one immutable [`DeconvolverConfig`] constructed up
//! front; derived constants (bin scales, charge filters) are computed from it
//! when the engine is built, never mutated afterwards.
use thiserror::Error;
use tracing::warn;

/// Internal bins are this factor narrower than the configured ppm tolerance.
/// The full tolerance is re-applied during overlap removal.
pub const TOL_DIV_FACTOR: f64 = 2.5;

/// Charges at or below this value are deconvolved by isotope-neighbor
/// support rather than charge continuity.
pub const LOW_CHARGE: i32 = 10;

/// Harmonic charge factors probed for harmonic mass reduction
pub const HARMONIC_CHARGES: [i32; 5] = [2, 3, 5, 7, 11];

/// A group sharing a peak survives charge-error removal only if its
/// per-charge SNR beats the competitor by this fold. Empirical contract
/// value, kept as-is.
pub const CHARGE_SNR_FOLD: f32 = 2.0;

/// Overlap removal windows are the internal tolerance widened by
/// `TOL_DIV_FACTOR * OVERLAP_WINDOW_FACTOR`. Empirical contract value.
pub const OVERLAP_WINDOW_FACTOR: f64 = 1.5;

/// An observed isotope vector must cover at least this many isotopes for a
/// cosine score to be meaningful.
pub const MIN_ISO_SIZE: usize = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one per-MS-level ppm tolerance is required")]
    EmptyToleranceList,
    #[error("at least one per-MS-level isotope cosine threshold is required")]
    EmptyCosineList,
    #[error("mass bounds must be positive, got [{0}, {1}]")]
    NonPositiveMass(f64, f64),
    #[error("charge states must be non-zero")]
    ZeroCharge,
    #[error("charge states must share one polarity, got [{0}, {1}]")]
    MixedPolarity(i32, i32),
}

/// The tunable parameters of one deconvolution run.
///
/// Inverted min/max pairs are normalized (swapped) rather than rejected;
/// only structurally unusable input produces a [`ConfigError`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeconvolverConfig {
    /// ppm tolerance per MS level (index 0 is MS1)
    pub tolerance_ppm: Vec<f64>,
    /// Minimum isotope cosine per MS level (index 0 is MS1)
    pub min_isotope_cosine: Vec<f64>,
    pub min_mass: f64,
    pub max_mass: f64,
    /// Signed charge bounds; negative values select negative ionization mode
    pub min_charge: i32,
    pub max_charge: i32,
    pub min_mz: Option<f64>,
    pub max_mz: Option<f64>,
    pub min_rt: Option<f64>,
    pub max_rt: Option<f64>,
    /// Peaks at or below this intensity are dropped before binning
    pub min_intensity: f32,
    /// Isotope index errors within this bound are not counted against a match
    pub allowed_isotope_error: i32,
    /// SNR floor applied to non-targeted peak groups
    pub min_snr: f32,
    /// Support peaks required before a mass bin is accepted
    pub min_support_peak_count: u32,
    /// Half width of the precursor isolation window, in Th
    pub isolation_window: f64,
    /// Worker threads for candidate scoring; 1 disables the thread pool
    pub worker_threads: usize,
}

impl Default for DeconvolverConfig {
    fn default() -> Self {
        Self {
            tolerance_ppm: vec![10.0, 10.0],
            min_isotope_cosine: vec![0.8, 0.8],
            min_mass: 50.0,
            max_mass: 100_000.0,
            min_charge: 1,
            max_charge: 100,
            min_mz: None,
            max_mz: None,
            min_rt: None,
            max_rt: None,
            min_intensity: 0.0,
            allowed_isotope_error: 1,
            min_snr: 0.5,
            min_support_peak_count: 3,
            isolation_window: 3.0,
            worker_threads: 1,
        }
    }
}

impl DeconvolverConfig {
    /// Normalize the configuration, swapping inverted ranges, and reject
    /// structurally unusable values.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.tolerance_ppm.is_empty() {
            return Err(ConfigError::EmptyToleranceList);
        }
        if self.min_isotope_cosine.is_empty() {
            return Err(ConfigError::EmptyCosineList);
        }
        if self.min_charge == 0 || self.max_charge == 0 {
            return Err(ConfigError::ZeroCharge);
        }
        if self.min_charge.signum() != self.max_charge.signum() {
            return Err(ConfigError::MixedPolarity(self.min_charge, self.max_charge));
        }
        if self.max_mass <= 0.0 || self.min_mass <= 0.0 {
            return Err(ConfigError::NonPositiveMass(self.min_mass, self.max_mass));
        }
        if self.min_charge.abs() > self.max_charge.abs() {
            warn!(
                "charge range [{}, {}] is inverted, swapping",
                self.min_charge, self.max_charge
            );
            std::mem::swap(&mut self.min_charge, &mut self.max_charge);
        }
        if self.min_mass > self.max_mass {
            warn!(
                "mass range [{}, {}] is inverted, swapping",
                self.min_mass, self.max_mass
            );
            std::mem::swap(&mut self.min_mass, &mut self.max_mass);
        }
        if let (Some(lo), Some(hi)) = (self.min_mz, self.max_mz) {
            if lo > hi {
                warn!("m/z range [{lo}, {hi}] is inverted, swapping");
                (self.min_mz, self.max_mz) = (Some(hi), Some(lo));
            }
        }
        if let (Some(lo), Some(hi)) = (self.min_rt, self.max_rt) {
            if lo > hi {
                warn!("RT range [{lo}, {hi}] is inverted, swapping");
                (self.min_rt, self.max_rt) = (Some(hi), Some(lo));
            }
        }
        Ok(self)
    }

    /// Whether the run is in positive ionization mode
    #[inline]
    pub fn is_positive(&self) -> bool {
        self.min_charge > 0
    }

    #[inline]
    pub fn min_abs_charge(&self) -> i32 {
        self.min_charge.abs()
    }

    #[inline]
    pub fn max_abs_charge(&self) -> i32 {
        self.max_charge.abs()
    }

    /// The fractional mass tolerance for an MS level, clamped to the last
    /// configured level
    #[inline]
    pub fn tol(&self, ms_level: u8) -> f64 {
        let i = (ms_level.max(1) as usize - 1).min(self.tolerance_ppm.len() - 1);
        self.tolerance_ppm[i] * 1e-6
    }

    /// The narrowed tolerance used for internal binning
    #[inline]
    pub fn internal_tol(&self, ms_level: u8) -> f64 {
        self.tol(ms_level) / TOL_DIV_FACTOR
    }

    /// Bins per unit of log m/z
    #[inline]
    pub fn bin_scale(&self, ms_level: u8) -> f64 {
        1.0 / self.internal_tol(ms_level)
    }

    #[inline]
    pub fn min_cosine(&self, ms_level: u8) -> f64 {
        let i = (ms_level.max(1) as usize - 1).min(self.min_isotope_cosine.len() - 1);
        self.min_isotope_cosine[i]
    }
}

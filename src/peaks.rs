//! Observation types for the log-m/z peak lattice
use std::cmp::Ordering;

use mzpeaks::prelude::*;

#[doc(hidden)]
pub use chemical_elements::PROTON;

/// The mass difference between isotopes `C[13]` and `C[12]`. Not precisely universal, but the
/// majority of expected applications are carbon-based
pub const NEUTRON_SHIFT: f64 = 1.0033548378;

/// The mass of the charge carrier, signed by ionization polarity
#[inline(always)]
pub fn charge_carrier_mass(positive: bool) -> f64 {
    if positive {
        PROTON
    } else {
        -PROTON
    }
}

/// Convert an observed m/z to the log of its uncharged equivalent, removing
/// one charge carrier. All bin arithmetic downstream operates on this value.
#[inline(always)]
pub fn log_mz(mz: f64, positive: bool) -> f64 {
    (mz - charge_carrier_mass(positive)).ln()
}

/// Calculate the nominal (integer) mass from a monoisotopic mass. The scaling constant
/// compensates for the average mass defect per nominal unit.
#[inline]
pub fn nominal_mass(mass: f64) -> i32 {
    (mass * 0.999497 + 0.5) as i32
}

/// A single observed (m/z, intensity) pair carrying its log-m/z transform and,
/// once assigned, the absolute charge and isotope index it was attributed to.
///
/// The m/z and intensity are immutable once taken from the input spectrum;
/// `abs_charge` and `isotope_index` are filled in during candidate building.
#[derive(Debug, Default, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogMzPeak {
    pub mz: f64,
    pub intensity: f32,
    pub log_mz: f64,
    pub abs_charge: i32,
    pub isotope_index: i32,
}

impl LogMzPeak {
    pub fn new<C: CentroidLike>(peak: &C, positive: bool) -> Self {
        Self {
            mz: peak.mz(),
            intensity: peak.intensity(),
            log_mz: log_mz(peak.mz(), positive),
            abs_charge: 0,
            isotope_index: -1,
        }
    }

    pub fn from_parts(mz: f64, intensity: f32, positive: bool) -> Self {
        Self {
            mz,
            intensity,
            log_mz: log_mz(mz, positive),
            abs_charge: 0,
            isotope_index: -1,
        }
    }

    /// The neutral mass implied by this peak's assigned charge, ignoring
    /// its isotope index.
    ///
    /// # Panics
    /// If no charge has been assigned yet.
    #[inline]
    pub fn uncharged_mass(&self) -> f64 {
        assert!(self.abs_charge > 0, "peak charge must be assigned and positive");
        self.log_mz.exp() * self.abs_charge as f64
    }
}

impl PartialEq for LogMzPeak {
    fn eq(&self, other: &Self) -> bool {
        self.log_mz == other.log_mz
            && self.intensity == other.intensity
            && self.abs_charge == other.abs_charge
            && self.isotope_index == other.isotope_index
    }
}

impl PartialOrd for LogMzPeak {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(
            self.log_mz
                .total_cmp(&other.log_mz)
                .then_with(|| self.intensity.total_cmp(&other.intensity)),
        )
    }
}

//! A precomputed averagine isotope envelope table over neutral mass
//!
//! Candidate masses are validated by comparing their observed per-isotope
//! intensity vectors against the theoretical envelope an "average monomer"
//! of the same mass would produce. The table is built once per configuration
//! and shared read-only across all scoring threads.
use chemical_elements::isotopic_pattern::{
    BafflingRecursiveIsotopicPatternGenerator, TheoreticalIsotopicPattern,
};
use chemical_elements::{ChemicalComposition, ElementSpecification};

use mzpeaks::prelude::*;
use tracing::trace;

use crate::peaks::{NEUTRON_SHIFT, PROTON};

/// Senko's averagine composition for peptides, per residue
const AVERAGINE_COMPOSITION: [(&str, f64); 5] = [
    ("H", 7.7583),
    ("C", 4.9384),
    ("S", 0.0417),
    ("O", 1.4773),
    ("N", 1.3577),
];

/// Isotope peaks below this fraction of the apex intensity do not count
/// toward the envelope span around the apex.
const SPAN_INTENSITY_FRACTION: f32 = 0.01;

/// One precomputed envelope: normalized isotope intensities plus the derived
/// apex statistics used to bound search windows.
#[derive(Debug, Clone)]
struct AveragineEntry {
    /// Relative isotope intensities with unit Euclidean norm, so cosine
    /// scoring needs to normalize only the observed vector
    intensities: Vec<f32>,
    apex_index: usize,
    left_count: usize,
    right_count: usize,
    /// Intensity-weighted mean isotope offset from the monoisotope, in Da
    average_mass_delta: f64,
}

impl AveragineEntry {
    fn from_pattern(pattern: &TheoreticalIsotopicPattern) -> Self {
        let norm: f32 = pattern
            .iter()
            .map(|p| p.intensity() * p.intensity())
            .sum::<f32>()
            .sqrt();
        let intensities: Vec<f32> = pattern
            .iter()
            .map(|p| p.intensity() / norm.max(f32::MIN_POSITIVE))
            .collect();

        let (apex_index, apex_intensity) = intensities
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap_or((0, 0.0));

        let floor = apex_intensity * SPAN_INTENSITY_FRACTION;
        let first = intensities.iter().position(|i| *i >= floor).unwrap_or(0);
        let last = intensities
            .iter()
            .rposition(|i| *i >= floor)
            .unwrap_or(intensities.len().saturating_sub(1));

        let weight: f64 = intensities.iter().map(|y| *y as f64).sum();
        let average_mass_delta = intensities
            .iter()
            .enumerate()
            .map(|(i, y)| i as f64 * NEUTRON_SHIFT * *y as f64)
            .sum::<f64>()
            / weight.max(f64::MIN_POSITIVE);

        Self {
            intensities,
            apex_index,
            left_count: apex_index - first,
            right_count: last - apex_index,
            average_mass_delta,
        }
    }
}

/// An immutable lookup table mapping a neutral mass to the normalized
/// theoretical isotope distribution of an averagine molecule of that mass.
///
/// Masses outside the precomputed range clamp to the nearest bucket. The
/// table has no interior mutability and may be shared freely between
/// scoring threads.
#[derive(Debug, Clone)]
pub struct PrecalculatedAveragine {
    entries: Vec<AveragineEntry>,
    mass_interval: f64,
    min_mass: f64,
    max_isotope_index: usize,
}

impl PrecalculatedAveragine {
    /// Build the table from `min_mass` to `max_mass` in steps of `mass_interval` Da.
    ///
    /// # Panics
    /// If `max_mass <= min_mass` or `mass_interval <= 0`; these indicate a
    /// caller bug, not a data condition.
    pub fn new(min_mass: f64, max_mass: f64, mass_interval: f64) -> Self {
        assert!(
            max_mass > min_mass && mass_interval > 0.0,
            "averagine table bounds must be ordered and the interval positive"
        );
        let base_composition: Vec<(ElementSpecification, f64)> = AVERAGINE_COMPOSITION
            .iter()
            .map(|(e, c)| {
                (
                    e.parse()
                        .expect("Failed to parse element specification"),
                    *c,
                )
            })
            .collect();
        let base_mass: f64 = base_composition
            .iter()
            .map(|(e, c)| e.element.most_abundant_mass * *c)
            .sum();
        let hydrogen: ElementSpecification = "H".parse().unwrap();

        let mut generator = BafflingRecursiveIsotopicPatternGenerator::new();
        let mut entries = Vec::with_capacity(((max_mass - min_mass) / mass_interval) as usize + 1);
        let mut max_isotope_index = 0;

        let mut mass = min_mass;
        while mass <= max_mass {
            let scale = mass / base_mass;
            let mut scaled = ChemicalComposition::new();
            for (elt, count) in base_composition.iter() {
                scaled.set(*elt, (*count * scale).round().max(1.0) as i32);
            }
            // nudge hydrogen count so the scaled composition lands on the requested mass
            let delta = (scaled.mass() - mass).round() as i32;
            let hydrogens = scaled[&hydrogen];
            if hydrogens > delta {
                scaled[&hydrogen] -= delta;
            } else {
                scaled[&hydrogen] = 0;
            }

            let peaks = generator.isotopic_variants(scaled, 0, 1, PROTON);
            let pattern = TheoreticalIsotopicPattern::from(peaks)
                .truncate_after(0.9999)
                .ignore_below(1e-6);
            let entry = AveragineEntry::from_pattern(&pattern);
            max_isotope_index = max_isotope_index.max(entry.intensities.len());
            entries.push(entry);
            mass += mass_interval;
        }
        trace!(
            "Precalculated {} averagine envelopes up to {max_mass} Da",
            entries.len()
        );
        Self {
            entries,
            mass_interval,
            min_mass,
            max_isotope_index,
        }
    }

    #[inline]
    fn index_for(&self, mass: f64) -> usize {
        let i = ((mass - self.min_mass) / self.mass_interval + 0.5).max(0.0) as usize;
        i.min(self.entries.len() - 1)
    }

    /// The theoretical isotope intensity distribution for `mass`, with unit
    /// Euclidean norm
    pub fn get(&self, mass: f64) -> &[f32] {
        &self.entries[self.index_for(mass)].intensities
    }

    /// The index of the most abundant isotope for `mass`
    pub fn apex_index(&self, mass: f64) -> usize {
        self.entries[self.index_for(mass)].apex_index
    }

    /// How many isotopes below the apex still carry meaningful signal
    pub fn left_count_from_apex(&self, mass: f64) -> usize {
        self.entries[self.index_for(mass)].left_count
    }

    /// How many isotopes above the apex still carry meaningful signal
    pub fn right_count_from_apex(&self, mass: f64) -> usize {
        self.entries[self.index_for(mass)].right_count
    }

    /// The intensity-weighted average offset from the monoisotopic mass, in Da
    pub fn average_mass_delta(&self, mass: f64) -> f64 {
        self.entries[self.index_for(mass)].average_mass_delta
    }

    /// The offset from the monoisotopic mass to the apex isotope, in Da
    pub fn most_abundant_mass_delta(&self, mass: f64) -> f64 {
        self.entries[self.index_for(mass)].apex_index as f64 * NEUTRON_SHIFT
    }

    /// The widest isotope count over all precomputed envelopes
    pub fn max_isotope_index(&self) -> usize {
        self.max_isotope_index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_build_and_clamp() {
        let avg = PrecalculatedAveragine::new(50.0, 5000.0, 100.0);
        assert!(!avg.is_empty());
        // clamped lookups do not panic
        let low = avg.get(1.0);
        let high = avg.get(1e9);
        assert!(!low.is_empty());
        assert!(!high.is_empty());
    }

    #[test]
    fn test_normalized() {
        let avg = PrecalculatedAveragine::new(50.0, 5000.0, 100.0);
        let norm: f32 = avg.get(5000.0).iter().map(|i| i * i).sum();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_apex_grows_with_mass() {
        let avg = PrecalculatedAveragine::new(50.0, 20000.0, 500.0);
        // small molecules are monoisotope-dominated, large ones are not
        assert_eq!(avg.apex_index(100.0), 0);
        assert!(avg.apex_index(20000.0) > 5);
        assert!(avg.most_abundant_mass_delta(20000.0) > 5.0);
    }

    #[test]
    fn test_span_bounds() {
        let avg = PrecalculatedAveragine::new(50.0, 10000.0, 100.0);
        let mass = 5000.0;
        let apex = avg.apex_index(mass);
        assert!(avg.left_count_from_apex(mass) <= apex);
        assert!(apex + avg.right_count_from_apex(mass) < avg.get(mass).len());
        assert!(avg.average_mass_delta(mass) > 0.0);
    }
}

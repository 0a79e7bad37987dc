//! A candidate neutral mass and the observed peaks attributed to it
use std::collections::BTreeMap;

use crate::averagine::PrecalculatedAveragine;
use crate::peaks::{charge_carrier_mass, nominal_mass, LogMzPeak};
use crate::scorer;

/// How a peak group entered the pipeline: as a genuine candidate or through
/// one of the null-model perturbations used for FDR estimation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DummyKind {
    #[default]
    None,
    /// Built from mass regions excluded around previously deconvolved masses
    Charge,
    /// Built with a nonsensical isotope spacing from leftover peaks
    Noise,
    /// Scored at the runner-up isotope offset instead of the best
    Isotope,
}

/// Per-charge scoring state of one peak group
#[derive(Debug, Default, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PerChargeState {
    pub snr: f32,
    pub cosine: f32,
    pub intensity: f32,
    pub max_intensity: f32,
}

/// One candidate neutral monoisotopic mass with its assigned peaks, built
/// empty per mass bin, populated by isotope-window recruitment, then scored.
///
/// Member peaks must be mutually consistent with a single neutral mass
/// within tolerance once ungapped by isotope index and charge; recruitment
/// and the mono mass update enforce this.
#[derive(Debug, Default, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeakGroup {
    peaks: Vec<LogMzPeak>,
    min_abs_charge: i32,
    max_abs_charge: i32,
    positive: bool,
    iso_da_distance: f64,
    monoisotopic_mass: f64,
    intensity: f32,
    per_isotope_intensities: Vec<f32>,
    per_charge: BTreeMap<i32, PerChargeState>,
    isotope_cosine: f32,
    charge_cosine: f32,
    snr: f32,
    qscore: f32,
    rep_abs_charge: i32,
    targeted: bool,
    dummy: DummyKind,
}

impl PeakGroup {
    /// An empty group spanning the inclusive absolute charge range.
    ///
    /// # Panics
    /// If the range is empty or not strictly positive; absolute charges are
    /// required regardless of ionization polarity.
    pub fn new(min_abs_charge: i32, max_abs_charge: i32, positive: bool) -> Self {
        assert!(
            min_abs_charge > 0 && min_abs_charge <= max_abs_charge,
            "peak group charge range [{min_abs_charge}, {max_abs_charge}] must be positive and ordered"
        );
        Self {
            min_abs_charge,
            max_abs_charge,
            positive,
            monoisotopic_mass: -1.0,
            ..Default::default()
        }
    }

    pub fn push(&mut self, peak: LogMzPeak) {
        self.peaks.push(peak);
    }

    pub fn reserve(&mut self, n: usize) {
        self.peaks.reserve(n);
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LogMzPeak> {
        self.peaks.iter()
    }

    pub fn peaks(&self) -> &[LogMzPeak] {
        &self.peaks
    }

    pub fn set_peaks(&mut self, peaks: Vec<LogMzPeak>) {
        self.peaks = peaks;
    }

    #[inline]
    pub fn mono_mass(&self) -> f64 {
        self.monoisotopic_mass
    }

    pub fn nominal_mass(&self) -> i32 {
        nominal_mass(self.monoisotopic_mass)
    }

    #[inline]
    pub fn intensity(&self) -> f32 {
        self.intensity
    }

    #[inline]
    pub fn isotope_cosine(&self) -> f32 {
        self.isotope_cosine
    }

    pub fn set_isotope_cosine(&mut self, cosine: f32) {
        self.isotope_cosine = cosine;
    }

    #[inline]
    pub fn charge_cosine(&self) -> f32 {
        self.charge_cosine
    }

    #[inline]
    pub fn snr(&self) -> f32 {
        self.snr
    }

    #[inline]
    pub fn qscore(&self) -> f32 {
        self.qscore
    }

    /// The SNR of one charge, 0 if the charge carries no signal
    pub fn charge_snr(&self, abs_charge: i32) -> f32 {
        self.per_charge.get(&abs_charge).map(|s| s.snr).unwrap_or(0.0)
    }

    pub fn charge_state(&self, abs_charge: i32) -> Option<&PerChargeState> {
        self.per_charge.get(&abs_charge)
    }

    /// Inclusive absolute charge range
    pub fn abs_charge_range(&self) -> (i32, i32) {
        (self.min_abs_charge, self.max_abs_charge)
    }

    /// The charge with the best Qscore
    #[inline]
    pub fn rep_abs_charge(&self) -> i32 {
        self.rep_abs_charge
    }

    pub fn is_positive(&self) -> bool {
        self.positive
    }

    pub fn is_targeted(&self) -> bool {
        self.targeted
    }

    pub fn set_targeted(&mut self) {
        self.targeted = true;
    }

    pub fn dummy_kind(&self) -> DummyKind {
        self.dummy
    }

    pub fn set_dummy_kind(&mut self, kind: DummyKind) {
        self.dummy = kind;
    }

    pub fn iso_da_distance(&self) -> f64 {
        self.iso_da_distance
    }

    pub fn set_iso_da_distance(&mut self, distance: f64) {
        self.iso_da_distance = distance;
    }

    pub fn per_isotope_intensities(&self) -> &[f32] {
        &self.per_isotope_intensities
    }

    /// Recompute the monoisotopic mass, total intensity, per-isotope
    /// intensity vector and observed charge range from the member peaks.
    ///
    /// The mono mass is anchored on the most intense member peak, offset by
    /// its isotope index.
    pub fn update_mono_mass_and_isotope_intensities(&mut self) {
        if self.peaks.is_empty() {
            return;
        }
        let max_isotope_index = self
            .peaks
            .iter()
            .map(|p| p.isotope_index)
            .max()
            .unwrap_or(0)
            .max(0);
        self.per_isotope_intensities = vec![0.0; max_isotope_index as usize + 1];
        self.intensity = 0.0;

        let mut max_intensity = -1.0f32;
        let mut min_z = i32::MAX;
        let mut max_z = i32::MIN;
        for p in &self.peaks {
            self.intensity += p.intensity;
            if p.isotope_index >= 0 {
                self.per_isotope_intensities[p.isotope_index as usize] += p.intensity;
            }
            min_z = min_z.min(p.abs_charge);
            max_z = max_z.max(p.abs_charge);
            if max_intensity < p.intensity {
                max_intensity = p.intensity;
                self.monoisotopic_mass =
                    p.uncharged_mass() - p.isotope_index as f64 * self.iso_da_distance;
            }
        }
        self.min_abs_charge = min_z;
        self.max_abs_charge = max_z;
    }

    /// Rebuild the member peak list from the whole spectrum around the mass
    /// hypothesis `mono_mass`: every spectrum peak landing on an isotope
    /// position of some charge within `tol` (fractional) is recruited, and
    /// in-window peaks that match no isotope position are returned as the
    /// noise set for SNR estimation. `excluded_mzs` must be sorted.
    pub fn recruit_peaks(
        &mut self,
        spectrum: &[LogMzPeak],
        tol: f64,
        avg: &PrecalculatedAveragine,
        mono_mass: f64,
        excluded_mzs: &[f64],
    ) -> Vec<LogMzPeak> {
        self.peaks.clear();
        let mut noisy = Vec::new();
        if mono_mass <= 0.0 {
            return noisy;
        }
        let isotope_count = avg.get(mono_mass).len() as i32;
        let carrier = charge_carrier_mass(self.positive);

        for z in self.min_abs_charge..=self.max_abs_charge {
            let cz = z as f64;
            let mz_start = (mono_mass - self.iso_da_distance) / cz + carrier;
            let mz_end = (mono_mass + isotope_count as f64 * self.iso_da_distance) / cz + carrier;
            let begin = spectrum.partition_point(|p| p.mz < mz_start);
            for p in &spectrum[begin..] {
                if p.mz > mz_end {
                    break;
                }
                if excluded_mzs
                    .binary_search_by(|m| m.total_cmp(&p.mz))
                    .is_ok()
                {
                    continue;
                }
                let mass = (p.mz - carrier) * cz;
                let isotope_index = ((mass - mono_mass) / self.iso_da_distance).round() as i32;
                let expected = mono_mass + isotope_index as f64 * self.iso_da_distance;
                let mut q = *p;
                q.abs_charge = z;
                if isotope_index >= 0
                    && isotope_index < isotope_count
                    && (mass - expected).abs() <= tol * mono_mass
                {
                    q.isotope_index = isotope_index;
                    self.peaks.push(q);
                } else {
                    noisy.push(q);
                }
            }
        }
        noisy
    }

    /// Re-score the group after recruitment: isotope cosine and offset,
    /// per-charge cosine and SNR (noise power taken from `noisy_peaks`),
    /// total SNR, charge-fit cosine and Qscore.
    ///
    /// Returns the isotope offset correction; a non-zero value means the
    /// caller should shift the mass hypothesis and recruit again before the
    /// scores are meaningful.
    pub fn update_qscore(
        &mut self,
        noisy_peaks: &[LogMzPeak],
        avg: &PrecalculatedAveragine,
    ) -> i32 {
        self.update_mono_mass_and_isotope_intensities();
        if self.peaks.is_empty() || self.monoisotopic_mass <= 0.0 {
            return 0;
        }

        let (cos, offset) = scorer::isotope_cosine_and_offset(
            self.monoisotopic_mass,
            &self.per_isotope_intensities,
            avg,
            None,
            None,
        );
        self.isotope_cosine = cos;
        if offset != 0 {
            return offset;
        }

        let iso = avg.get(self.monoisotopic_mass);
        let mut total_signal = 0.0f32;
        let mut total_noise = 0.0f32;
        let charge_span = (self.max_abs_charge - self.min_abs_charge + 1) as usize;
        let mut per_charge_intensity = vec![0.0f32; charge_span];
        self.per_charge.clear();

        let mut charge_isotopes = vec![0.0f32; self.per_isotope_intensities.len()];
        for z in self.min_abs_charge..=self.max_abs_charge {
            charge_isotopes.fill(0.0);
            let mut sum_intensity = 0.0f32;
            let mut max_intensity = 0.0f32;
            let mut min_isotope_index = charge_isotopes.len();
            let mut max_isotope_index = 0usize;
            for p in self.peaks.iter().filter(|p| p.abs_charge == z) {
                let i = p.isotope_index as usize;
                if i >= charge_isotopes.len() {
                    continue;
                }
                charge_isotopes[i] += p.intensity;
                sum_intensity += p.intensity;
                max_intensity = max_intensity.max(p.intensity);
                min_isotope_index = min_isotope_index.min(i);
                max_isotope_index = max_isotope_index.max(i);
            }
            if max_intensity <= 0.0 {
                continue;
            }

            let signal_power: f32 = charge_isotopes[min_isotope_index..=max_isotope_index]
                .iter()
                .map(|y| y * y)
                .sum();
            let cos_z = scorer::cosine(
                &charge_isotopes,
                min_isotope_index,
                max_isotope_index + 1,
                iso,
                0,
                0,
            );
            let cos2 = cos_z * cos_z;
            let noise_power: f32 = noisy_peaks
                .iter()
                .filter(|p| p.abs_charge == z)
                .map(|p| p.intensity * p.intensity)
                .sum();

            let signal = cos2 * signal_power + 1.0;
            let noise = (1.0 - cos2) * signal_power + noise_power + 1.0;
            per_charge_intensity[(z - self.min_abs_charge) as usize] = sum_intensity;
            self.per_charge.insert(
                z,
                PerChargeState {
                    snr: signal / noise,
                    cosine: cos_z,
                    intensity: sum_intensity,
                    max_intensity,
                },
            );
            total_signal += signal;
            total_noise += noise;
        }

        self.snr = if total_noise > 0.0 {
            total_signal / total_noise
        } else {
            0.0
        };
        self.charge_cosine = scorer::charge_fit_score(&per_charge_intensity);

        self.qscore = 0.0;
        self.rep_abs_charge = self.min_abs_charge;
        for (z, state) in &self.per_charge {
            let q = scorer::qscore(
                state.snr,
                state.max_intensity,
                self.snr,
                self.isotope_cosine,
                self.charge_cosine,
                self.intensity,
            );
            if q >= self.qscore {
                self.qscore = q;
                self.rep_abs_charge = *z;
            }
        }
        0
    }
}

impl<'a> IntoIterator for &'a PeakGroup {
    type Item = &'a LogMzPeak;
    type IntoIter = std::slice::Iter<'a, LogMzPeak>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::peaks::{charge_carrier_mass, LogMzPeak, NEUTRON_SHIFT};

    fn synthetic_envelope(
        avg: &PrecalculatedAveragine,
        mono_mass: f64,
        z: i32,
        scale: f32,
    ) -> Vec<LogMzPeak> {
        let mut peaks: Vec<LogMzPeak> = avg
            .get(mono_mass)
            .iter()
            .enumerate()
            .map(|(k, y)| {
                let mz =
                    (mono_mass + k as f64 * NEUTRON_SHIFT) / z as f64 + charge_carrier_mass(true);
                LogMzPeak::from_parts(mz, y * scale, true)
            })
            .collect();
        peaks.sort_by(|a, b| a.mz.total_cmp(&b.mz));
        peaks
    }

    #[test]
    fn test_recruit_and_score_envelope() {
        let avg = PrecalculatedAveragine::new(50.0, 10000.0, 25.0);
        let mono_mass = 5000.0;
        let spectrum = synthetic_envelope(&avg, mono_mass, 3, 1000.0);

        let mut pg = PeakGroup::new(3, 3, true);
        pg.set_iso_da_distance(NEUTRON_SHIFT);
        let noisy = pg.recruit_peaks(&spectrum, 10e-6, &avg, mono_mass, &[]);
        assert!(!pg.is_empty());
        assert!(noisy.is_empty());

        let offset = pg.update_qscore(&noisy, &avg);
        assert_eq!(offset, 0);
        assert!((pg.mono_mass() - mono_mass).abs() < 0.05, "{}", pg.mono_mass());
        assert!(pg.isotope_cosine() > 0.99, "{}", pg.isotope_cosine());
        assert!(pg.snr() > 0.5);
        assert!(pg.charge_snr(3) > 0.5);
        assert_eq!(pg.rep_abs_charge(), 3);
        assert_eq!(pg.abs_charge_range(), (3, 3));
    }

    #[test]
    fn test_excluded_mzs_are_skipped() {
        let avg = PrecalculatedAveragine::new(50.0, 10000.0, 25.0);
        let mono_mass = 5000.0;
        let spectrum = synthetic_envelope(&avg, mono_mass, 3, 1000.0);
        let mut excluded: Vec<f64> = spectrum.iter().map(|p| p.mz).collect();
        excluded.sort_by(|a, b| a.total_cmp(b));

        let mut pg = PeakGroup::new(3, 3, true);
        pg.set_iso_da_distance(NEUTRON_SHIFT);
        let noisy = pg.recruit_peaks(&spectrum, 10e-6, &avg, mono_mass, &excluded);
        assert!(pg.is_empty());
        assert!(noisy.is_empty());
    }

    #[test]
    fn test_noise_peaks_depress_snr() {
        let avg = PrecalculatedAveragine::new(50.0, 10000.0, 25.0);
        let mono_mass = 5000.0;
        let spectrum = synthetic_envelope(&avg, mono_mass, 3, 1000.0);

        let mut pg = PeakGroup::new(3, 3, true);
        pg.set_iso_da_distance(NEUTRON_SHIFT);
        let noisy = pg.recruit_peaks(&spectrum, 10e-6, &avg, mono_mass, &[]);
        pg.update_qscore(&noisy, &avg);
        let clean_snr = pg.snr();

        // an off-grid peak recruited as noise lowers the SNR
        let mut off_grid = LogMzPeak::from_parts(
            (mono_mass + 0.5 * NEUTRON_SHIFT) / 3.0 + charge_carrier_mass(true),
            800.0,
            true,
        );
        off_grid.abs_charge = 3;
        let mut noisy = noisy;
        noisy.push(off_grid);
        pg.update_qscore(&noisy, &avg);
        assert!(pg.snr() < clean_snr);
    }

    #[test]
    fn test_rep_charge_follows_strongest_charge() {
        let avg = PrecalculatedAveragine::new(50.0, 10000.0, 25.0);
        let mono_mass = 5000.0;
        // the same mass observed at two charges with a 10x intensity gap
        let mut spectrum = synthetic_envelope(&avg, mono_mass, 3, 1000.0);
        spectrum.extend(synthetic_envelope(&avg, mono_mass, 4, 100.0));
        spectrum.sort_by(|a, b| a.mz.total_cmp(&b.mz));

        let mut pg = PeakGroup::new(3, 4, true);
        pg.set_iso_da_distance(NEUTRON_SHIFT);
        let noisy = pg.recruit_peaks(&spectrum, 10e-6, &avg, mono_mass, &[]);
        let offset = pg.update_qscore(&noisy, &avg);
        assert_eq!(offset, 0);
        assert!(pg.charge_snr(3) > pg.charge_snr(4));
        assert_eq!(pg.rep_abs_charge(), 3);
    }

    #[test]
    #[should_panic]
    fn test_charge_range_must_be_positive() {
        PeakGroup::new(0, 5, true);
    }
}

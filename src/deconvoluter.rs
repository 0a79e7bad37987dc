//! The spectrum-level deconvolution engine
//!
//! One [`SpectralDeconvoluter`] is built per configuration and reused across
//! spectra. Each call walks the fixed pipeline: filtered log-m/z peaks,
//! bin lattice, candidate mass bins, candidate peak groups, isotope cosine
//! scoring with iterative peak recruitment, then charge-error and overlap
//! deduplication. Nothing mutable is shared between calls except this
//! engine's read-only averagine table and configuration.
use itertools::Itertools;
use mzpeaks::prelude::*;
use rayon::prelude::*;
use tracing::{debug, trace, warn};

use crate::averagine::PrecalculatedAveragine;
use crate::binning::{BinLattice, BinSet, ChargeSpan};
use crate::config::{
    ConfigError, DeconvolverConfig, HARMONIC_CHARGES, LOW_CHARGE, OVERLAP_WINDOW_FACTOR,
    TOL_DIV_FACTOR,
};
use crate::dedup;
use crate::peak_group::{DummyKind, PeakGroup};
use crate::peaks::{charge_carrier_mass, LogMzPeak, NEUTRON_SHIFT};
use crate::scorer;
use crate::solution::DeconvolvedSpectrum;

/// Spacing of the precomputed averagine table, in Da
const AVERAGINE_MASS_INTERVAL: f64 = 25.0;
const AVERAGINE_MIN_MASS: f64 = 50.0;

/// Extra mass tolerance, in Da, applied while walking isotope ladders during
/// candidate building to pick up more high signal-to-noise peaks
const MAX_MASS_DALTON_TOLERANCE: f64 = 0.16;

/// How a deconvolution call should be perturbed to produce a null
/// (dummy/decoy) mass set for FDR estimation. Every variant other than
/// `None` carries the already-deconvolved target spectrum the perturbation
/// is derived from.
#[derive(Debug, Default, Clone, Copy)]
pub enum DummyMode<'a> {
    #[default]
    None,
    /// Exclude mass regions around the target's deconvolved masses, so only
    /// charge-error artifacts can come out
    Charge(&'a DeconvolvedSpectrum),
    /// Exclude the target's peak m/z values and use a nonsensical isotope
    /// spacing, so only noise can come out
    Noise(&'a DeconvolvedSpectrum),
    /// Re-score the target's peak groups at their runner-up isotope offset
    Isotope(&'a DeconvolvedSpectrum),
}

impl DummyMode<'_> {
    fn kind(&self) -> DummyKind {
        match self {
            DummyMode::None => DummyKind::None,
            DummyMode::Charge(_) => DummyKind::Charge,
            DummyMode::Noise(_) => DummyKind::Noise,
            DummyMode::Isotope(_) => DummyKind::Isotope,
        }
    }
}

/// One input spectrum, already centroided and in memory
#[derive(Debug, Default, Clone)]
pub struct SpectrumInput {
    /// Centroid peaks ordered by m/z
    pub peaks: Vec<mzpeaks::CentroidPeak>,
    pub scan_number: usize,
    pub ms_level: u8,
    pub retention_time: f64,
    /// Precursor information for MSn spectra
    pub precursor_mz: Option<f64>,
    pub precursor_charge: Option<i32>,
    pub precursor_peak_group: Option<PeakGroup>,
}

impl SpectrumInput {
    pub fn new<C: CentroidLike>(peaks: &[C], scan_number: usize, ms_level: u8) -> Self {
        Self {
            peaks: peaks
                .iter()
                .map(|p| mzpeaks::CentroidPeak::new(p.mz(), p.intensity(), 0))
                .collect(),
            scan_number,
            ms_level,
            ..Default::default()
        }
    }
}

/// The deconvolution engine: immutable configuration, the shared averagine
/// table, optional target and exclusion mass lists, and the scoring thread
/// pool. All per-spectrum state is local to one `deconvolute_spectrum` call.
#[derive(Debug)]
pub struct SpectralDeconvoluter {
    config: DeconvolverConfig,
    avg: PrecalculatedAveragine,
    /// Targeted masses expanded by one isotope, sorted
    target_mono_masses: Vec<f64>,
    /// Excluded masses expanded over their isotope envelopes, sorted
    excluded_mono_masses: Vec<f64>,
    pool: Option<rayon::ThreadPool>,
}

impl SpectralDeconvoluter {
    pub fn new(config: DeconvolverConfig) -> Result<Self, ConfigError> {
        let config = config.validate()?;
        let avg = PrecalculatedAveragine::new(
            AVERAGINE_MIN_MASS,
            config.max_mass.max(AVERAGINE_MIN_MASS + AVERAGINE_MASS_INTERVAL),
            AVERAGINE_MASS_INTERVAL,
        );
        let pool = if config.worker_threads > 1 {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(config.worker_threads)
                .build()
            {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!("could not build the scoring thread pool ({e}), scoring serially");
                    None
                }
            }
        } else {
            None
        };
        Ok(Self {
            config,
            avg,
            target_mono_masses: Vec::new(),
            excluded_mono_masses: Vec::new(),
            pool,
        })
    }

    pub fn config(&self) -> &DeconvolverConfig {
        &self.config
    }

    pub fn averagine(&self) -> &PrecalculatedAveragine {
        &self.avg
    }

    /// Register masses for targeted re-extraction (`excluded = false`) or
    /// for exclusion from candidate building (`excluded = true`). Targets
    /// are expanded by one isotope, exclusions over their whole envelope.
    pub fn set_target_masses(&mut self, masses: &[f64], excluded: bool) {
        let list = if excluded {
            &mut self.excluded_mono_masses
        } else {
            &mut self.target_mono_masses
        };
        list.clear();
        for &m in masses {
            let end = if excluded {
                (self.avg.apex_index(m) + self.avg.right_count_from_apex(m)) as i32
            } else {
                0
            };
            for j in 0..=(end + 1) {
                list.push(m + NEUTRON_SHIFT * j as f64);
            }
        }
        list.sort_by(|a, b| a.total_cmp(b));
    }

    /// Deconvolute one spectrum into its neutral masses.
    ///
    /// The same entry point serves genuine runs (`DummyMode::None`) and the
    /// perturbed null runs; all paths share the pipeline.
    pub fn deconvolute_spectrum(
        &self,
        input: &SpectrumInput,
        dummy: DummyMode<'_>,
    ) -> DeconvolvedSpectrum {
        let ms_level = input.ms_level.max(1);
        let positive = self.config.is_positive();
        let iso_da = match dummy {
            // a nonsensical spacing guarantees noise-dummy masses are never real
            DummyMode::Noise(_) => NEUTRON_SHIFT * 7.0f64.sqrt() / 2.0,
            _ => NEUTRON_SHIFT,
        };

        let mut dspec = DeconvolvedSpectrum::new(input.scan_number, ms_level);
        dspec.retention_time = input.retention_time;
        dspec.precursor_mz = input.precursor_mz;
        dspec.precursor_charge = input.precursor_charge;
        dspec.precursor_peak_group = input.precursor_peak_group.clone().map(Box::new);

        if self
            .config
            .min_rt
            .is_some_and(|lo| input.retention_time < lo)
            || self
                .config
                .max_rt
                .is_some_and(|hi| input.retention_time > hi)
        {
            return dspec;
        }

        // null-model exclusion sets derived from the target spectrum
        let mut previously_deconved: Vec<f64> = Vec::new();
        let mut excluded_mzs: Vec<f64> = Vec::new();
        match dummy {
            DummyMode::Charge(target) => {
                previously_deconved = target
                    .iter()
                    .flat_map(|pg| pg.iter().map(|p| p.uncharged_mass()))
                    .sorted_by(|a, b| a.total_cmp(b))
                    .collect();
            }
            DummyMode::Noise(target) => {
                excluded_mzs = target
                    .iter()
                    .flat_map(|pg| pg.iter().map(|p| p.mz))
                    .sorted_by(|a, b| a.total_cmp(b))
                    .dedup()
                    .collect();
            }
            _ => {}
        }

        let mut peaks: Vec<LogMzPeak> = input
            .peaks
            .iter()
            .filter(|p| {
                p.intensity() > 0.0
                    && p.intensity() > self.config.min_intensity
                    && self.config.min_mz.map_or(true, |lo| p.mz() >= lo)
                    && self.config.max_mz.map_or(true, |hi| p.mz() <= hi)
                    && excluded_mzs
                        .binary_search_by(|m| m.total_cmp(&p.mz()))
                        .is_err()
            })
            .map(|p| LogMzPeak::new(p, positive))
            .collect();
        peaks.sort_by(|a, b| a.mz.total_cmp(&b.mz));
        if peaks.is_empty() {
            return dspec;
        }

        // MSn runs are bounded by what is known about the precursor
        let mut current_max_charge = self.config.max_abs_charge();
        let mut current_max_mass = self.config.max_mass;
        let current_min_mass = self.config.min_mass;
        if ms_level > 1 {
            if let Some(pre) = &input.precursor_peak_group {
                let (_, z2) = pre.abs_charge_range();
                current_max_charge = current_max_charge.min(z2.max(1));
                current_max_mass = current_max_mass.min(pre.mono_mass() + iso_da);
            } else if let Some(zc) = input.precursor_charge {
                current_max_charge = current_max_charge.min(zc.abs().max(1));
                if let Some(pmz) = input.precursor_mz {
                    let carrier = charge_carrier_mass(positive);
                    current_max_mass = current_max_mass
                        .min((pmz - carrier) * zc.abs() as f64 + self.config.isolation_window);
                }
            }
        }

        let mz_bin_min = peaks[0].log_mz;
        let mz_bin_max = peaks[peaks.len() - 1].log_mz;
        let spare_charges =
            (current_max_charge - self.config.min_support_peak_count as i32).max(0);
        let mass_bin_max = (mz_bin_max + ((spare_charges + 1) as f64).ln()).min(
            (current_max_mass + self.avg.right_count_from_apex(current_max_mass) as f64 + 1.0)
                .ln(),
        );
        let mass_bin_min = (AVERAGINE_MIN_MASS
            - self.avg.average_mass_delta(AVERAGINE_MIN_MASS))
        .max(1.0)
        .ln();

        let lattice = BinLattice::new(
            &self.config,
            ms_level,
            current_max_charge,
            mz_bin_min,
            mz_bin_max,
            mass_bin_min,
            mass_bin_max,
        );
        let (mz_bins, mz_intensities) = lattice.update_mz_bins(&peaks);

        let excluded_mass_bins =
            self.build_excluded_mass_bins(&lattice, &previously_deconved);
        let target_mass_bins = self.build_target_mass_bins(&lattice, iso_da);

        if let DummyMode::Isotope(target) = dummy {
            for pg in target {
                dspec.push(pg.clone());
            }
        } else {
            let (candidate_bins, mass_intensities) = lattice.update_candidate_mass_bins(
                ms_level,
                iso_da,
                self.config.min_support_peak_count,
                &mz_bins,
                &mz_intensities,
                excluded_mass_bins.as_ref(),
            );
            let (mass_bins, charge_spans) = lattice.filter_mass_bins(
                &candidate_bins,
                &mass_intensities,
                &mz_bins,
                excluded_mass_bins.as_ref(),
                target_mass_bins.as_ref(),
            );
            self.collect_candidate_peak_groups(
                &mut dspec,
                &lattice,
                &peaks,
                &mass_bins,
                &charge_spans,
                excluded_mass_bins.as_ref(),
                iso_da,
                ms_level,
                current_min_mass,
                current_max_mass,
            );
        }
        debug!(
            scan = input.scan_number,
            candidates = dspec.len(),
            "scoring candidate peak groups"
        );

        self.score_and_filter(
            &mut dspec,
            &peaks,
            iso_da,
            ms_level,
            dummy.kind(),
            &previously_deconved,
            &excluded_mzs,
            current_min_mass,
            current_max_mass,
        );
        dspec.sort();
        dedup::remove_charge_error_peak_groups(
            &mut dspec,
            self.config.min_abs_charge(),
            self.config.max_abs_charge(),
        );
        dedup::remove_overlapping_peak_groups(
            &mut dspec,
            self.config.internal_tol(ms_level) * TOL_DIV_FACTOR * OVERLAP_WINDOW_FACTOR,
        );
        dspec
    }

    /// Mass bins blacked out for charge-dummy runs: everything within the
    /// internal tolerance of a previously deconvolved mass.
    fn build_excluded_mass_bins(
        &self,
        lattice: &BinLattice,
        previously_deconved: &[f64],
    ) -> Option<BinSet> {
        let mut masses = previously_deconved.to_vec();
        masses.extend(self.excluded_mono_masses.iter().copied());
        if masses.is_empty() {
            return None;
        }
        let mut bins = BinSet::new(lattice.mass_map.bins);
        let halo = TOL_DIV_FACTOR.round() as usize;
        for m in masses {
            if m <= 0.0 {
                continue;
            }
            let j = lattice.mass_map.bin(m.ln());
            if j >= halo && j + halo + 1 < bins.len() {
                for k in (j - halo)..=(j + halo) {
                    bins.set(k, true);
                }
            }
        }
        Some(bins)
    }

    /// Mass bins that bypass intensity ranking because the caller asked for
    /// those masses explicitly.
    fn build_target_mass_bins(&self, lattice: &BinLattice, iso_da: f64) -> Option<BinSet> {
        if self.target_mono_masses.is_empty() {
            return None;
        }
        let mut bins = BinSet::new(lattice.mass_map.bins);
        for &tm in &self.target_mono_masses {
            for off in -1i32..2 {
                let m = tm + off as f64 * iso_da;
                if m <= 0.0 {
                    continue;
                }
                // target bins are set at the apex, where the signal lives
                let j = lattice.mass_map.bin((m + self.avg.most_abundant_mass_delta(m)).ln());
                if j < 1 {
                    continue;
                }
                if j + 2 >= bins.len() {
                    break;
                }
                bins.set(j - 1, true);
                bins.set(j, true);
                bins.set(j + 1, true);
            }
        }
        Some(bins)
    }

    /// Build one candidate [`PeakGroup`] per selected mass bin by walking
    /// isotope ladders outward from the anchor peak of each supporting
    /// charge, with harmonic competitor intensities accumulated in parallel.
    /// A bin whose harmonic competitors outweigh its signal is discarded as
    /// pure aliasing.
    #[allow(clippy::too_many_arguments)]
    fn collect_candidate_peak_groups(
        &self,
        dspec: &mut DeconvolvedSpectrum,
        lattice: &BinLattice,
        peaks: &[LogMzPeak],
        mass_bins: &BinSet,
        charge_spans: &[ChargeSpan],
        excluded_mass_bins: Option<&BinSet>,
        iso_da: f64,
        ms_level: u8,
        current_min_mass: f64,
        current_max_mass: f64,
    ) {
        let tol = self.config.internal_tol(ms_level);
        let positive = self.config.is_positive();
        let charge_range = lattice.max_charge as usize;
        let mass_bin_size = mass_bins.len() as i64;
        let peak_count = peaks.len();

        // per charge, the next peak to consider; peaks are consumed left to
        // right as mass bins ascend
        let mut current_peak_index = vec![0usize; charge_range];
        let peak_bins: Vec<usize> = peaks
            .iter()
            .map(|p| lattice.mz_map.bin(p.log_mz))
            .collect();

        let hn = HARMONIC_CHARGES.len();
        let mut total_harmonic_intensity = vec![0.0f64; hn];
        let mut h_prev_iso = vec![0i32; hn];
        let mut h_max_isotope_intensity = vec![0.0f32; hn];

        for mass_bin_index in mass_bins.iter_ones() {
            let (span_lo, span_hi) = charge_spans[mass_bin_index];
            if span_lo > span_hi {
                continue;
            }
            let mass = lattice.mass_map.value(mass_bin_index).exp();
            let right_index = self.avg.right_count_from_apex(mass);
            let left_index = self.avg.left_count_from_apex(mass);

            let mut pg = PeakGroup::new(1, span_hi + 1, positive);
            pg.reserve(charge_range * 12);
            pg.set_iso_da_distance(iso_da);

            let mut total_signal_intensity = 0.0f64;
            total_harmonic_intensity.fill(0.0);

            for j in span_lo..=span_hi {
                let abs_charge = j + 1;
                let bin_offset = lattice.bin_offsets[j as usize];
                if (mass_bin_index as i64) < bin_offset {
                    continue;
                }
                let b_index = (mass_bin_index as i64 - bin_offset) as usize;

                // anchor: the most intense peak quantized to exactly this bin
                let cpi = &mut current_peak_index[j as usize];
                let mut max_peak_index: i64 = -1;
                let mut max_intensity = -1.0f64;
                while *cpi + 1 < peak_count {
                    if peak_bins[*cpi] == b_index {
                        let intensity = peaks[*cpi].intensity as f64;
                        if intensity > max_intensity {
                            max_intensity = intensity;
                            max_peak_index = *cpi as i64;
                        }
                    } else if peak_bins[*cpi] > b_index {
                        break;
                    }
                    *cpi += 1;
                }
                if max_peak_index < 0 {
                    continue;
                }
                let max_peak_index = max_peak_index as usize;

                // the anchor must be a local maximum across adjacent bins,
                // otherwise the neighboring bin will claim this envelope
                if max_peak_index > 0
                    && b_index > 0
                    && peak_bins[max_peak_index - 1] == b_index - 1
                    && peaks[max_peak_index - 1].intensity as f64 > max_intensity
                {
                    continue;
                }
                if max_peak_index + 1 < peak_count
                    && peak_bins[max_peak_index + 1] == b_index + 1
                    && peaks[max_peak_index + 1].intensity as f64 > max_intensity
                {
                    continue;
                }

                let mz = peaks[max_peak_index].mz;
                let iso_delta = iso_da / abs_charge as f64;
                let mz_delta =
                    (MAX_MASS_DALTON_TOLERANCE / abs_charge as f64).min(2.0 * tol * mz);
                let max_mz = mz;
                let mut max_peak_intensity = peaks[max_peak_index].intensity;
                let mut max_isotope_intensity = 0.0f32;
                let mut prev_iso = -1000i32;
                h_prev_iso.fill(0);
                h_max_isotope_intensity.fill(0.0);

                // walk right collecting isotope peaks
                for peak_index in max_peak_index..peak_count {
                    let observed_mz = peaks[peak_index].mz;
                    let intensity = peaks[peak_index].intensity;
                    let mz_diff = observed_mz - mz;
                    let tmp_i = (mz_diff / iso_delta).round() as i32;

                    if observed_mz - max_mz > right_index as f64 * iso_delta + mz_delta {
                        break;
                    }
                    if (mz_diff - tmp_i as f64 * iso_delta).abs() < mz_delta {
                        let bin = peak_bins[peak_index] as i64 + bin_offset;
                        if bin < mass_bin_size
                            && !excluded_mass_bins.is_some_and(|x| x.get(bin as usize))
                        {
                            let mut p = peaks[peak_index];
                            p.abs_charge = abs_charge;
                            p.isotope_index = tmp_i;
                            pg.push(p);
                            if max_peak_intensity < intensity {
                                max_peak_intensity = intensity;
                            }
                            if prev_iso != tmp_i {
                                total_signal_intensity += max_isotope_intensity as f64;
                                max_isotope_intensity = 0.0;
                            }
                            max_isotope_intensity = max_isotope_intensity.max(intensity);
                            prev_iso = tmp_i;
                        }
                    } else {
                        for (l, &hc) in HARMONIC_CHARGES.iter().enumerate() {
                            if ms_level > 1 && hc * abs_charge > lattice.max_charge {
                                break;
                            }
                            let hiso_delta = iso_delta / hc as f64;
                            let tmp_hi = (mz_diff / hiso_delta).round() as i32;
                            let frac = tmp_hi as f64 / hc as f64;
                            if frac < tmp_i as f64 + MAX_MASS_DALTON_TOLERANCE {
                                continue;
                            }
                            if frac >= tmp_i as f64 + 1.0 - MAX_MASS_DALTON_TOLERANCE {
                                break;
                            }
                            if (mz_diff - tmp_hi as f64 * hiso_delta).abs() < mz_delta {
                                if h_prev_iso[l] != tmp_hi / hc {
                                    total_harmonic_intensity[l] += max_peak_intensity
                                        .min(h_max_isotope_intensity[l])
                                        as f64;
                                    h_max_isotope_intensity[l] = 0.0;
                                }
                                h_max_isotope_intensity[l] =
                                    h_max_isotope_intensity[l].max(intensity);
                                h_prev_iso[l] = tmp_hi / hc;
                            }
                        }
                    }
                }
                total_signal_intensity += max_isotope_intensity as f64;
                for l in 0..hn {
                    total_harmonic_intensity[l] += h_max_isotope_intensity[l] as f64;
                }

                max_isotope_intensity = 0.0;
                prev_iso = -1000;
                h_prev_iso.fill(0);
                h_max_isotope_intensity.fill(0.0);

                // walk left
                for peak_index in (0..max_peak_index).rev() {
                    let observed_mz = peaks[peak_index].mz;
                    let intensity = peaks[peak_index].intensity;
                    let mz_diff = observed_mz - mz;
                    let tmp_i = (mz_diff / iso_delta).round() as i32;

                    if max_mz - observed_mz > left_index as f64 * iso_delta + mz_delta {
                        break;
                    }
                    if (mz_diff - tmp_i as f64 * iso_delta).abs() < mz_delta {
                        let bin = peak_bins[peak_index] as i64 + bin_offset;
                        if bin < mass_bin_size
                            && !excluded_mass_bins.is_some_and(|x| x.get(bin as usize))
                        {
                            let mut p = peaks[peak_index];
                            p.abs_charge = abs_charge;
                            p.isotope_index = tmp_i;
                            pg.push(p);
                            if max_peak_intensity < intensity {
                                max_peak_intensity = intensity;
                            }
                            if prev_iso != tmp_i {
                                total_signal_intensity += max_isotope_intensity as f64;
                                max_isotope_intensity = 0.0;
                            }
                            max_isotope_intensity = max_isotope_intensity.max(intensity);
                            prev_iso = tmp_i;
                        }
                    } else {
                        for (l, &hc) in HARMONIC_CHARGES.iter().enumerate() {
                            if ms_level > 1 && hc * abs_charge > lattice.max_charge {
                                break;
                            }
                            let hiso_delta = iso_delta / hc as f64;
                            let tmp_hi = (mz_diff / hiso_delta).round() as i32;
                            let frac = tmp_hi as f64 / hc as f64;
                            if frac > tmp_i as f64 - MAX_MASS_DALTON_TOLERANCE {
                                continue;
                            }
                            if frac <= tmp_i as f64 - 1.0 + MAX_MASS_DALTON_TOLERANCE {
                                break;
                            }
                            if (mz_diff - tmp_hi as f64 * hiso_delta).abs() < mz_delta {
                                if h_prev_iso[l] != tmp_hi / hc {
                                    total_harmonic_intensity[l] +=
                                        h_max_isotope_intensity[l] as f64;
                                    h_max_isotope_intensity[l] = 0.0;
                                }
                                h_max_isotope_intensity[l] =
                                    h_max_isotope_intensity[l].max(intensity);
                                h_prev_iso[l] = tmp_hi / hc;
                            }
                        }
                    }
                }
                total_signal_intensity += max_isotope_intensity as f64;
                for l in 0..hn {
                    total_harmonic_intensity[l] +=
                        max_peak_intensity.min(h_max_isotope_intensity[l]) as f64;
                }
            }

            let max_harmonic = total_harmonic_intensity
                .iter()
                .fold(0.0f64, |a, b| a.max(*b));
            if total_signal_intensity <= max_harmonic {
                trace!(mass, "discarding mass bin as harmonic noise");
                continue;
            }

            // reindex isotopes against the most intense member and drop the
            // stragglers that disagree with a single neutral mass
            let mut max_intensity = -1.0f32;
            let mut t_mass = 0.0f64;
            for p in pg.iter() {
                if max_intensity < p.intensity {
                    max_intensity = p.intensity;
                    t_mass = p.uncharged_mass();
                }
            }
            let iso_tolerance = tol * t_mass;
            let apex_index = self.avg.apex_index(t_mass) as i32;
            let mut min_off = i32::MAX;
            let mut max_off = i32::MIN;
            let mut new_peaks = Vec::with_capacity(pg.len());
            for p in pg.iter() {
                let mut q = *p;
                q.isotope_index = ((q.uncharged_mass() - t_mass) / iso_da).round() as i32;
                if (t_mass - q.uncharged_mass() + iso_da * q.isotope_index as f64).abs()
                    > iso_tolerance
                {
                    continue;
                }
                q.isotope_index += apex_index;
                min_off = min_off.min(q.isotope_index);
                max_off = max_off.max(q.isotope_index);
                new_peaks.push(q);
            }

            // a single isotope slot is never enough evidence
            if min_off != max_off {
                pg.set_peaks(new_peaks);
                pg.update_mono_mass_and_isotope_intensities();
                if pg.mono_mass() < current_min_mass || pg.mono_mass() > current_max_mass {
                    continue;
                }
                dspec.push(pg);
            }
        }
    }

    /// Score every candidate independently and keep the survivors, in
    /// candidate order. Work is partitioned by stable candidate index, so
    /// results do not depend on thread scheduling.
    #[allow(clippy::too_many_arguments)]
    fn score_and_filter(
        &self,
        dspec: &mut DeconvolvedSpectrum,
        spectrum: &[LogMzPeak],
        iso_da: f64,
        ms_level: u8,
        dummy: DummyKind,
        previously_deconved: &[f64],
        excluded_mzs: &[f64],
        current_min_mass: f64,
        current_max_mass: f64,
    ) {
        let tol = self.config.internal_tol(ms_level);
        let min_cos = self.config.min_cosine(ms_level);
        let candidates = dspec.take_peak_groups();

        let score_one = |mut pg: PeakGroup| -> Option<PeakGroup> {
            pg.set_dummy_kind(dummy);
            pg.set_iso_da_distance(iso_da);
            let prev_cos = pg.isotope_cosine();
            pg.update_mono_mass_and_isotope_intensities();

            let second_best =
                (dummy == DummyKind::Isotope).then_some(self.config.allowed_isotope_error);
            let (cos, initial_offset) = scorer::isotope_cosine_and_offset(
                pg.mono_mass(),
                pg.per_isotope_intensities(),
                &self.avg,
                None,
                second_best,
            );
            let prev_mono_mass = pg.mono_mass() + initial_offset as f64 * iso_da;
            pg.set_isotope_cosine(cos);

            // cheap first filtration before the recruitment loop
            if (cos as f64) < 0.5f64.min(min_cos) - 0.1 {
                return None;
            }

            let mut offset = initial_offset;
            for _ in 0..10 {
                let hypothesis = pg.mono_mass() + offset as f64 * iso_da;
                let noisy =
                    pg.recruit_peaks(spectrum, tol, &self.avg, hypothesis, excluded_mzs);
                if pg.is_empty() {
                    return None;
                }
                offset = pg.update_qscore(&noisy, &self.avg);
                if offset == 0 {
                    break;
                }
            }

            if pg.is_empty()
                || pg.mono_mass() < current_min_mass
                || pg.mono_mass() > current_max_mass
            {
                return None;
            }
            // a large move means recruitment was captured by a different envelope
            if (prev_mono_mass - pg.mono_mass()).abs() > 3.0 {
                return None;
            }
            let (z1, z2) = pg.abs_charge_range();
            if z1 > LOW_CHARGE && (z2 - z1) < self.config.min_support_peak_count as i32 {
                return None;
            }
            if dummy == DummyKind::Isotope && pg.isotope_cosine() < prev_cos * 0.98 {
                return None;
            }

            if has_mass_near(
                &self.target_mono_masses,
                pg.mono_mass(),
                pg.mono_mass() * tol * 2.0,
            ) {
                pg.set_targeted();
            }

            if !pg.is_targeted()
                && ((pg.isotope_cosine() as f64) < min_cos || pg.snr() < self.config.min_snr)
            {
                return None;
            }
            if dummy == DummyKind::Charge
                && has_mass_near(previously_deconved, pg.mono_mass(), pg.mono_mass() * tol)
            {
                return None;
            }
            Some(pg)
        };

        let filtered: Vec<PeakGroup> = match &self.pool {
            Some(pool) => pool.install(|| {
                candidates
                    .into_par_iter()
                    .filter_map(score_one)
                    .collect()
            }),
            None => candidates.into_iter().filter_map(score_one).collect(),
        };
        dspec.set_peak_groups(filtered);
    }
}

/// Whether a sorted mass list holds a value within `delta` of `value`
fn has_mass_near(sorted: &[f64], value: f64, delta: f64) -> bool {
    if sorted.is_empty() {
        return false;
    }
    let i = sorted.partition_point(|m| *m < value - delta);
    sorted.get(i).is_some_and(|m| (m - value).abs() < delta)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_has_mass_near() {
        let masses = [100.0, 200.0, 300.0];
        assert!(has_mass_near(&masses, 200.001, 0.01));
        assert!(!has_mass_near(&masses, 210.0, 0.01));
        assert!(!has_mass_near(&[], 210.0, 0.01));
    }

    #[test]
    fn test_dummy_mode_kinds() {
        let target = DeconvolvedSpectrum::new(1, 1);
        assert_eq!(DummyMode::None.kind(), DummyKind::None);
        assert_eq!(DummyMode::Charge(&target).kind(), DummyKind::Charge);
        assert_eq!(DummyMode::Noise(&target).kind(), DummyKind::Noise);
        assert_eq!(DummyMode::Isotope(&target).kind(), DummyKind::Isotope);
    }

    #[test]
    fn test_target_mass_expansion() {
        let mut engine = SpectralDeconvoluter::new(DeconvolverConfig::default()).unwrap();
        engine.set_target_masses(&[5000.0], false);
        assert_eq!(engine.target_mono_masses.len(), 2);
        engine.set_target_masses(&[5000.0], true);
        // exclusions cover the whole envelope
        assert!(engine.excluded_mono_masses.len() > 4);
    }
}

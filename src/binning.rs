//! The log-m/z bin lattice
//!
//! Every observed peak is quantized into an m/z bin by the affine map
//! `bin = round((log(value) - min) * scale)`. Because a neutral mass relates
//! to its charged m/z by `log(mass) = log(mz - carrier) + log(z)`, probing a
//! charge reduces to adding a precomputed integer offset to the m/z bin.
//! Candidate mass bins are accumulated over all charges, with harmonic
//! aliases discounted, then filtered down to the best-supported charge range
//! per bin.
use tracing::trace;

use crate::config::{DeconvolverConfig, HARMONIC_CHARGES, LOW_CHARGE, TOL_DIV_FACTOR};
use crate::peaks::LogMzPeak;

/// The affine map between log-space values and integer bin numbers
#[derive(Debug, Clone, Copy)]
pub struct BinMapping {
    pub min_value: f64,
    pub scale: f64,
    pub bins: usize,
}

impl BinMapping {
    pub fn new(min_value: f64, max_value: f64, scale: f64) -> Self {
        assert!(scale > 0.0, "bin scale must be positive");
        let bins = if max_value <= min_value {
            1
        } else {
            ((max_value - min_value) * scale + 0.5) as usize + 1
        };
        Self {
            min_value,
            scale,
            bins,
        }
    }

    /// Values below `min_value` map to bin 0, not an error
    #[inline(always)]
    pub fn bin(&self, value: f64) -> usize {
        if value < self.min_value {
            0
        } else {
            ((value - self.min_value) * self.scale + 0.5) as usize
        }
    }

    #[inline(always)]
    pub fn value(&self, bin: usize) -> f64 {
        self.min_value + bin as f64 / self.scale
    }
}

/// A plain boolean lattice indexed by bin number
#[derive(Debug, Clone, Default)]
pub struct BinSet {
    bits: Vec<bool>,
}

impl BinSet {
    pub fn new(bins: usize) -> Self {
        Self {
            bits: vec![false; bins],
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    #[inline(always)]
    pub fn get(&self, i: usize) -> bool {
        self.bits.get(i).copied().unwrap_or(false)
    }

    #[inline(always)]
    pub fn set(&mut self, i: usize, value: bool) {
        self.bits[i] = value;
    }

    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    /// Indices of set bins, in increasing order
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.then_some(i))
    }
}

/// Sentinel-initialized inclusive charge span of one mass bin, as charge
/// *indices* (`j = abs_charge - 1`)
pub type ChargeSpan = (i32, i32);

pub const EMPTY_SPAN: ChargeSpan = (i32::MAX, i32::MIN);

/// The per-spectrum bin lattice: maps, per-charge offsets and the harmonic
/// offset matrix, rebuilt for every spectrum because the m/z origin is the
/// first observed peak.
#[derive(Debug, Clone)]
pub struct BinLattice {
    pub mz_map: BinMapping,
    pub mass_map: BinMapping,
    /// `bin_offsets[j]` shifts an m/z bin to the mass bin for charge `j + 1`
    pub bin_offsets: Vec<i64>,
    /// `harmonic_offsets[k][j]` is the analogous shift for the k-th harmonic factor
    pub harmonic_offsets: Vec<Vec<i64>>,
    pub max_charge: i32,
}

impl BinLattice {
    /// Build the lattice for one spectrum.
    ///
    /// `mz_min`/`mz_max` are the log-m/z bounds of the filtered peak list,
    /// `mass_min`/`mass_max` the log bounds of the probed mass range.
    pub fn new(
        config: &DeconvolverConfig,
        ms_level: u8,
        max_charge: i32,
        mz_min: f64,
        mz_max: f64,
        mass_min: f64,
        mass_max: f64,
    ) -> Self {
        assert!(max_charge > 0, "charge range must be strictly positive");
        let scale = config.bin_scale(ms_level);
        let mz_map = BinMapping::new(mz_min, mz_max, scale);
        let mass_map = BinMapping::new(mass_min, mass_max, scale);

        // filter[j] = -ln(j + 1) is the log-space shift from m/z to neutral mass
        let filter: Vec<f64> = (0..max_charge)
            .map(|j| -((j + 1) as f64).ln())
            .collect();

        let bin_offsets: Vec<i64> = filter
            .iter()
            .map(|f| ((mz_min - f - mass_min) * scale).round() as i64)
            .collect();

        let harmonic_offsets: Vec<Vec<i64>> = HARMONIC_CHARGES
            .iter()
            .map(|&hc| {
                let n = (hc / 2) as f64;
                (0..max_charge as usize)
                    .map(|j| {
                        let a = if j > 0 { (-filter[j - 1]).exp() } else { 0.0 };
                        let b = (-filter[j]).exp();
                        let hfilter = -(b - (b - a) * n / hc as f64).ln();
                        ((mz_min - hfilter - mass_min) * scale).round() as i64
                    })
                    .collect()
            })
            .collect();

        Self {
            mz_map,
            mass_map,
            bin_offsets,
            harmonic_offsets,
            max_charge,
        }
    }

    /// Quantize the log-m/z peak list into the m/z bin set, accumulating
    /// intensity per bin
    pub fn update_mz_bins(&self, peaks: &[LogMzPeak]) -> (BinSet, Vec<f32>) {
        let mut mz_bins = BinSet::new(self.mz_map.bins);
        let mut intensities = vec![0.0f32; self.mz_map.bins];
        for p in peaks {
            let bi = self.mz_map.bin(p.log_mz);
            if bi >= mz_bins.len() {
                continue;
            }
            mz_bins.set(bi, true);
            intensities[bi] += p.intensity;
        }
        (mz_bins, intensities)
    }

    /// Decide, per (m/z bin, charge) pair, whether the pair is genuine
    /// evidence for a neutral mass or a harmonic alias, accumulating a
    /// support-peak count per mass bin. The runtime of deconvolution is
    /// dominated by this scan.
    pub fn update_candidate_mass_bins(
        &self,
        ms_level: u8,
        iso_da_distance: f64,
        min_support_peak_count: u32,
        mz_bins: &BinSet,
        mz_intensities: &[f32],
        excluded_mass_bins: Option<&BinSet>,
    ) -> (BinSet, Vec<f32>) {
        let bin_end = self.mass_map.bins as i64;
        let mut mass_bins = BinSet::new(self.mass_map.bins);
        let mut mass_intensities = vec![0.0f32; self.mass_map.bins];

        let mut support_peak_count = vec![0u16; self.mass_map.bins];
        // previous charge index examined per mass bin; sentinel beyond the range
        let mut prev_charges = vec![(self.max_charge + 2) as u16; self.mass_map.bins];
        let mut prev_intensities = vec![0.0f32; self.mass_map.bins];

        let mz_indices: Vec<usize> = mz_bins.iter_ones().collect();
        let h_count = HARMONIC_CHARGES.len();
        let mut sub_max_h_intensity = vec![0.0f32; h_count];

        // scan m/z from high to low so, per mass bin, charges arrive in increasing order
        for &mz_bin_index in mz_indices.iter().rev() {
            let intensity = mz_intensities[mz_bin_index];
            let log_mz = self.mz_map.value(mz_bin_index);
            let mz = log_mz.exp();

            for j in 0..self.max_charge {
                let mass_bin_index = mz_bin_index as i64 + self.bin_offsets[j as usize];
                if mass_bin_index < 0 {
                    continue;
                }
                if mass_bin_index >= bin_end {
                    break;
                }
                let mass_bin_index = mass_bin_index as usize;
                if excluded_mass_bins.is_some_and(|x| x.get(mass_bin_index)) {
                    continue;
                }

                let abs_charge = j + 1;
                let prev_intensity = prev_intensities[mass_bin_index];
                let prev_charge = prev_charges[mass_bin_index] as i32;
                let charge_not_continuous =
                    prev_charge - j != -1 && prev_charge <= self.max_charge;

                // intensity ratio between consecutive charges must stay within a
                // charge-dependent factor; the factor decays above LOW_CHARGE
                let highest_factor = 10.0f32;
                let factor = if abs_charge <= LOW_CHARGE {
                    highest_factor
                } else {
                    highest_factor / 2.0
                        + highest_factor / 2.0 * LOW_CHARGE as f32 / abs_charge as f32
                };
                let hfactor = factor / 2.0;
                let mut intensity_ratio = if prev_intensity <= 0.0 {
                    factor + 1.0
                } else {
                    intensity / prev_intensity
                };
                if intensity_ratio < 1.0 {
                    intensity_ratio = 1.0 / intensity_ratio;
                }

                let mut pass_first_check = false;
                let mut support_peak_intensity = 0.0f32;
                sub_max_h_intensity.fill(0.0);

                if charge_not_continuous || intensity_ratio > factor {
                    support_peak_count[mass_bin_index] = 0;
                } else {
                    pass_first_check = true;
                    if support_peak_count[mass_bin_index] == 0 && abs_charge > LOW_CHARGE {
                        support_peak_intensity = prev_intensity;
                    }
                }

                // low charges do not show continuity; look for isotope neighbors instead
                if !pass_first_check && abs_charge <= LOW_CHARGE {
                    for d in [1i32, -1] {
                        let mut iso_exist = false;
                        let diff = d as f64 * iso_da_distance / abs_charge as f64 / mz;
                        let mut next_iso_bin = 0usize;
                        for t in -1i64..2 {
                            let nib = self.mz_map.bin(log_mz + diff) as i64 + t;
                            if (nib - mz_bin_index as i64).abs() as f64 >= TOL_DIV_FACTOR
                                && nib > 0
                                && (nib as usize) < mz_bins.len()
                                && mz_bins.get(nib as usize)
                            {
                                iso_exist = true;
                                pass_first_check = true;
                                let nib = nib as usize;
                                if next_iso_bin == 0
                                    || mz_intensities[next_iso_bin] < mz_intensities[nib]
                                {
                                    next_iso_bin = nib;
                                }
                            }
                        }

                        if iso_exist {
                            let h_threshold = intensity + mz_intensities[next_iso_bin];
                            for (k, &hc) in HARMONIC_CHARGES.iter().enumerate() {
                                if ms_level > 1 && hc * abs_charge > self.max_charge {
                                    break;
                                }
                                let hdiff = diff / hc as f64 * (hc / 2) as f64;
                                let mut harmonic_cntr = 0;
                                for t in -1i64..2 {
                                    let hb = self.mz_map.bin(log_mz + hdiff) as i64 + t;
                                    if (hb - mz_bin_index as i64).abs() as f64 >= TOL_DIV_FACTOR
                                        && hb >= 0
                                        && (hb as usize) < mz_bins.len()
                                        && mz_bins.get(hb as usize)
                                        && mz_intensities[hb as usize] > h_threshold / 2.0
                                        && mz_intensities[hb as usize] < h_threshold * 2.0
                                    {
                                        harmonic_cntr += 1;
                                        sub_max_h_intensity[k] += mz_intensities[hb as usize];
                                    }
                                }
                                if harmonic_cntr > 0 {
                                    pass_first_check = false;
                                }
                            }
                        }
                        if pass_first_check {
                            support_peak_intensity += mz_intensities[next_iso_bin];
                        }
                    }
                    pass_first_check &= sub_max_h_intensity
                        .iter()
                        .fold(0.0f32, |a, b| a.max(*b))
                        <= 0.0;
                }

                if pass_first_check {
                    if prev_charge - j == -1 {
                        // consecutive charge pair: probe harmonic positions before accepting
                        let (min_intensity, max_intensity) = if prev_intensity <= 0.0 {
                            (intensity, intensity)
                        } else if prev_intensity > intensity {
                            (intensity, prev_intensity)
                        } else {
                            (prev_intensity, intensity)
                        };
                        let high_threshold = max_intensity * hfactor;
                        let low_threshold = min_intensity / hfactor;

                        let mut is_harmonic = false;
                        for (k, &hc) in HARMONIC_CHARGES.iter().enumerate() {
                            if ms_level > 1 && hc * abs_charge > self.max_charge {
                                break;
                            }
                            for t in -1i64..2 {
                                let hmz = mass_bin_index as i64
                                    - self.harmonic_offsets[k][j as usize]
                                    + t;
                                if hmz > 0
                                    && hmz != mz_bin_index as i64
                                    && (hmz as usize) < mz_bins.len()
                                    && mz_bins.get(hmz as usize)
                                {
                                    let harmonic_intensity = mz_intensities[hmz as usize];
                                    if harmonic_intensity > low_threshold
                                        && harmonic_intensity < high_threshold
                                    {
                                        sub_max_h_intensity[k] += harmonic_intensity;
                                        is_harmonic = true;
                                    }
                                }
                            }
                        }

                        if !is_harmonic {
                            mass_intensities[mass_bin_index] +=
                                intensity + support_peak_intensity;
                            if !mass_bins.get(mass_bin_index) {
                                let spc = &mut support_peak_count[mass_bin_index];
                                *spc += 1;
                                if *spc as u32 >= min_support_peak_count
                                    || *spc as i32 >= abs_charge / 2
                                {
                                    mass_bins.set(mass_bin_index, true);
                                }
                            }
                        } else {
                            mass_intensities[mass_bin_index] -= sub_max_h_intensity
                                .iter()
                                .fold(0.0f32, |a, b| a.max(*b));
                            let spc = &mut support_peak_count[mass_bin_index];
                            *spc = spc.saturating_sub(1);
                        }
                    } else if abs_charge <= LOW_CHARGE {
                        // isotope presence is enough at low charge
                        mass_intensities[mass_bin_index] += intensity + support_peak_intensity;
                        if !mass_bins.get(mass_bin_index) {
                            support_peak_count[mass_bin_index] += 1;
                            mass_bins.set(mass_bin_index, true);
                        }
                    }
                }
                prev_intensities[mass_bin_index] = intensity;
                prev_charges[mass_bin_index] = j as u16;
            }
        }
        trace!(
            "candidate mass bins: {} of {}",
            mass_bins.count(),
            mass_bins.len()
        );
        (mass_bins, mass_intensities)
    }

    /// When one m/z peak maps to several candidate masses, keep only the
    /// `SELECT_TOP_N` most intense assignments, and record the inclusive
    /// charge span each surviving mass bin is supported by.
    pub fn filter_mass_bins(
        &self,
        candidate_mass_bins: &BinSet,
        mass_intensities: &[f32],
        mz_bins: &BinSet,
        excluded_mass_bins: Option<&BinSet>,
        target_mass_bins: Option<&BinSet>,
    ) -> (BinSet, Vec<ChargeSpan>) {
        // top charges retained per peak to tolerate frequent co-elution
        const SELECT_TOP_N: usize = 3;

        let bin_size = self.mass_map.bins as i64;
        let mut selected = BinSet::new(self.mass_map.bins);
        let mut spans = vec![EMPTY_SPAN; self.mass_map.bins];

        let mut max_indices = [-1i64; SELECT_TOP_N];
        let mut max_charges = [-1i32; SELECT_TOP_N];

        for mz_bin_index in mz_bins.iter_ones() {
            max_indices.fill(-1);
            max_charges.fill(-1);
            let mut max_intensity = 0.0f32;

            for j in 0..self.max_charge {
                let mass_bin_index = mz_bin_index as i64 + self.bin_offsets[j as usize];
                if mass_bin_index < 0 {
                    continue;
                }
                if mass_bin_index >= bin_size {
                    break;
                }
                let mbi = mass_bin_index as usize;
                if excluded_mass_bins.is_some_and(|x| x.get(mbi)) {
                    continue;
                }

                let t = mass_intensities[mbi];
                if target_mass_bins.is_some_and(|x| x.get(mbi)) {
                    if t == 0.0 {
                        continue;
                    }
                    // targeted bins always win over intensity ranking
                    max_intensity = f32::MAX;
                    max_indices.rotate_right(1);
                    max_charges.rotate_right(1);
                    max_indices[0] = mass_bin_index;
                    max_charges[0] = j;
                } else {
                    if !candidate_mass_bins.get(mbi) || t == 0.0 {
                        continue;
                    }
                    if max_intensity == 0.0 || max_intensity < t {
                        max_intensity = t;
                        max_indices.rotate_right(1);
                        max_charges.rotate_right(1);
                        max_indices[0] = mass_bin_index;
                        max_charges[0] = j;
                    }
                }
            }

            for i in 0..SELECT_TOP_N {
                let max_index = max_indices[i];
                if max_index >= 0 && max_index < bin_size {
                    let span = &mut spans[max_index as usize];
                    span.0 = span.0.min(max_charges[i]);
                    span.1 = span.1.max(max_charges[i]);
                    selected.set(max_index as usize, true);
                }
            }
        }
        trace!("selected mass bins: {}", selected.count());
        (selected, spans)
    }
}

//! Post-filter passes that collapse redundant peak groups
//!
//! Two passes run over the mass-sorted candidate list: charge-error removal
//! drops groups that are mostly explained by a higher-SNR group sharing the
//! same observed peaks at a different charge, then overlap removal keeps a
//! single representative per narrow mass window.
use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::config::CHARGE_SNR_FOLD;
use crate::peaks::charge_carrier_mass;
use crate::solution::DeconvolvedSpectrum;

/// Drop peak groups whose shared peaks are better explained by another group
/// at a different charge.
///
/// For every observed peak claimed by two or more groups, the implied charge
/// of each claimant is compared; a claimant survives the comparison only if
/// its SNR at that charge beats the competitor's by [`CHARGE_SNR_FOLD`]. A
/// group is finally removed when the intensity it shares with winning
/// competitors reaches half of its own total intensity, unless it is
/// targeted. Representative charges outside `[min_abs_charge,
/// max_abs_charge]` are removed here as well (the lower bound only for MS1).
pub fn remove_charge_error_peak_groups(
    dspec: &mut DeconvolvedSpectrum,
    min_abs_charge: i32,
    max_abs_charge: i32,
) {
    if dspec.is_empty() {
        return;
    }
    // m/z values come verbatim from the input spectrum, so bit-exact keys
    // are well defined
    let mut peak_to_pgs: BTreeMap<u64, BTreeSet<usize>> = BTreeMap::new();
    let mut mz_to_intensity: BTreeMap<u64, f32> = BTreeMap::new();
    for (i, pg) in dspec.iter().enumerate() {
        for p in pg {
            peak_to_pgs.entry(p.mz.to_bits()).or_default().insert(i);
            mz_to_intensity.insert(p.mz.to_bits(), p.intensity);
        }
    }

    let mut overlap_intensity = vec![0.0f32; dspec.len()];
    for (mz_bits, pg_indices) in &peak_to_pgs {
        if pg_indices.len() == 1 {
            continue;
        }
        let pmz = f64::from_bits(*mz_bits);
        let pint = mz_to_intensity[mz_bits];

        for &i in pg_indices {
            let positive = dspec[i].is_positive();
            let carrier = charge_carrier_mass(positive);
            let rep_z1 = (dspec[i].mono_mass() / (pmz - carrier)).round() as i32;
            let mut is_overlap = false;
            for &j in pg_indices {
                if i == j {
                    continue;
                }
                let rep_z2 = (dspec[j].mono_mass() / (pmz - carrier)).round() as i32;
                if rep_z1 == rep_z2 {
                    continue;
                }
                if dspec[i].charge_snr(rep_z1) > dspec[j].charge_snr(rep_z2) * CHARGE_SNR_FOLD {
                    continue;
                }
                is_overlap = true;
                break;
            }
            if is_overlap {
                overlap_intensity[i] += pint;
            }
        }
    }

    let ms_level = dspec.ms_level;
    let mut filtered = Vec::with_capacity(dspec.len());
    for (i, pg) in dspec.iter().enumerate() {
        if !pg.is_targeted() && overlap_intensity[i] >= pg.intensity() * 0.5 {
            continue;
        }
        if (ms_level == 1 && pg.rep_abs_charge() < min_abs_charge)
            || pg.rep_abs_charge() > max_abs_charge
        {
            continue;
        }
        filtered.push(pg.clone());
    }
    debug!(
        "charge error removal kept {} of {} peak groups",
        filtered.len(),
        dspec.len()
    );
    dspec.set_peak_groups(filtered);
}

/// Keep a single highest-SNR representative per window of relative mass
/// difference below `tol_window`, scanning masses in increasing order.
/// Targeted groups always survive regardless of SNR ranking.
pub fn remove_overlapping_peak_groups(dspec: &mut DeconvolvedSpectrum, tol_window: f64) {
    if dspec.is_empty() {
        return;
    }
    let mut filtered = Vec::with_capacity(dspec.len());
    let mut start_mass = dspec[0].mono_mass();
    let mut local_max_snr = -1.0f32;
    let mut local_max_index = 0usize;
    let mut last_local_max_index = dspec.len();

    for i in 0..dspec.len() {
        let mass = dspec[i].mono_mass();
        if mass - start_mass > mass * tol_window {
            if !dspec[local_max_index].is_targeted() && last_local_max_index != local_max_index {
                filtered.push(dspec[local_max_index].clone());
            }
            last_local_max_index = local_max_index;
            start_mass = mass;
            local_max_snr = -1.0;
        }
        if local_max_snr < dspec[i].snr() {
            local_max_snr = dspec[i].snr();
            local_max_index = i;
        }
        if dspec[i].is_targeted() {
            filtered.push(dspec[i].clone());
        }
    }
    if local_max_snr >= 0.0
        && !dspec[local_max_index].is_targeted()
        && last_local_max_index != local_max_index
    {
        filtered.push(dspec[local_max_index].clone());
    }
    debug!(
        "overlap removal kept {} of {} peak groups",
        filtered.len(),
        dspec.len()
    );
    dspec.set_peak_groups(filtered);
}

//! Isotope pattern and charge distribution scoring
//!
//! The central question for every candidate mass is whether its observed
//! per-isotope intensity vector looks like the averagine envelope of that
//! mass. The kernel is a one-sided cosine: the theoretical pattern is stored
//! unit-normalized, so only the observed vector's norm enters the
//! denominator. Degenerate inputs score 0 rather than producing NaN.
use crate::averagine::PrecalculatedAveragine;
use crate::config::MIN_ISO_SIZE;

/// Cosine between an observed isotope intensity vector and a unit-normalized
/// theoretical pattern, with the observed index `j` matched against
/// theoretical index `j - offset`.
///
/// Returns 0 when fewer than `min_iso_size` observed isotopes are in range,
/// when the observed norm vanishes, or when the most intense observed isotope
/// has empty bins on both flanks (a lone spike is not an envelope).
pub fn cosine(
    observed: &[f32],
    obs_start: usize,
    obs_end: usize,
    theoretical: &[f32],
    offset: i32,
    min_iso_size: usize,
) -> f32 {
    let obs_end = obs_end.min(observed.len());
    if obs_end.saturating_sub(obs_start) < min_iso_size {
        return 0.0;
    }

    let mut n = 0.0f32;
    let mut obs_norm = 0.0f32;
    let mut max_intensity = 0.0f32;
    let mut max_intensity_index = 0usize;

    for j in obs_start..obs_end {
        let y = observed[j];
        obs_norm += y * y;
        if max_intensity < y {
            max_intensity = y;
            max_intensity_index = j;
        }
        let i = j as i32 - offset;
        if i < 0 || i as usize >= theoretical.len() {
            continue;
        }
        let t = theoretical[i as usize];
        if t > 0.0 {
            n += y * t;
        }
    }

    // two consecutive isotopes around the most intense one must exist
    if min_iso_size > 0 {
        if max_intensity_index == obs_end - 1 {
            if max_intensity_index > 0 && observed[max_intensity_index - 1] == 0.0 {
                return 0.0;
            }
        } else if max_intensity_index == obs_start {
            if max_intensity_index + 1 < observed.len()
                && observed[max_intensity_index + 1] == 0.0
            {
                return 0.0;
            }
        } else if max_intensity_index > 0
            && max_intensity_index + 1 < observed.len()
            && observed[max_intensity_index - 1] == 0.0
            && observed[max_intensity_index + 1] == 0.0
        {
            return 0.0;
        }
    }

    if obs_norm <= 0.0 {
        return 0.0;
    }
    n / obs_norm.sqrt()
}

/// Slide the observed isotope vector against the theoretical pattern of
/// `mono_mass` and return the best `(cosine, offset)` pair.
///
/// The search window is `apex_index / 4 + 1` isotopes on each side, clamped
/// to `window_width` when given. With `second_best_exclusion` set (used for
/// isotope-shifted null searches), the best offset and everything within the
/// allowed isotope error around it are excluded and the runner-up is
/// returned instead; `(-1.0, 0)` signals that no runner-up exists.
pub fn isotope_cosine_and_offset(
    mono_mass: f64,
    per_isotope_intensities: &[f32],
    avg: &PrecalculatedAveragine,
    window_width: Option<i32>,
    second_best_exclusion: Option<i32>,
) -> (f32, i32) {
    if per_isotope_intensities.len() < MIN_ISO_SIZE {
        return (0.0, 0);
    }
    let iso = avg.get(mono_mass);
    let mut right = avg.apex_index(mono_mass) as i32 / 4 + 1;
    let mut left = right;
    if let Some(w) = window_width {
        right = right.min(w);
        left = left.min(w);
    }

    let max_isotope_index = per_isotope_intensities.len();
    let min_isotope_index = per_isotope_intensities
        .iter()
        .position(|i| *i > 0.0)
        .unwrap_or(max_isotope_index);
    if max_isotope_index - min_isotope_index < MIN_ISO_SIZE {
        return (0.0, 0);
    }

    let mut max_cos = -1000.0f32;
    let mut offset = 0;
    for tmp_offset in -left..=right {
        let tmp_cos = cosine(
            per_isotope_intensities,
            min_isotope_index,
            max_isotope_index,
            iso,
            tmp_offset,
            MIN_ISO_SIZE,
        );
        if max_cos < tmp_cos {
            max_cos = tmp_cos;
            offset = tmp_offset;
        }
    }

    if let Some(allowed_isotope_error) = second_best_exclusion {
        let mut second_max_cos = -1000.0f32;
        let mut second_max_offset = 0;
        for tmp_offset in (offset - 3)..=(offset + 3) {
            if (offset - tmp_offset).abs() <= allowed_isotope_error {
                continue;
            }
            if tmp_offset < -left || tmp_offset > right {
                continue;
            }
            let tmp_cos = cosine(
                per_isotope_intensities,
                min_isotope_index,
                max_isotope_index,
                iso,
                tmp_offset,
                MIN_ISO_SIZE,
            );
            if second_max_cos < tmp_cos && tmp_cos < max_cos {
                second_max_cos = tmp_cos;
                second_max_offset = tmp_offset;
            }
        }
        if second_max_cos < 0.0 {
            return (-1.0, 0);
        }
        return (second_max_cos, second_max_offset);
    }

    (max_cos, offset)
}

fn plain_cosine(a: &[f64], b: &[f64]) -> f32 {
    let mut n = 0.0;
    let mut d1 = 0.0;
    let mut d2 = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        n += x * y;
        d1 += x * x;
        d2 += y * y;
    }
    let d = (d1 * d2).sqrt();
    if d <= 0.0 {
        0.0
    } else {
        (n / d) as f32
    }
}

/// How well the per-charge intensity profile matches a Gaussian hump.
///
/// Fits a quadratic to the log intensities by least squares and scores the
/// observed profile against the implied Gaussian. Profiles too short to fit
/// score a neutral 0.5; a fit with non-positive variance scores 0.
pub fn charge_fit_score(per_charge_intensity: &[f32]) -> f32 {
    let max_intensity = per_charge_intensity.iter().fold(0.0f32, |a, b| a.max(*b));
    let threshold = max_intensity * 0.02;

    let mut first = -1i32;
    let mut last = 0i32;
    for (i, y) in per_charge_intensity.iter().enumerate() {
        if *y <= threshold {
            continue;
        }
        if first < 0 {
            first = i as i32;
        }
        last = i as i32;
    }
    if first < 0 {
        return 0.5;
    }

    let xs: Vec<f64> = (first..=last).map(|i| i as f64).collect();
    let ys: Vec<f64> = (first..=last)
        .map(|i| 1.0 + per_charge_intensity[i as usize] as f64)
        .collect();
    if xs.len() <= 3 {
        return 0.5;
    }

    // normal equations for the quadratic fit of log(y) on x
    let (mut s0, mut s1, mut s2, mut s3, mut s4) = (0.0f64, 0.0, 0.0, 0.0, 0.0);
    let (mut t0, mut t1, mut t2) = (0.0f64, 0.0, 0.0);
    for (x, y) in xs.iter().zip(ys.iter()) {
        let ly = y.ln();
        s0 += 1.0;
        s1 += x;
        s2 += x * x;
        s3 += x * x * x;
        s4 += x * x * x * x;
        t0 += ly;
        t1 += ly * x;
        t2 += ly * x * x;
    }

    let det = s0 * (s2 * s4 - s3 * s3) - s1 * (s1 * s4 - s2 * s3) + s2 * (s1 * s3 - s2 * s2);
    if det.abs() < f64::EPSILON {
        return 0.5;
    }
    // Cramer's rule for [a, b, c] in a + b x + c x^2
    let db = s0 * (t1 * s4 - s3 * t2) - s1 * (t0 * s4 - s2 * t2) + s2 * (t0 * s3 - s2 * t1);
    let dc = s0 * (s2 * t2 - t1 * s3) - s1 * (s1 * t2 - t0 * s3) + s2 * (s1 * t1 - t0 * s2);
    let b = db / det;
    let c = dc / det;

    let mu = -b / c / 2.0;
    let omega = -1.0 / c / 2.0;
    if omega <= 0.0 {
        return 0.0;
    }

    let tys: Vec<f64> = xs
        .iter()
        .map(|x| (-(x - mu) * (x - mu) / 2.0 / omega).exp())
        .collect();
    plain_cosine(&ys, &tys)
}

/// Composite quality score of one peak group at one charge, from a logistic
/// regression over its SNR and cosine features. The weight magnitudes come
/// from the published model and are treated as fixed; every feature is
/// oriented so that stronger evidence raises the score.
pub fn qscore(
    charge_snr: f32,
    max_peak_intensity: f32,
    total_snr: f32,
    isotope_cosine: f32,
    charge_cosine: f32,
    intensity: f32,
) -> f32 {
    let d = 0.4318 * (charge_snr as f64 + 1e-3).log10()
        + 0.2366 * (max_peak_intensity as f64 + 1.0).log10()
        + 1.0932 * (total_snr as f64 + 1e-3).log10()
        + 2.8047 * isotope_cosine as f64
        + 1.2686 * charge_cosine as f64
        + 0.2606 * (intensity as f64 + 1.0).log10()
        - 2.325;
    (1.0 / (1.0 + (-d).exp())) as f32
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let pattern = [0.5f32, 0.7, 0.4, 0.2, 0.1];
        let norm: f32 = pattern.iter().map(|y| y * y).sum::<f32>().sqrt();
        let unit: Vec<f32> = pattern.iter().map(|y| y / norm).collect();
        let cos = cosine(&pattern, 0, pattern.len(), &unit, 0, MIN_ISO_SIZE);
        assert!((cos - 1.0).abs() < 1e-5, "{cos}");
    }

    #[test]
    fn test_cosine_spike_guard() {
        let observed = [0.0f32, 0.0, 1.0, 0.0, 0.0];
        let theoretical = [0.2f32, 0.9, 0.3, 0.1];
        assert_eq!(
            cosine(&observed, 0, observed.len(), &theoretical, 0, MIN_ISO_SIZE),
            0.0
        );
    }

    #[test]
    fn test_cosine_degenerate_zero() {
        let observed = [0.0f32; 5];
        let theoretical = [0.2f32, 0.9, 0.3];
        let cos = cosine(&observed, 0, observed.len(), &theoretical, 0, MIN_ISO_SIZE);
        assert_eq!(cos, 0.0);
        // too few isotopes
        assert_eq!(cosine(&[1.0, 1.0], 0, 2, &theoretical, 0, MIN_ISO_SIZE), 0.0);
    }

    #[test]
    fn test_cosine_noise_never_helps() {
        let theoretical = {
            let p = [0.3f32, 0.8, 0.5, 0.2, 0.05];
            let norm: f32 = p.iter().map(|y| y * y).sum::<f32>().sqrt();
            p.map(|y| y / norm)
        };
        let mut prev = f32::INFINITY;
        for noise in [0.0f32, 0.2, 0.5, 1.0, 2.0] {
            let observed: Vec<f32> = theoretical.iter().map(|y| y + noise).collect();
            let cos = cosine(&observed, 0, observed.len(), &theoretical, 0, MIN_ISO_SIZE);
            assert!(cos <= prev + 1e-6, "noise {noise} raised cosine");
            prev = cos;
        }
    }

    #[test]
    fn test_offset_search_recovers_shift() {
        // the offset window is apex/4 + 1, so use a mass heavy enough for a
        // window wider than the injected shift
        let avg = PrecalculatedAveragine::new(50.0, 30000.0, 200.0);
        let mass = 20000.0;
        let iso = avg.get(mass);
        // shift the theoretical pattern by two isotopes and expect the
        // search to find the shift
        let mut observed = vec![0.0f32; iso.len() + 2];
        for (i, y) in iso.iter().enumerate() {
            observed[i + 2] = *y * 1000.0;
        }
        let (cos, offset) = isotope_cosine_and_offset(mass, &observed, &avg, None, None);
        assert_eq!(offset, 2);
        assert!(cos > 0.99, "{cos}");
    }

    #[test]
    fn test_second_best_excludes_true_offset() {
        let avg = PrecalculatedAveragine::new(50.0, 30000.0, 200.0);
        let mass = 20000.0;
        let iso = avg.get(mass);
        let observed: Vec<f32> = iso.iter().map(|y| y * 1000.0).collect();
        let (best, best_offset) = isotope_cosine_and_offset(mass, &observed, &avg, None, None);
        let (second, second_offset) =
            isotope_cosine_and_offset(mass, &observed, &avg, None, Some(1));
        assert!(second < best);
        assert!((second_offset - best_offset).abs() > 1);
    }

    #[test]
    fn test_charge_fit_gaussian_profile() {
        let profile: Vec<f32> = (0..15)
            .map(|i| (-((i - 7) as f32).powi(2) / 8.0).exp() * 1000.0)
            .collect();
        assert!(charge_fit_score(&profile) > 0.9);
        // a short profile cannot be fit
        assert_eq!(charge_fit_score(&[1.0, 2.0, 1.0]), 0.5);
    }

    #[test]
    fn test_qscore_rewards_cosine() {
        let lo = qscore(10.0, 100.0, 5.0, 0.5, 0.5, 1000.0);
        let hi = qscore(10.0, 100.0, 5.0, 0.99, 0.5, 1000.0);
        assert!(hi > lo);
        assert!((0.0..=1.0).contains(&lo));
        assert!((0.0..=1.0).contains(&hi));
    }

    #[test]
    fn test_qscore_rewards_snr() {
        let weak = qscore(1.0, 100.0, 5.0, 0.9, 0.5, 1000.0);
        let strong = qscore(50.0, 100.0, 5.0, 0.9, 0.5, 1000.0);
        assert!(strong > weak);
        let quiet = qscore(10.0, 100.0, 1.0, 0.9, 0.5, 1000.0);
        let loud = qscore(10.0, 100.0, 50.0, 0.9, 0.5, 1000.0);
        assert!(loud > quiet);
    }
}

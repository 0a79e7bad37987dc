use mzpeaks::CentroidPeak;

use mzflash::averagine::PrecalculatedAveragine;
use mzflash::{
    DeconvolverConfig, DummyKind, DummyMode, SpectralDeconvoluter, SpectrumInput, NEUTRON_SHIFT,
    PROTON,
};

fn test_config() -> DeconvolverConfig {
    DeconvolverConfig {
        tolerance_ppm: vec![10.0],
        min_isotope_cosine: vec![0.85],
        min_charge: 1,
        max_charge: 10,
        min_mass: 50.0,
        max_mass: 20_000.0,
        ..Default::default()
    }
}

/// A perfect averagine isotope envelope for `mono_mass` observed at charge `z`
fn envelope_peaks(
    avg: &PrecalculatedAveragine,
    mono_mass: f64,
    z: i32,
    scale: f32,
) -> Vec<CentroidPeak> {
    avg.get(mono_mass)
        .iter()
        .enumerate()
        .map(|(k, y)| {
            let mz = (mono_mass + k as f64 * NEUTRON_SHIFT) / z as f64 + PROTON;
            CentroidPeak::new(mz, y * scale, k as u32)
        })
        .collect()
}

fn spectrum_input(mut peaks: Vec<CentroidPeak>) -> SpectrumInput {
    peaks.sort_by(|a, b| a.mz.total_cmp(&b.mz));
    for (i, p) in peaks.iter_mut().enumerate() {
        p.index = i as u32;
    }
    SpectrumInput::new(&peaks, 1, 1)
}

#[test_log::test]
fn test_charge_shift_recovery() {
    let engine = SpectralDeconvoluter::new(test_config()).unwrap();
    for (mono_mass, z) in [(5000.0, 3), (8000.0, 7)] {
        let input = spectrum_input(envelope_peaks(engine.averagine(), mono_mass, z, 1000.0));
        let out = engine.deconvolute_spectrum(&input, DummyMode::None);
        assert!(
            !out.is_empty(),
            "no peak group recovered for mass {mono_mass} charge {z}"
        );
        let pg = out
            .iter()
            .min_by(|a, b| {
                (a.mono_mass() - mono_mass)
                    .abs()
                    .total_cmp(&(b.mono_mass() - mono_mass).abs())
            })
            .unwrap();
        assert!(
            (pg.mono_mass() - mono_mass).abs() <= mono_mass * 10e-6,
            "mass {} too far from {mono_mass}",
            pg.mono_mass()
        );
        let (z1, z2) = pg.abs_charge_range();
        assert!(z1 <= z && z <= z2, "charge {z} outside [{z1}, {z2}]");
        assert!(pg.isotope_cosine() >= 0.85);
    }
}

#[test_log::test]
fn test_end_to_end_eight_peaks() {
    let config = DeconvolverConfig {
        min_intensity: 10.0,
        ..test_config()
    };
    let engine = SpectralDeconvoluter::new(config).unwrap();
    let mono_mass = 5000.0;

    // five isotopes of a charge-3 envelope with averagine relative
    // intensities, plus three unrelated peaks below the intensity floor
    let template = engine.averagine().get(mono_mass).to_vec();
    let mut peaks: Vec<CentroidPeak> = template
        .iter()
        .take(5)
        .enumerate()
        .map(|(k, y)| {
            let mz = (mono_mass + k as f64 * NEUTRON_SHIFT) / 3.0 + PROTON;
            CentroidPeak::new(mz, y * 1000.0, k as u32)
        })
        .collect();
    peaks.push(CentroidPeak::new(900.0, 5.0, 5));
    peaks.push(CentroidPeak::new(1200.0, 3.0, 6));
    peaks.push(CentroidPeak::new(1800.0, 8.0, 7));
    assert_eq!(peaks.len(), 8);

    let out = engine.deconvolute_spectrum(&spectrum_input(peaks), DummyMode::None);
    assert_eq!(out.len(), 1, "expected exactly one peak group");
    let pg = &out[0];
    assert!(
        (4999.95..=5000.05).contains(&pg.mono_mass()),
        "mass {} outside the expected window",
        pg.mono_mass()
    );
    let (z1, z2) = pg.abs_charge_range();
    assert!(z1 <= 3 && 3 <= z2);
    assert!(pg.isotope_cosine() >= 0.85);
}

#[test_log::test]
fn test_idempotence_and_thread_count_invariance() {
    let serial = SpectralDeconvoluter::new(test_config()).unwrap();
    let parallel = SpectralDeconvoluter::new(DeconvolverConfig {
        worker_threads: 2,
        ..test_config()
    })
    .unwrap();
    let input = spectrum_input(envelope_peaks(serial.averagine(), 12000.0, 8, 1000.0));

    let a = serial.deconvolute_spectrum(&input, DummyMode::None);
    let b = serial.deconvolute_spectrum(&input, DummyMode::None);
    let c = parallel.deconvolute_spectrum(&input, DummyMode::None);

    assert_eq!(a.len(), b.len());
    assert_eq!(a.len(), c.len());
    for (x, y) in a.iter().zip(b.iter()) {
        assert_eq!(x.mono_mass().to_bits(), y.mono_mass().to_bits());
        assert_eq!(x.snr().to_bits(), y.snr().to_bits());
        assert_eq!(x.qscore().to_bits(), y.qscore().to_bits());
    }
    for (x, y) in a.iter().zip(c.iter()) {
        assert_eq!(x.mono_mass().to_bits(), y.mono_mass().to_bits());
        assert_eq!(x.snr().to_bits(), y.snr().to_bits());
    }
}

#[test_log::test]
fn test_harmonic_alias_is_rejected() {
    let engine = SpectralDeconvoluter::new(test_config()).unwrap();
    // a genuine charge-6 envelope of mass 10000; read at charge 3 its peaks
    // alias onto mass 5000 with half-spacing overtones
    let mono_mass = 10000.0;
    let input = spectrum_input(envelope_peaks(engine.averagine(), mono_mass, 6, 1000.0));
    let out = engine.deconvolute_spectrum(&input, DummyMode::None);

    assert!(out
        .iter()
        .any(|pg| (pg.mono_mass() - mono_mass).abs() < 0.1));
    assert!(
        !out.iter()
            .any(|pg| (pg.mono_mass() - 5000.0).abs() < 3.0 && pg.isotope_cosine() >= 0.85),
        "half-mass harmonic alias survived"
    );
}

#[test_log::test]
fn test_cosine_threshold_boundary_is_inclusive() {
    let mono_mass = 5000.0;
    // measure the cosine the envelope actually scores, then rerun with the
    // threshold set exactly there and just above
    let probe = SpectralDeconvoluter::new(DeconvolverConfig {
        min_isotope_cosine: vec![0.1],
        ..test_config()
    })
    .unwrap();
    let input = spectrum_input(envelope_peaks(probe.averagine(), mono_mass, 3, 1000.0));
    let out = probe.deconvolute_spectrum(&input, DummyMode::None);
    let achieved = out
        .iter()
        .find(|pg| (pg.mono_mass() - mono_mass).abs() < 0.1)
        .expect("probe run must recover the envelope")
        .isotope_cosine() as f64;

    let at_threshold = SpectralDeconvoluter::new(DeconvolverConfig {
        min_isotope_cosine: vec![achieved],
        ..test_config()
    })
    .unwrap();
    let out = at_threshold.deconvolute_spectrum(&input, DummyMode::None);
    assert!(
        out.iter().any(|pg| (pg.mono_mass() - mono_mass).abs() < 0.1),
        "candidate exactly at the cosine threshold must be retained"
    );

    let above_threshold = SpectralDeconvoluter::new(DeconvolverConfig {
        min_isotope_cosine: vec![achieved + 1e-6],
        ..test_config()
    })
    .unwrap();
    let out = above_threshold.deconvolute_spectrum(&input, DummyMode::None);
    assert!(
        !out.iter().any(|pg| (pg.mono_mass() - mono_mass).abs() < 0.1),
        "candidate below the cosine threshold must be rejected"
    );
}

#[test_log::test]
fn test_overlap_dedup_keeps_best_unless_targeted() {
    let strong_mass = 5000.0;
    let weak_mass = 5000.05;

    let engine = SpectralDeconvoluter::new(test_config()).unwrap();
    let mut peaks = envelope_peaks(engine.averagine(), strong_mass, 3, 1000.0);
    peaks.extend(envelope_peaks(engine.averagine(), weak_mass, 3, 100.0));
    let input = spectrum_input(peaks);

    let out = engine.deconvolute_spectrum(&input, DummyMode::None);
    let near: Vec<_> = out
        .iter()
        .filter(|pg| (pg.mono_mass() - strong_mass).abs() < 1.0)
        .collect();
    assert_eq!(near.len(), 1, "overlapping masses must collapse to one");
    assert!(
        (near[0].mono_mass() - strong_mass).abs() < (near[0].mono_mass() - weak_mass).abs(),
        "the stronger envelope must win"
    );

    // targeting the weak mass exempts it from overlap removal
    let mut targeted_engine = SpectralDeconvoluter::new(test_config()).unwrap();
    targeted_engine.set_target_masses(&[weak_mass], false);
    let out = targeted_engine.deconvolute_spectrum(&input, DummyMode::None);
    let near: Vec<_> = out
        .iter()
        .filter(|pg| (pg.mono_mass() - strong_mass).abs() < 1.0)
        .collect();
    assert!(near.len() >= 2, "targeted mass must survive dedup");
    assert!(near.iter().any(|pg| pg.is_targeted()));
}

#[test_log::test]
fn test_noise_dummy_produces_no_real_mass() {
    let engine = SpectralDeconvoluter::new(test_config()).unwrap();
    let mono_mass = 5000.0;
    let input = spectrum_input(envelope_peaks(engine.averagine(), mono_mass, 3, 1000.0));

    let target = engine.deconvolute_spectrum(&input, DummyMode::None);
    assert!(!target.is_empty());

    // every peak of the target is excluded, and the isotope spacing is
    // nonsensical, so nothing should deconvolve
    let dummy = engine.deconvolute_spectrum(&input, DummyMode::Noise(&target));
    assert!(
        !dummy
            .iter()
            .any(|pg| (pg.mono_mass() - mono_mass).abs() < 1.0),
        "noise dummy reproduced the genuine mass"
    );
}

#[test_log::test]
fn test_charge_dummy_excludes_known_masses() {
    let engine = SpectralDeconvoluter::new(test_config()).unwrap();
    let mono_mass = 5000.0;
    let input = spectrum_input(envelope_peaks(engine.averagine(), mono_mass, 3, 1000.0));

    let target = engine.deconvolute_spectrum(&input, DummyMode::None);
    assert!(!target.is_empty());

    let dummy = engine.deconvolute_spectrum(&input, DummyMode::Charge(&target));
    assert!(
        !dummy
            .iter()
            .any(|pg| (pg.mono_mass() - mono_mass).abs() < 0.5),
        "charge dummy reproduced an excluded mass"
    );
}

#[test_log::test]
fn test_msn_bounded_by_precursor_peak_group() {
    let config = DeconvolverConfig {
        min_support_peak_count: 1,
        ..test_config()
    };
    let engine = SpectralDeconvoluter::new(config).unwrap();

    let ms1 = engine.deconvolute_spectrum(
        &spectrum_input(envelope_peaks(engine.averagine(), 4000.0, 2, 1000.0)),
        DummyMode::None,
    );
    let precursor = ms1
        .iter()
        .find(|pg| (pg.mono_mass() - 4000.0).abs() < 0.1)
        .expect("precursor envelope must deconvolve")
        .clone();
    assert_eq!(precursor.abs_charge_range().1, 2);

    let mut fragments = envelope_peaks(engine.averagine(), 3000.0, 2, 1000.0);
    fragments.extend(envelope_peaks(engine.averagine(), 5000.0, 3, 1000.0));

    // without precursor bounds the heavy mass comes out as well
    let control =
        engine.deconvolute_spectrum(&spectrum_input(fragments.clone()), DummyMode::None);
    assert!(control
        .iter()
        .any(|pg| (pg.mono_mass() - 5000.0).abs() < 0.1));

    let mut input = spectrum_input(fragments);
    input.ms_level = 2;
    input.precursor_peak_group = Some(precursor);
    let out = engine.deconvolute_spectrum(&input, DummyMode::None);
    assert!(
        out.iter().any(|pg| (pg.mono_mass() - 3000.0).abs() < 0.1),
        "fragment below the precursor mass must survive"
    );
    assert!(
        !out.iter().any(|pg| (pg.mono_mass() - 5000.0).abs() < 3.0),
        "mass above the precursor cap survived"
    );
    for pg in out.iter() {
        assert!(
            pg.abs_charge_range().1 <= 2,
            "charge above the precursor envelope charge survived"
        );
    }
}

#[test_log::test]
fn test_msn_bounded_by_precursor_mz_and_charge() {
    let config = DeconvolverConfig {
        min_support_peak_count: 1,
        ..test_config()
    };
    let engine = SpectralDeconvoluter::new(config).unwrap();
    let mut fragments = envelope_peaks(engine.averagine(), 3000.0, 2, 1000.0);
    fragments.extend(envelope_peaks(engine.averagine(), 5000.0, 3, 1000.0));

    let mut input = spectrum_input(fragments);
    input.ms_level = 2;
    // caps the probed mass near (m/z - proton) * |z| plus the isolation
    // window, about 4003 Da here
    input.precursor_mz = Some(2001.0);
    input.precursor_charge = Some(2);

    let out = engine.deconvolute_spectrum(&input, DummyMode::None);
    assert!(out.iter().any(|pg| (pg.mono_mass() - 3000.0).abs() < 0.1));
    assert!(
        !out.iter().any(|pg| (pg.mono_mass() - 5000.0).abs() < 3.0),
        "mass above the isolation-derived cap survived"
    );
    for pg in out.iter() {
        assert!(pg.abs_charge_range().1 <= 2);
    }
}

#[test_log::test]
fn test_isotope_dummy_rescored_from_target_groups() {
    let engine = SpectralDeconvoluter::new(test_config()).unwrap();
    let input = spectrum_input(envelope_peaks(engine.averagine(), 5000.0, 3, 1000.0));
    let target = engine.deconvolute_spectrum(&input, DummyMode::None);
    assert!(!target.is_empty());

    // isotope-dummy candidates are the target's own groups rescored at their
    // runner-up isotope offset, never fresh lattice candidates
    let dummy = engine.deconvolute_spectrum(&input, DummyMode::Isotope(&target));
    assert!(dummy.len() <= target.len());
    for pg in dummy.iter() {
        assert_eq!(pg.dummy_kind(), DummyKind::Isotope);
    }

    // widening the allowed isotope error to the whole runner-up search
    // window leaves no offset to rescore at, so every candidate dies
    let strict = SpectralDeconvoluter::new(DeconvolverConfig {
        allowed_isotope_error: 3,
        ..test_config()
    })
    .unwrap();
    let dummy = strict.deconvolute_spectrum(&input, DummyMode::Isotope(&target));
    assert!(dummy.is_empty());
}

#[test_log::test]
fn test_rt_bounds_skip_spectrum() {
    let config = DeconvolverConfig {
        min_rt: Some(100.0),
        max_rt: Some(200.0),
        ..test_config()
    };
    let engine = SpectralDeconvoluter::new(config).unwrap();
    let mut input = spectrum_input(envelope_peaks(engine.averagine(), 5000.0, 3, 1000.0));
    input.retention_time = 50.0;
    assert!(engine.deconvolute_spectrum(&input, DummyMode::None).is_empty());
    input.retention_time = 150.0;
    assert!(!engine.deconvolute_spectrum(&input, DummyMode::None).is_empty());
}

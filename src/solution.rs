//! The deconvolution result for one spectrum
use std::ops::Index;

use crate::peak_group::PeakGroup;

/// An ordered sequence of [`PeakGroup`]s for one input spectrum plus the
/// spectrum-level metadata the core carries through. Mutated only by
/// `push`/`set_peak_groups`/`sort`, read-only once deconvolution finishes.
#[derive(Debug, Default, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeconvolvedSpectrum {
    peak_groups: Vec<PeakGroup>,
    pub scan_number: usize,
    pub ms_level: u8,
    pub retention_time: f64,
    /// The deconvolved precursor of an MSn spectrum, when the caller knows it
    pub precursor_peak_group: Option<Box<PeakGroup>>,
    pub precursor_mz: Option<f64>,
    pub precursor_charge: Option<i32>,
}

impl DeconvolvedSpectrum {
    pub fn new(scan_number: usize, ms_level: u8) -> Self {
        Self {
            scan_number,
            ms_level,
            ..Default::default()
        }
    }

    pub fn push(&mut self, peak_group: PeakGroup) {
        self.peak_groups.push(peak_group);
    }

    pub fn reserve(&mut self, n: usize) {
        self.peak_groups.reserve(n);
    }

    pub fn len(&self) -> usize {
        self.peak_groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peak_groups.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PeakGroup> {
        self.peak_groups.iter()
    }

    pub fn peak_groups(&self) -> &[PeakGroup] {
        &self.peak_groups
    }

    pub fn set_peak_groups(&mut self, peak_groups: Vec<PeakGroup>) {
        self.peak_groups = peak_groups;
    }

    pub fn take_peak_groups(&mut self) -> Vec<PeakGroup> {
        std::mem::take(&mut self.peak_groups)
    }

    /// Order the peak groups by ascending monoisotopic mass
    pub fn sort(&mut self) {
        self.peak_groups
            .sort_by(|a, b| a.mono_mass().total_cmp(&b.mono_mass()));
    }
}

impl Index<usize> for DeconvolvedSpectrum {
    type Output = PeakGroup;

    fn index(&self, index: usize) -> &Self::Output {
        &self.peak_groups[index]
    }
}

impl<'a> IntoIterator for &'a DeconvolvedSpectrum {
    type Item = &'a PeakGroup;
    type IntoIter = std::slice::Iter<'a, PeakGroup>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl IntoIterator for DeconvolvedSpectrum {
    type Item = PeakGroup;
    type IntoIter = std::vec::IntoIter<PeakGroup>;

    fn into_iter(self) -> Self::IntoIter {
        self.peak_groups.into_iter()
    }
}

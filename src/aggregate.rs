use crate::matrix::DesignMatrix;
use crate::sampling::{SampledSpectrum, SamplingError, sample};
use crate::spectrum::{BandInput, ContinuousSpectrum, SourceRecord, SpectrumError};
use crate::types::{Band, SourceId, TruncationPolicy};
use ndarray::Array1;
use std::sync::Arc;
use thiserror::Error;

/// Why one band of one source could not be sampled.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BandError {
    #[error(transparent)]
    Spectrum(#[from] SpectrumError),

    #[error(transparent)]
    Sampling(#[from] SamplingError),
}

/// What to do when one source's band has inconsistent shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShapeErrorPolicy {
    /// Propagate the first shape error and stop the batch.
    #[default]
    Abort,
    /// Log it, NaN-fill that band and keep going.
    SkipAndReport,
}

/// A band left NaN-filled because its input was inconsistent.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedBand {
    pub source_id: SourceId,
    pub band: Band,
    pub error: BandError,
}

/// The read-only design matrices every source is sampled through.
#[derive(Debug, Clone)]
pub struct BandDesigns {
    bp: Arc<DesignMatrix>,
    rp: Arc<DesignMatrix>,
}

impl BandDesigns {
    pub fn new(bp: Arc<DesignMatrix>, rp: Arc<DesignMatrix>) -> Self {
        Self { bp, rp }
    }

    pub fn get(&self, band: Band) -> &Arc<DesignMatrix> {
        match band {
            Band::Bp => &self.bp,
            Band::Rp => &self.rp,
        }
    }
}

/// Both bands of one source, side by side. Bands are never blended.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedSpectrumRecord {
    pub source_id: SourceId,
    pub bp: SampledSpectrum,
    pub rp: SampledSpectrum,
}

impl MergedSpectrumRecord {
    pub fn band(&self, band: Band) -> &SampledSpectrum {
        match band {
            Band::Bp => &self.bp,
            Band::Rp => &self.rp,
        }
    }

    /// Sorted union of both bands' sampling positions.
    pub fn positions(&self) -> Array1<f64> {
        if Arc::ptr_eq(&self.bp.positions, &self.rp.positions) {
            return self.bp.positions.as_ref().clone();
        }
        let mut all: Vec<f64> = self
            .bp
            .positions
            .iter()
            .chain(self.rp.positions.iter())
            .copied()
            .collect();
        all.sort_by(f64::total_cmp);
        all.dedup();
        Array1::from(all)
    }

    /// Number of bands carrying sampled values.
    pub fn bands_present(&self) -> usize {
        Band::ALL
            .iter()
            .filter(|&&b| !self.band(b).is_missing())
            .count()
    }
}

/// Samples one band; an absent band becomes a NaN placeholder on the design's grid.
pub fn sample_band(
    source_id: SourceId,
    band: Band,
    input: Option<&BandInput>,
    design: &DesignMatrix,
    truncation: TruncationPolicy,
    with_correlation: bool,
) -> Result<SampledSpectrum, BandError> {
    let Some(input) = input else {
        return Ok(SampledSpectrum::missing(
            source_id,
            band,
            Arc::clone(design.positions()),
            with_correlation,
        ));
    };
    let spectrum = ContinuousSpectrum::from_input(source_id, band, input)?;
    let level = truncation.level(input.n_relevant_bases);
    Ok(sample(&spectrum, design, level, with_correlation)?)
}

/// One merged row plus the bands that were skipped on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceOutcome {
    pub record: MergedSpectrumRecord,
    pub skipped: Vec<SkippedBand>,
}

/// Samples both bands of `record` independently and co-locates the results.
///
/// Touches nothing but `record` and the shared designs, so rows may be
/// processed in any order or concurrently.
pub fn sample_source(
    record: &SourceRecord,
    designs: &BandDesigns,
    truncation: TruncationPolicy,
    with_correlation: bool,
    shape_errors: ShapeErrorPolicy,
) -> Result<SourceOutcome, BandError> {
    let mut skipped = Vec::new();
    let mut run = |band: Band| -> Result<SampledSpectrum, BandError> {
        let design = designs.get(band);
        match sample_band(
            record.source_id,
            band,
            record.band(band),
            design,
            truncation,
            with_correlation,
        ) {
            Ok(s) => Ok(s),
            Err(error) if shape_errors == ShapeErrorPolicy::SkipAndReport => {
                log::warn!("skipping {band} of source {}: {error}", record.source_id);
                skipped.push(SkippedBand {
                    source_id: record.source_id,
                    band,
                    error,
                });
                Ok(SampledSpectrum::missing(
                    record.source_id,
                    band,
                    Arc::clone(design.positions()),
                    with_correlation,
                ))
            }
            Err(error) => Err(error),
        }
    };
    let bp = run(Band::Bp)?;
    let rp = run(Band::Rp)?;
    Ok(SourceOutcome {
        record: MergedSpectrumRecord {
            source_id: record.source_id,
            bp,
            rp,
        },
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::CoefficientErrors;
    use ndarray::{Array2, array};

    fn designs() -> BandDesigns {
        let grid = array![0.0, 1.0, 2.0];
        let bp = DesignMatrix::from_array(grid.clone(), Array2::from_elem((2, 3), 1.0)).unwrap();
        let rp = DesignMatrix::from_array(grid, Array2::from_elem((3, 3), 2.0)).unwrap();
        BandDesigns::new(Arc::new(bp), Arc::new(rp))
    }

    fn band(n: usize) -> BandInput {
        BandInput {
            coefficients: Array1::ones(n),
            errors: CoefficientErrors::Covariance(Array2::eye(n)),
            scale: 1.0,
            n_relevant_bases: Some(1),
        }
    }

    #[test]
    fn missing_band_keeps_the_row() {
        let record = SourceRecord {
            source_id: 5,
            bp: None,
            rp: Some(band(3)),
        };
        let out = sample_source(
            &record,
            &designs(),
            TruncationPolicy::None,
            false,
            ShapeErrorPolicy::Abort,
        )
        .unwrap();
        assert!(out.record.bp.is_missing());
        assert!(out.record.bp.flux.iter().all(|v| v.is_nan()));
        assert_eq!(out.record.rp.flux, array![6.0, 6.0, 6.0]);
        assert_eq!(out.record.bands_present(), 1);
        assert_eq!(out.record.positions(), array![0.0, 1.0, 2.0]);
        assert!(out.skipped.is_empty());
    }

    #[test]
    fn recommended_truncation_reads_the_input() {
        let record = SourceRecord {
            source_id: 5,
            bp: Some(band(2)),
            rp: Some(band(3)),
        };
        let out = sample_source(
            &record,
            &designs(),
            TruncationPolicy::Recommended,
            false,
            ShapeErrorPolicy::Abort,
        )
        .unwrap();
        assert_eq!(out.record.bp.flux, array![1.0, 1.0, 1.0]);
        assert_eq!(out.record.rp.flux, array![2.0, 2.0, 2.0]);
        assert_eq!(out.record.rp.bases_used, Some(1));
    }

    #[test]
    fn shape_errors_abort_or_skip() {
        let record = SourceRecord {
            source_id: 9,
            bp: Some(band(4)),
            rp: Some(band(3)),
        };
        let err = sample_source(
            &record,
            &designs(),
            TruncationPolicy::None,
            false,
            ShapeErrorPolicy::Abort,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BandError::Sampling(SamplingError::Dimension { design_rows: 2, .. })
        ));

        let out = sample_source(
            &record,
            &designs(),
            TruncationPolicy::None,
            true,
            ShapeErrorPolicy::SkipAndReport,
        )
        .unwrap();
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.skipped[0].band, Band::Bp);
        assert!(out.record.bp.is_missing());
        assert!(!out.record.rp.is_missing());
        assert!(out.record.rp.correlation.is_some());
    }
}

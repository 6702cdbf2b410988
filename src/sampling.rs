//! Truncated sampling of continuous spectra.
//!
//! For a spectrum with coefficients `c`, covariance `S` and scale `a`, sampled
//! through the leading `k` rows `D_k` of a design matrix:
//!
//! ```text
//! flux       = a * c_k^T D_k
//! cov        = a^2 * D_k^T S_k D_k
//! flux_error = sqrt(max(diag(cov), 0))
//! corr_ij    = cov_ij / (err_i err_j), 0 where either error is 0
//! ```

use crate::linalg::faer_ndarray::{congruence, congruence_diag};
use crate::matrix::DesignMatrix;
use crate::spectrum::ContinuousSpectrum;
use crate::types::{Band, SourceId, TruncationLevel};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplingError {
    /// Internal configuration mismatch upstream; never retryable.
    #[error(
        "source {source_id} ({band}): design matrix has {design_rows} basis rows but the spectrum has {n_coefficients} coefficients"
    )]
    Dimension {
        source_id: SourceId,
        band: Band,
        design_rows: usize,
        n_coefficients: usize,
    },
}

/// A spectrum expressed at explicit grid positions.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledSpectrum {
    pub source_id: SourceId,
    pub band: Band,
    /// Shared sampling grid.
    pub positions: Arc<Array1<f64>>,
    pub flux: Array1<f64>,
    pub flux_error: Array1<f64>,
    pub correlation: Option<Array2<f64>>,
    /// Number of bases that contributed; `None` for a missing band.
    pub bases_used: Option<usize>,
}

impl SampledSpectrum {
    /// NaN-filled placeholder for a band with no data.
    pub fn missing(
        source_id: SourceId,
        band: Band,
        positions: Arc<Array1<f64>>,
        with_correlation: bool,
    ) -> Self {
        let m = positions.len();
        Self {
            source_id,
            band,
            flux: Array1::from_elem(m, f64::NAN),
            flux_error: Array1::from_elem(m, f64::NAN),
            correlation: with_correlation.then(|| Array2::from_elem((m, m), f64::NAN)),
            positions,
            bases_used: None,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.bases_used.is_none()
    }

    pub fn len(&self) -> usize {
        self.flux.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flux.is_empty()
    }

    /// Rebuilds the sampled covariance from correlation and errors.
    pub fn covariance(&self) -> Option<Array2<f64>> {
        self.correlation.as_ref().map(|corr| {
            let e = &self.flux_error;
            Array2::from_shape_fn(corr.dim(), |(i, j)| corr[[i, j]] * e[i] * e[j])
        })
    }
}

fn check_dimensions(
    spectrum: &ContinuousSpectrum,
    design: &DesignMatrix,
) -> Result<(), SamplingError> {
    if design.nrows() != spectrum.n_bases() {
        return Err(SamplingError::Dimension {
            source_id: spectrum.source_id(),
            band: spectrum.band(),
            design_rows: design.nrows(),
            n_coefficients: spectrum.n_bases(),
        });
    }
    Ok(())
}

/// `a^2 * D_k^T S_k D_k`, the full sampled covariance.
pub fn sampled_covariance(
    spectrum: &ContinuousSpectrum,
    design: &DesignMatrix,
    truncation: TruncationLevel,
) -> Result<Array2<f64>, SamplingError> {
    check_dimensions(spectrum, design)?;
    let (_, cov_k) = spectrum.with_truncation(truncation);
    let d_k = design.leading(cov_k.nrows());
    let scale2 = spectrum.scale() * spectrum.scale();
    Ok(congruence(&d_k, &cov_k) * scale2)
}

/// Standard deviation from a variance, with negative round-off clamped to zero.
fn error_from_variance(variance: f64) -> f64 {
    if variance > 0.0 {
        variance.sqrt()
    } else {
        if variance < 0.0 {
            log::debug!("clamping negative sampled variance {variance:.3e} to zero");
        }
        // NaN variance stays NaN: it means the input carried NaN.
        if variance.is_nan() { f64::NAN } else { 0.0 }
    }
}

/// Normalises a covariance into a correlation matrix.
///
/// Entries involving a zero error are zero; the diagonal is exactly one
/// wherever the error is non-zero.
pub fn covariance_to_correlation(
    covariance: ArrayView2<'_, f64>,
    errors: ArrayView1<'_, f64>,
) -> Array2<f64> {
    let m = errors.len();
    let mut corr = Array2::<f64>::zeros((m, m));
    for i in 0..m {
        let ei = errors[i];
        if ei == 0.0 {
            continue;
        }
        for j in 0..m {
            let ej = errors[j];
            if ej == 0.0 {
                continue;
            }
            corr[[i, j]] = if i == j {
                1.0
            } else {
                covariance[[i, j]] / (ei * ej)
            };
        }
    }
    corr
}

/// Samples one band of one source through a design matrix.
///
/// The truncation keeps the leading `k` entries of the coefficient vector, the
/// leading `k x k` block of the covariance and the leading `k` rows of the
/// design; all three share the same basis ordering.
pub fn sample(
    spectrum: &ContinuousSpectrum,
    design: &DesignMatrix,
    truncation: TruncationLevel,
    with_correlation: bool,
) -> Result<SampledSpectrum, SamplingError> {
    check_dimensions(spectrum, design)?;
    let positions = Arc::clone(design.positions());
    if spectrum.is_absent() {
        return Ok(SampledSpectrum::missing(
            spectrum.source_id(),
            spectrum.band(),
            positions,
            with_correlation,
        ));
    }

    let (coefficients, covariance) = spectrum.with_truncation(truncation);
    let k = coefficients.len();
    let d_k = design.leading(k);
    let scale = spectrum.scale();
    let scale2 = scale * scale;

    let flux = design.combine(coefficients) * scale;

    let (flux_error, correlation) = if with_correlation {
        let cov = congruence(&d_k, &covariance) * scale2;
        let errors = cov.diag().mapv(error_from_variance);
        let corr = covariance_to_correlation(cov.view(), errors.view());
        (errors, Some(corr))
    } else {
        let variance = congruence_diag(&d_k, &covariance) * scale2;
        (variance.mapv(error_from_variance), None)
    };

    Ok(SampledSpectrum {
        source_id: spectrum.source_id(),
        band: spectrum.band(),
        positions,
        flux,
        flux_error,
        correlation,
        bases_used: Some(k),
    })
}

use crate::types::{Band, SourceId, TruncationLevel};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};
use thiserror::Error;

/// Shape disagreements in one source's continuous representation.
///
/// Fatal for that source's band only; the batch decides whether to abort.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpectrumError {
    #[error(
        "source {source_id} ({band}): {n_coefficients} coefficients but covariance is {rows}x{cols}"
    )]
    CovarianceShape {
        source_id: SourceId,
        band: Band,
        n_coefficients: usize,
        rows: usize,
        cols: usize,
    },

    #[error(
        "source {source_id} ({band}): {n_coefficients} coefficients but {n_errors} coefficient errors"
    )]
    ErrorsLength {
        source_id: SourceId,
        band: Band,
        n_coefficients: usize,
        n_errors: usize,
    },

    #[error(
        "source {source_id} ({band}): packed correlation of length {found} does not fit {n_coefficients} coefficients"
    )]
    PackedCorrelationLength {
        source_id: SourceId,
        band: Band,
        n_coefficients: usize,
        found: usize,
    },
}

/// Uncertainty representation supplied with a band's coefficients.
#[derive(Debug, Clone, PartialEq)]
pub enum CoefficientErrors {
    /// Full coefficient covariance.
    Covariance(Array2<f64>),
    /// Correlation matrix plus per-coefficient standard deviations.
    Correlation {
        correlation: Array2<f64>,
        standard_errors: Array1<f64>,
    },
    /// Strict lower triangle (or lower triangle with diagonal) of the
    /// correlation matrix, row-major, plus per-coefficient standard deviations.
    PackedCorrelation {
        packed: Array1<f64>,
        standard_errors: Array1<f64>,
    },
}

/// One band's fields for one source, as delivered by the input collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct BandInput {
    pub coefficients: Array1<f64>,
    pub errors: CoefficientErrors,
    pub scale: f64,
    /// Recommended number of significant leading bases.
    pub n_relevant_bases: Option<usize>,
}

/// One source row: both bands, either of which may be absent.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub source_id: SourceId,
    pub bp: Option<BandInput>,
    pub rp: Option<BandInput>,
}

impl SourceRecord {
    pub fn band(&self, band: Band) -> Option<&BandInput> {
        match band {
            Band::Bp => self.bp.as_ref(),
            Band::Rp => self.rp.as_ref(),
        }
    }
}

/// Rebuilds a symmetric correlation matrix from its packed lower triangle.
///
/// Accepts `n(n-1)/2` values (unit diagonal implied) or `n(n+1)/2` values
/// (diagonal included), both in row-major order.
pub fn unpack_correlation(packed: ArrayView1<'_, f64>, n: usize) -> Option<Array2<f64>> {
    let strict = n * n.saturating_sub(1) / 2;
    let with_diag = n * (n + 1) / 2;
    let include_diag = if packed.len() == strict {
        false
    } else if packed.len() == with_diag {
        true
    } else {
        return None;
    };
    let mut out = Array2::<f64>::eye(n);
    let mut cursor = 0usize;
    for i in 0..n {
        let end = if include_diag { i + 1 } else { i };
        for j in 0..end {
            let v = packed[cursor];
            cursor += 1;
            out[[i, j]] = v;
            out[[j, i]] = v;
        }
    }
    Some(out)
}

/// `C_ij * sigma_i * sigma_j`.
pub fn correlation_to_covariance(
    correlation: ArrayView2<'_, f64>,
    standard_errors: ArrayView1<'_, f64>,
) -> Array2<f64> {
    let n = standard_errors.len();
    Array2::from_shape_fn((n, n), |(i, j)| {
        correlation[[i, j]] * standard_errors[i] * standard_errors[j]
    })
}

/// A source's basis-function representation in one band.
///
/// Invariant: `coefficients.len() == covariance.nrows() == covariance.ncols()`.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuousSpectrum {
    source_id: SourceId,
    band: Band,
    coefficients: Array1<f64>,
    covariance: Array2<f64>,
    scale: f64,
}

impl ContinuousSpectrum {
    pub fn new(
        source_id: SourceId,
        band: Band,
        coefficients: Array1<f64>,
        covariance: Array2<f64>,
        scale: f64,
    ) -> Result<Self, SpectrumError> {
        let n = coefficients.len();
        let (rows, cols) = covariance.dim();
        if rows != n || cols != n {
            return Err(SpectrumError::CovarianceShape {
                source_id,
                band,
                n_coefficients: n,
                rows,
                cols,
            });
        }
        Ok(Self {
            source_id,
            band,
            coefficients,
            covariance,
            scale,
        })
    }

    /// Builds the spectrum from whichever uncertainty representation the input carries.
    pub fn from_input(
        source_id: SourceId,
        band: Band,
        input: &BandInput,
    ) -> Result<Self, SpectrumError> {
        let n = input.coefficients.len();
        let check_errors = |errors: &Array1<f64>| {
            if errors.len() == n {
                Ok(())
            } else {
                Err(SpectrumError::ErrorsLength {
                    source_id,
                    band,
                    n_coefficients: n,
                    n_errors: errors.len(),
                })
            }
        };
        let covariance = match &input.errors {
            CoefficientErrors::Covariance(cov) => cov.clone(),
            CoefficientErrors::Correlation {
                correlation,
                standard_errors,
            } => {
                check_errors(standard_errors)?;
                if correlation.dim() != (n, n) {
                    return Err(SpectrumError::CovarianceShape {
                        source_id,
                        band,
                        n_coefficients: n,
                        rows: correlation.nrows(),
                        cols: correlation.ncols(),
                    });
                }
                correlation_to_covariance(correlation.view(), standard_errors.view())
            }
            CoefficientErrors::PackedCorrelation {
                packed,
                standard_errors,
            } => {
                check_errors(standard_errors)?;
                let correlation = unpack_correlation(packed.view(), n).ok_or(
                    SpectrumError::PackedCorrelationLength {
                        source_id,
                        band,
                        n_coefficients: n,
                        found: packed.len(),
                    },
                )?;
                correlation_to_covariance(correlation.view(), standard_errors.view())
            }
        };
        Self::new(
            source_id,
            band,
            input.coefficients.clone(),
            covariance,
            input.scale,
        )
    }

    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    pub fn band(&self) -> Band {
        self.band
    }

    pub fn n_bases(&self) -> usize {
        self.coefficients.len()
    }

    pub fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.coefficients.view()
    }

    pub fn covariance(&self) -> ArrayView2<'_, f64> {
        self.covariance.view()
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// True when no coefficient carries a value (all NaN, or none at all).
    pub fn is_absent(&self) -> bool {
        self.coefficients.iter().all(|c| c.is_nan())
    }

    /// Leading `k` coefficients and the matching `k x k` covariance block.
    ///
    /// Both covariance axes are cut at the same index so the block stays square
    /// and symmetric.
    pub fn with_truncation(
        &self,
        truncation: TruncationLevel,
    ) -> (ArrayView1<'_, f64>, ArrayView2<'_, f64>) {
        let k = truncation.resolve(self.n_bases());
        (
            self.coefficients.slice(s![..k]),
            self.covariance.slice(s![..k, ..k]),
        )
    }
}

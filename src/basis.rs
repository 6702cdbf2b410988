use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1, Zip};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use thiserror::Error;

/// Configuration errors for basis families. Any of these aborts a batch before sampling.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("A basis family needs at least one basis function, but n_bases was {0}.")]
    ZeroBases(usize),

    #[error("Basis domain is invalid: min ({0}) must be finite and strictly less than max ({1}).")]
    InvalidDomain(f64, f64),

    #[error(
        "Normalised range is invalid: min ({0}) must be finite and strictly less than max ({1})."
    )]
    InvalidNormalization(f64, f64),

    #[error(
        "Transformation matrix must have {expected_rows} rows (one per basis function) and at least one column, but has shape {rows}x{cols}."
    )]
    TransformationShape {
        expected_rows: usize,
        rows: usize,
        cols: usize,
    },

    #[error("Transformation matrix contains non-finite entries.")]
    NonFiniteTransformation,

    #[error("Basis index {index} is out of range for a family of {n_bases} functions.")]
    IndexOutOfRange { index: usize, n_bases: usize },

    #[error("Cannot build a design matrix on an empty sampling grid.")]
    EmptyGrid,

    #[error("Design matrix has {expected} columns but {found} grid positions were given.")]
    GridLength { expected: usize, found: usize },

    #[error("Invalid basis configuration: {0}")]
    InvalidConfig(String),
}

/// Analytic family a band's basis is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BasisKind {
    /// Hermite functions: Hermite polynomials under a Gaussian envelope.
    Hermite,
    /// Orthonormal Legendre polynomials.
    Legendre,
}

impl BasisKind {
    pub fn name(self) -> &'static str {
        match self {
            BasisKind::Hermite => "hermite",
            BasisKind::Legendre => "legendre",
        }
    }

    /// Evaluator for the first `dimension` functions of this family.
    pub fn family(self, dimension: usize) -> Box<dyn BasisFamily> {
        match self {
            BasisKind::Hermite => Box::new(HermiteFunctions { dimension }),
            BasisKind::Legendre => Box::new(LegendrePolynomials { dimension }),
        }
    }
}

impl fmt::Display for BasisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A family of basis functions evaluated in normalised coordinates.
///
/// Implementations fill all `dimension()` functions at a point at once so that
/// recurrences are walked a single time per abscissa.
pub trait BasisFamily: Send + Sync {
    fn dimension(&self) -> usize;

    /// Writes `phi_0(x) ..= phi_{dimension-1}(x)` into `out`.
    fn evaluate_into(&self, x: f64, out: ArrayViewMut1<'_, f64>);

    fn evaluate(&self, index: usize, x: f64) -> Result<f64, BasisError> {
        let n = self.dimension();
        if index >= n {
            return Err(BasisError::IndexOutOfRange { index, n_bases: n });
        }
        let mut buf = Array1::<f64>::zeros(n);
        self.evaluate_into(x, buf.view_mut());
        Ok(buf[index])
    }

    /// Evaluates every function on every abscissa; result is `[dimension, xs.len()]`.
    fn evaluate_grid(&self, xs: ArrayView1<'_, f64>) -> Array2<f64> {
        let mut out = Array2::<f64>::zeros((self.dimension(), xs.len()));
        Zip::from(out.columns_mut())
            .and(&xs)
            .par_for_each(|col, &x| self.evaluate_into(x, col));
        out
    }
}

/// Hermite functions `psi_n(x) = (2^n n! sqrt(pi))^{-1/2} H_n(x) exp(-x^2/2)`.
///
/// Evaluated through the normalised three-term recurrence
/// `psi_n = sqrt(2/n) x psi_{n-1} - sqrt((n-1)/n) psi_{n-2}`, which never forms
/// the raw polynomial and so stays stable at high order.
#[derive(Debug, Clone, Copy)]
pub struct HermiteFunctions {
    pub dimension: usize,
}

impl BasisFamily for HermiteFunctions {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn evaluate_into(&self, x: f64, mut out: ArrayViewMut1<'_, f64>) {
        let n = self.dimension.min(out.len());
        if n == 0 {
            return;
        }
        let envelope = PI.powf(-0.25) * (-0.5 * x * x).exp();
        out[0] = envelope;
        if n == 1 {
            return;
        }
        out[1] = std::f64::consts::SQRT_2 * x * envelope;
        for i in 2..n {
            let fi = i as f64;
            out[i] = (2.0 / fi).sqrt() * x * out[i - 1] - ((fi - 1.0) / fi).sqrt() * out[i - 2];
        }
    }
}

/// Legendre polynomials scaled to unit L2 norm on `[-1, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct LegendrePolynomials {
    pub dimension: usize,
}

impl BasisFamily for LegendrePolynomials {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn evaluate_into(&self, x: f64, mut out: ArrayViewMut1<'_, f64>) {
        let n = self.dimension.min(out.len());
        if n == 0 {
            return;
        }
        // Bonnet: (k+1) P_{k+1} = (2k+1) x P_k - k P_{k-1}
        let mut p_prev = 1.0;
        out[0] = p_prev * 0.5_f64.sqrt();
        if n == 1 {
            return;
        }
        let mut p_curr = x;
        out[1] = p_curr * 1.5_f64.sqrt();
        for k in 1..n - 1 {
            let fk = k as f64;
            let p_next = ((2.0 * fk + 1.0) * x * p_curr - fk * p_prev) / (fk + 1.0);
            p_prev = p_curr;
            p_curr = p_next;
            out[k + 1] = p_curr * ((2.0 * (fk + 1.0) + 1.0) / 2.0).sqrt();
        }
    }
}

/// Affine map from the physical domain onto the family's natural coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationRange {
    pub min: f64,
    pub max: f64,
}

/// Immutable description of one band's basis family.
///
/// Equality is by content; two equal configs produce bit-identical design
/// matrices on the same grid.
#[derive(Debug, Clone, PartialEq)]
pub struct BasisConfig {
    kind: BasisKind,
    n_bases: usize,
    domain_min: f64,
    domain_max: f64,
    normalization: NormalizationRange,
    /// `[n_bases, raw_dimension]`; maps raw family functions onto the published basis.
    transformation: Option<Array2<f64>>,
}

impl BasisConfig {
    pub fn new(
        kind: BasisKind,
        n_bases: usize,
        domain: (f64, f64),
        normalization: NormalizationRange,
    ) -> Result<Self, BasisError> {
        if n_bases == 0 {
            return Err(BasisError::ZeroBases(n_bases));
        }
        let (domain_min, domain_max) = domain;
        if !(domain_min.is_finite() && domain_max.is_finite()) || domain_min >= domain_max {
            return Err(BasisError::InvalidDomain(domain_min, domain_max));
        }
        if !(normalization.min.is_finite() && normalization.max.is_finite())
            || normalization.min >= normalization.max
        {
            return Err(BasisError::InvalidNormalization(
                normalization.min,
                normalization.max,
            ));
        }
        Ok(Self {
            kind,
            n_bases,
            domain_min,
            domain_max,
            normalization,
            transformation: None,
        })
    }

    /// Attaches a `[n_bases, raw_dimension]` transformation applied after raw evaluation.
    pub fn with_transformation(mut self, transformation: Array2<f64>) -> Result<Self, BasisError> {
        let (rows, cols) = transformation.dim();
        if rows != self.n_bases || cols == 0 {
            return Err(BasisError::TransformationShape {
                expected_rows: self.n_bases,
                rows,
                cols,
            });
        }
        if transformation.iter().any(|v| !v.is_finite()) {
            return Err(BasisError::NonFiniteTransformation);
        }
        self.transformation = Some(transformation);
        Ok(self)
    }

    pub fn kind(&self) -> BasisKind {
        self.kind
    }

    pub fn n_bases(&self) -> usize {
        self.n_bases
    }

    pub fn domain(&self) -> (f64, f64) {
        (self.domain_min, self.domain_max)
    }

    pub fn normalization(&self) -> NormalizationRange {
        self.normalization
    }

    pub fn transformation(&self) -> Option<&Array2<f64>> {
        self.transformation.as_ref()
    }

    /// Number of raw family functions evaluated before the transformation.
    pub fn raw_dimension(&self) -> usize {
        self.transformation
            .as_ref()
            .map_or(self.n_bases, |t| t.ncols())
    }

    /// Maps a physical position onto normalised coordinates.
    pub fn normalize(&self, x: f64) -> f64 {
        let scale = (self.normalization.max - self.normalization.min)
            / (self.domain_max - self.domain_min);
        let offset = self.normalization.min - self.domain_min * scale;
        x * scale + offset
    }

    /// Flat bit pattern of every field; used as a content key.
    pub(crate) fn fingerprint(&self) -> Vec<u64> {
        let mut bits = vec![
            self.kind as u64,
            self.n_bases as u64,
            self.domain_min.to_bits(),
            self.domain_max.to_bits(),
            self.normalization.min.to_bits(),
            self.normalization.max.to_bits(),
        ];
        if let Some(t) = &self.transformation {
            bits.push(t.nrows() as u64);
            bits.push(t.ncols() as u64);
            bits.extend(t.iter().map(|v| v.to_bits()));
        }
        bits
    }

    pub fn evaluator(&self) -> BasisEvaluator<'_> {
        BasisEvaluator {
            config: self,
            family: self.kind.family(self.raw_dimension()),
        }
    }
}

/// Evaluates a configured basis at physical positions.
pub struct BasisEvaluator<'a> {
    config: &'a BasisConfig,
    family: Box<dyn BasisFamily>,
}

impl BasisEvaluator<'_> {
    pub fn n_bases(&self) -> usize {
        self.config.n_bases
    }

    /// Value of basis `basis_index` at physical position `x`.
    pub fn evaluate(&self, basis_index: usize, x: f64) -> Result<f64, BasisError> {
        let n = self.config.n_bases;
        if basis_index >= n {
            return Err(BasisError::IndexOutOfRange {
                index: basis_index,
                n_bases: n,
            });
        }
        let u = self.config.normalize(x);
        match &self.config.transformation {
            None => self.family.evaluate(basis_index, u),
            Some(t) => {
                let mut raw = Array1::<f64>::zeros(self.family.dimension());
                self.family.evaluate_into(u, raw.view_mut());
                Ok(t.row(basis_index).dot(&raw))
            }
        }
    }

    /// Values of basis `basis_index` over a whole grid.
    ///
    /// Only the functions up to `basis_index` are walked, or with a
    /// transformation its single row is applied to the raw grid.
    pub fn evaluate_vectorized(
        &self,
        basis_index: usize,
        xs: ArrayView1<'_, f64>,
    ) -> Result<Array1<f64>, BasisError> {
        let n = self.config.n_bases;
        if basis_index >= n {
            return Err(BasisError::IndexOutOfRange {
                index: basis_index,
                n_bases: n,
            });
        }
        let normalized = xs.mapv(|x| self.config.normalize(x));
        match &self.config.transformation {
            None => {
                let prefix = self.config.kind.family(basis_index + 1);
                let values = prefix.evaluate_grid(normalized.view());
                Ok(values.row(basis_index).to_owned())
            }
            Some(t) => {
                let raw = self.family.evaluate_grid(normalized.view());
                Ok(t.row(basis_index).dot(&raw))
            }
        }
    }

    /// Every basis over a whole grid, shape `[n_bases, xs.len()]`.
    pub fn evaluate_all(&self, xs: ArrayView1<'_, f64>) -> Array2<f64> {
        let normalized = xs.mapv(|x| self.config.normalize(x));
        let raw = self.family.evaluate_grid(normalized.view());
        match &self.config.transformation {
            None => raw,
            Some(t) => t.dot(&raw),
        }
    }
}

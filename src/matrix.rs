use crate::basis::{BasisConfig, BasisError};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};
use std::collections::HashMap;
use std::sync::Arc;

#[inline]
fn dense_transpose_matvec(matrix: ArrayView2<'_, f64>, vector: ArrayView1<'_, f64>) -> Array1<f64> {
    let nrows = matrix.nrows();
    let ncols = matrix.ncols();
    let mut out = Array1::<f64>::zeros(ncols);

    if ncols == 0 || nrows == 0 {
        return out;
    }

    if matrix.is_standard_layout()
        && let (Some(ms), Some(vs), Some(os)) = (
            matrix.as_slice_memory_order(),
            vector.as_slice(),
            out.as_slice_mut(),
        )
    {
        for (i, row) in ms.chunks_exact(ncols).enumerate() {
            let vi = vs[i];
            for j in 0..ncols {
                os[j] += row[j] * vi;
            }
        }
        return out;
    }

    for i in 0..nrows {
        let vi = vector[i];
        for j in 0..ncols {
            out[j] += matrix[[i, j]] * vi;
        }
    }
    out
}

/// Basis functions sampled on a grid, shape `[n_bases, n_samples]`.
///
/// Row `i` holds basis `i` over the whole grid. Immutable once built and
/// shared read-only between every source sampled with the same config.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignMatrix {
    positions: Arc<Array1<f64>>,
    values: Array2<f64>,
}

impl DesignMatrix {
    /// Wraps a precomputed matrix sampled at `positions`.
    pub fn from_array(positions: Array1<f64>, values: Array2<f64>) -> Result<Self, BasisError> {
        if positions.len() != values.ncols() {
            return Err(BasisError::GridLength {
                expected: values.ncols(),
                found: positions.len(),
            });
        }
        Ok(Self {
            positions: Arc::new(positions),
            values,
        })
    }

    /// Grid the columns were sampled at.
    pub fn positions(&self) -> &Arc<Array1<f64>> {
        &self.positions
    }

    /// Number of basis functions (rows).
    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    /// Number of sample points (columns).
    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    /// The first `k` rows, i.e. the design restricted to the leading `k` bases.
    pub fn leading(&self, k: usize) -> ArrayView2<'_, f64> {
        let k = k.min(self.nrows());
        self.values.slice(s![..k, ..])
    }

    /// `weights^T * D[..k]`, the weighted sum of the leading `weights.len()` bases.
    pub fn combine(&self, weights: ArrayView1<'_, f64>) -> Array1<f64> {
        dense_transpose_matvec(self.leading(weights.len()), weights)
    }
}

/// Builds the design matrix of `config` on `grid`.
///
/// Deterministic: equal inputs give bit-identical outputs.
pub fn build_design_matrix(
    config: &BasisConfig,
    grid: ArrayView1<'_, f64>,
) -> Result<DesignMatrix, BasisError> {
    if grid.is_empty() {
        return Err(BasisError::EmptyGrid);
    }
    if config.n_bases() == 0 {
        return Err(BasisError::ZeroBases(0));
    }
    let values = config.evaluator().evaluate_all(grid);
    log::debug!(
        "built {} design matrix: {} bases x {} samples",
        config.kind(),
        values.nrows(),
        values.ncols()
    );
    Ok(DesignMatrix {
        positions: Arc::new(grid.to_owned()),
        values,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DesignKey {
    config: Vec<u64>,
    grid: Vec<u64>,
}

impl DesignKey {
    fn new(config: &BasisConfig, grid: ArrayView1<'_, f64>) -> Self {
        Self {
            config: config.fingerprint(),
            grid: grid.iter().map(|v| v.to_bits()).collect(),
        }
    }
}

/// Memoizes design matrices by `(config, grid)` content.
///
/// Populated before a batch starts; the returned `Arc`s are what workers share.
#[derive(Debug, Default)]
pub struct DesignMatrixCache {
    entries: HashMap<DesignKey, Arc<DesignMatrix>>,
}

impl DesignMatrixCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(
        &mut self,
        config: &BasisConfig,
        grid: ArrayView1<'_, f64>,
    ) -> Result<Arc<DesignMatrix>, BasisError> {
        let key = DesignKey::new(config, grid);
        if let Some(hit) = self.entries.get(&key) {
            log::debug!("design matrix cache hit ({} bases)", config.n_bases());
            return Ok(Arc::clone(hit));
        }
        let built = Arc::new(build_design_matrix(config, grid)?);
        self.entries.insert(key, Arc::clone(&built));
        Ok(built)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every cached matrix, e.g. when the batch configuration changes.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

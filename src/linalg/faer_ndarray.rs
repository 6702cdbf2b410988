use faer::linalg::matmul::matmul;
use faer::{Accum, Mat, MatRef, Par, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use std::marker::PhantomData;

#[inline]
fn should_use_faer_matmul(m: usize, n: usize, k: usize) -> bool {
    // Stay on ndarray for tiny products; switch to faer GEMM for moderate+ sizes.
    const MIN_DIM: usize = 32;
    const MIN_FLOP_SCALE: usize = 64 * 64;
    (m >= MIN_DIM || n >= MIN_DIM || k >= MIN_DIM)
        && m.saturating_mul(n).saturating_mul(k) >= MIN_FLOP_SCALE
}

#[inline]
fn parallelism_for(m: usize, n: usize, k: usize) -> Par {
    if m < 128 || n < 128 || k < 128 {
        Par::Seq
    } else {
        get_global_parallelism()
    }
}

/// Compute A^T * B using faer's GEMM.
/// For A of shape (n, p) and B of shape (n, q), this computes the (p, q) result.
#[inline]
pub fn fast_atb<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    b: &ArrayBase<S2, Ix2>,
) -> Array2<f64> {
    let (n_a, p) = a.dim();
    let (n_b, q) = b.dim();
    debug_assert_eq!(n_a, n_b, "A and B must have same number of rows");

    if !should_use_faer_matmul(p, q, n_a) {
        return a.t().dot(b);
    }

    let mut result = Mat::<f64>::zeros(p, q);
    let a_view = FaerArrayView::new(a);
    let b_view = FaerArrayView::new(b);
    matmul(
        result.as_mut(),
        Accum::Replace,
        a_view.as_ref().transpose(),
        b_view.as_ref(),
        1.0,
        parallelism_for(p, q, n_a),
    );
    mat_to_array(result.as_ref())
}

/// Compute A * B using faer's GEMM.
/// For A of shape (n, p) and B of shape (p, q), this computes the (n, q) result.
#[inline]
pub fn fast_ab<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    b: &ArrayBase<S2, Ix2>,
) -> Array2<f64> {
    let (n, p) = a.dim();
    let (p_b, q) = b.dim();
    debug_assert_eq!(p, p_b, "A and B must have compatible inner dimensions");

    if !should_use_faer_matmul(n, q, p) {
        return a.dot(b);
    }

    let mut result = Mat::<f64>::zeros(n, q);
    let a_view = FaerArrayView::new(a);
    let b_view = FaerArrayView::new(b);
    matmul(
        result.as_mut(),
        Accum::Replace,
        a_view.as_ref(),
        b_view.as_ref(),
        1.0,
        parallelism_for(n, q, p),
    );
    mat_to_array(result.as_ref())
}

/// Propagates a covariance through a linear map: returns `D^T * S * D`.
///
/// `d` is `(k, m)`, `s` is `(k, k)`; the `(m, m)` result is symmetrized so that
/// round-off in the GEMM cannot leave it asymmetric.
pub fn congruence<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    d: &ArrayBase<S1, Ix2>,
    s: &ArrayBase<S2, Ix2>,
) -> Array2<f64> {
    let sd = fast_ab(s, d);
    let mut out = fast_atb(d, &sd);
    let m = out.nrows();
    for i in 0..m {
        for j in (i + 1)..m {
            let avg = 0.5 * (out[[i, j]] + out[[j, i]]);
            out[[i, j]] = avg;
            out[[j, i]] = avg;
        }
    }
    out
}

/// Diagonal of `D^T * S * D` without forming the `(m, m)` product.
pub fn congruence_diag<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    d: &ArrayBase<S1, Ix2>,
    s: &ArrayBase<S2, Ix2>,
) -> Array1<f64> {
    let sd = fast_ab(s, d);
    let m = d.ncols();
    let mut out = Array1::<f64>::zeros(m);
    for j in 0..m {
        out[j] = d.column(j).dot(&sd.column(j));
    }
    out
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((mat.nrows(), mat.ncols()));
    for j in 0..mat.ncols() {
        for i in 0..mat.nrows() {
            out[[i, j]] = mat[(i, j)];
        }
    }
    out
}

pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        // Negative or zero strides can alias or reverse traversal, which faer
        // kernels do not expect; materialize a compact copy instead.
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }

        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = if let Some(owned) = &self.owned {
            let strides = owned.strides();
            (
                owned.as_ptr(),
                owned.nrows(),
                owned.ncols(),
                strides[0],
                strides[1],
            )
        } else {
            (
                self.ptr,
                self.rows,
                self.cols,
                self.row_stride,
                self.col_stride,
            )
        };
        // SAFETY: pointer/shape/strides either come directly from a live ndarray
        // view with positive strides, or from an owned compact copy stored inside
        // this wrapper, which guarantees validity for the returned view lifetime.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}

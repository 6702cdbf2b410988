//! Pseudo-wavelength to wavelength conversion.
//!
//! Each band carries a tabulated dispersion relation; both directions are
//! interpolated with not-a-knot cubic splines and extrapolated with the
//! boundary segment's cubic outside the table.

use crate::types::Band;
use ndarray::{Array1, ArrayView1};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispersionError {
    #[error("dispersion table for {band} needs at least 2 finite rows, found {found}")]
    TooFewPoints { band: Band, found: usize },

    #[error("dispersion table for {band} repeats abscissa {value}")]
    DuplicateAbscissa { band: Band, value: f64 },

    #[error("dispersion table columns differ in length: wl_nm={wl}, bp_pwl={bp}, rp_pwl={rp}")]
    ColumnLength { wl: usize, bp: usize, rp: usize },

    #[error("failed to read dispersion table '{path}': {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
}

/// Not-a-knot cubic spline through `(xs, ys)` with `xs` strictly increasing.
///
/// The third derivative is continuous at the second and second-to-last knots,
/// so a table sampled from a cubic is reproduced exactly. Three points give
/// the interpolating parabola and two a straight line.
#[derive(Debug, Clone, PartialEq)]
struct CubicSpline {
    xs: Vec<f64>,
    ys: Vec<f64>,
    y2s: Vec<f64>,
}

impl CubicSpline {
    /// Sorts the pairs by abscissa and solves for the second derivatives at the knots.
    fn fit(band: Band, mut points: Vec<(f64, f64)>) -> Result<Self, DispersionError> {
        points.retain(|(x, y)| x.is_finite() && y.is_finite());
        if points.len() < 2 {
            return Err(DispersionError::TooFewPoints {
                band,
                found: points.len(),
            });
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        if let Some(w) = points.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(DispersionError::DuplicateAbscissa {
                band,
                value: w[0].0,
            });
        }
        let (xs, ys): (Vec<f64>, Vec<f64>) = points.into_iter().unzip();
        let y2s = not_a_knot_second_derivatives(&xs, &ys);
        Ok(Self { xs, ys, y2s })
    }

    fn evaluate(&self, x: f64) -> f64 {
        if x.is_nan() {
            return f64::NAN;
        }
        let n = self.xs.len();
        // Outside the table the first or last segment's cubic continues.
        let mut lo = 0;
        let mut hi = n - 1;
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            if self.xs[mid] > x {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        let h = self.xs[hi] - self.xs[lo];
        let a = (self.xs[hi] - x) / h;
        let b = (x - self.xs[lo]) / h;
        a * self.ys[lo]
            + b * self.ys[hi]
            + ((a * a * a - a) * self.y2s[lo] + (b * b * b - b) * self.y2s[hi]) * h * h / 6.0
    }
}

fn not_a_knot_second_derivatives(xs: &[f64], ys: &[f64]) -> Vec<f64> {
    let n = xs.len();
    let h: Vec<f64> = xs.windows(2).map(|w| w[1] - w[0]).collect();
    let slope: Vec<f64> = (0..n - 1).map(|i| (ys[i + 1] - ys[i]) / h[i]).collect();
    match n {
        2 => return vec![0.0; 2],
        3 => return vec![2.0 * (slope[1] - slope[0]) / (xs[2] - xs[0]); 3],
        _ => {}
    }

    // Continuity equations for the interior knots 1..=n-2, with the end
    // second derivatives eliminated through the not-a-knot conditions.
    let m = n - 2;
    let mut sub = vec![0.0; m];
    let mut diag = vec![0.0; m];
    let mut sup = vec![0.0; m];
    let mut rhs = vec![0.0; m];
    for r in 0..m {
        let i = r + 1;
        sub[r] = h[i - 1];
        diag[r] = 2.0 * (h[i - 1] + h[i]);
        sup[r] = h[i];
        rhs[r] = 6.0 * (slope[i] - slope[i - 1]);
    }
    let (h0, h1) = (h[0], h[1]);
    diag[0] = (h0 + h1) * (h0 + 2.0 * h1) / h1;
    sup[0] = (h1 - h0) * (h1 + h0) / h1;
    let (a, b) = (h[n - 3], h[n - 2]);
    diag[m - 1] = (a + b) * (2.0 * a + b) / a;
    sub[m - 1] = (a - b) * (a + b) / a;

    // Thomas sweep.
    for r in 1..m {
        let w = sub[r] / diag[r - 1];
        diag[r] -= w * sup[r - 1];
        rhs[r] -= w * rhs[r - 1];
    }
    let mut inner = vec![0.0; m];
    inner[m - 1] = rhs[m - 1] / diag[m - 1];
    for r in (0..m - 1).rev() {
        inner[r] = (rhs[r] - sup[r] * inner[r + 1]) / diag[r];
    }

    let mut y2s = vec![0.0; n];
    y2s[1..n - 1].copy_from_slice(&inner);
    y2s[0] = ((h0 + h1) * y2s[1] - h0 * y2s[2]) / h1;
    y2s[n - 1] = ((a + b) * y2s[n - 2] - b * y2s[n - 3]) / a;
    y2s
}

#[derive(Debug, Clone, PartialEq)]
struct BandDispersion {
    pwl_to_wl: CubicSpline,
    wl_to_pwl: CubicSpline,
}

impl BandDispersion {
    fn fit(band: Band, wl: &[f64], pwl: &[f64]) -> Result<Self, DispersionError> {
        let forward: Vec<(f64, f64)> = pwl.iter().copied().zip(wl.iter().copied()).collect();
        let inverse: Vec<(f64, f64)> = wl.iter().copied().zip(pwl.iter().copied()).collect();
        Ok(Self {
            pwl_to_wl: CubicSpline::fit(band, forward)?,
            wl_to_pwl: CubicSpline::fit(band, inverse)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct DispersionRow {
    wl_nm: f64,
    bp_pwl: Option<f64>,
    rp_pwl: Option<f64>,
}

/// Dispersion relations of both bands, built once from a table and then read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct DispersionFunction {
    bp: BandDispersion,
    rp: BandDispersion,
}

impl DispersionFunction {
    /// Builds from aligned columns. Rows where a band's pseudo-wavelength is
    /// NaN are ignored for that band only.
    pub fn from_columns(wl_nm: &[f64], bp_pwl: &[f64], rp_pwl: &[f64]) -> Result<Self, DispersionError> {
        if wl_nm.len() != bp_pwl.len() || wl_nm.len() != rp_pwl.len() {
            return Err(DispersionError::ColumnLength {
                wl: wl_nm.len(),
                bp: bp_pwl.len(),
                rp: rp_pwl.len(),
            });
        }
        Ok(Self {
            bp: BandDispersion::fit(Band::Bp, wl_nm, bp_pwl)?,
            rp: BandDispersion::fit(Band::Rp, wl_nm, rp_pwl)?,
        })
    }

    /// Reads a CSV table with columns `wl_nm`, `bp_pwl`, `rp_pwl`.
    pub fn from_csv(path: &Path) -> Result<Self, DispersionError> {
        let csv_err = |source: csv::Error| DispersionError::Csv {
            path: path.display().to_string(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(csv_err)?;
        let mut wl = Vec::new();
        let mut bp = Vec::new();
        let mut rp = Vec::new();
        for row in reader.deserialize::<DispersionRow>() {
            let row = row.map_err(csv_err)?;
            wl.push(row.wl_nm);
            bp.push(row.bp_pwl.unwrap_or(f64::NAN));
            rp.push(row.rp_pwl.unwrap_or(f64::NAN));
        }
        log::debug!("read {} dispersion rows from {}", wl.len(), path.display());
        Self::from_columns(&wl, &bp, &rp)
    }

    fn band(&self, band: Band) -> &BandDispersion {
        match band {
            Band::Bp => &self.bp,
            Band::Rp => &self.rp,
        }
    }

    /// Absolute wavelength (nm) at each pseudo-wavelength.
    pub fn pwl_to_wl(&self, band: Band, pwl: ArrayView1<'_, f64>) -> Array1<f64> {
        let spline = &self.band(band).pwl_to_wl;
        pwl.mapv(|x| spline.evaluate(x))
    }

    /// Pseudo-wavelength at each absolute wavelength (nm).
    pub fn wl_to_pwl(&self, band: Band, wl: ArrayView1<'_, f64>) -> Array1<f64> {
        let spline = &self.band(band).wl_to_pwl;
        wl.mapv(|x| spline.evaluate(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::io::Write;

    fn linear_table() -> DispersionFunction {
        // bp: pwl decreasing with wavelength; rp increasing with a NaN gap.
        let wl: Vec<f64> = (0..8).map(|i| 330.0 + 50.0 * i as f64).collect();
        let bp: Vec<f64> = wl.iter().map(|w| 60.0 - (w - 330.0) / 10.0).collect();
        let mut rp: Vec<f64> = wl.iter().map(|w| (w - 330.0) / 5.0).collect();
        rp[0] = f64::NAN;
        DispersionFunction::from_columns(&wl, &bp, &rp).unwrap()
    }

    #[test]
    fn spline_passes_through_knots() {
        let spline = CubicSpline::fit(
            Band::Bp,
            vec![(1.0, 2.0), (2.0, 3.0), (3.0, 5.0), (4.0, 4.0), (5.0, 1.0)],
        )
        .unwrap();
        for (x, y) in [(1.0, 2.0), (2.0, 3.0), (3.0, 5.0), (4.0, 4.0), (5.0, 1.0)] {
            assert_abs_diff_eq!(spline.evaluate(x), y, epsilon = 1e-10);
        }
    }

    #[test]
    fn cubic_table_is_reproduced_inside_and_beyond() {
        let pwl: Vec<f64> = (0..7).map(f64::from).collect();
        let wl: Vec<f64> = pwl.iter().map(|p| 400.0 + p * p * p).collect();
        let d = DispersionFunction::from_columns(&wl, &pwl, &pwl).unwrap();
        let out = d.pwl_to_wl(Band::Bp, array![0.5, 5.5, 8.0, -1.0].view());
        for (got, want) in out.iter().zip([400.125, 566.375, 912.0, 399.0]) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-9);
        }

        // Uneven spacing with the minimum of four knots.
        let xs = [0.0, 0.5, 2.0, 3.5];
        let spline =
            CubicSpline::fit(Band::Rp, xs.iter().map(|&x| (x, 400.0 + x * x * x)).collect())
                .unwrap();
        for x in [0.25_f64, 1.0, 3.0, 5.0] {
            assert_abs_diff_eq!(spline.evaluate(x), 400.0 + x.powi(3), epsilon = 1e-9);
        }
    }

    #[test]
    fn three_points_give_the_parabola() {
        let spline =
            CubicSpline::fit(Band::Bp, vec![(0.0, 1.0), (1.0, 2.0), (3.0, 10.0)]).unwrap();
        for x in [-1.0_f64, 0.5, 2.0, 4.0] {
            assert_abs_diff_eq!(spline.evaluate(x), 1.0 + x * x, epsilon = 1e-10);
        }
    }

    #[test]
    fn linear_relation_is_reproduced_and_extrapolated() {
        let d = linear_table();
        let pwl = array![60.0, 45.0, 30.0, 70.0, -10.0];
        let wl = d.pwl_to_wl(Band::Bp, pwl.view());
        for (&p, &w) in pwl.iter().zip(wl.iter()) {
            assert_abs_diff_eq!(w, 330.0 + (60.0 - p) * 10.0, epsilon = 1e-8);
        }
        let back = d.wl_to_pwl(Band::Bp, wl.view());
        for (a, b) in back.iter().zip(pwl.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-8);
        }

        let rp = d.pwl_to_wl(Band::Rp, array![20.0].view());
        assert_abs_diff_eq!(rp[0], 430.0, epsilon = 1e-8);
        assert!(d.pwl_to_wl(Band::Rp, array![f64::NAN].view())[0].is_nan());
    }

    #[test]
    fn malformed_tables_are_rejected() {
        assert!(matches!(
            DispersionFunction::from_columns(&[1.0, 2.0], &[1.0], &[1.0, 2.0]),
            Err(DispersionError::ColumnLength { .. })
        ));
        assert!(matches!(
            DispersionFunction::from_columns(&[1.0, 2.0], &[5.0, 6.0], &[f64::NAN, 1.0]),
            Err(DispersionError::TooFewPoints {
                band: Band::Rp,
                found: 1
            })
        ));
        assert!(matches!(
            DispersionFunction::from_columns(&[1.0, 1.0], &[5.0, 6.0], &[1.0, 2.0]),
            Err(DispersionError::DuplicateAbscissa { band: Band::Bp, .. })
        ));
    }

    #[test]
    fn reads_csv_with_missing_rp_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "wl_nm,bp_pwl,rp_pwl").unwrap();
        writeln!(file, "330,60,").unwrap();
        writeln!(file, "430,50,0").unwrap();
        writeln!(file, "530,40,20").unwrap();
        writeln!(file, "630,30,40").unwrap();
        file.flush().unwrap();
        let d = DispersionFunction::from_csv(file.path()).unwrap();
        let w = d.pwl_to_wl(Band::Bp, array![55.0].view());
        assert_abs_diff_eq!(w[0], 380.0, epsilon = 1e-8);
        let p = d.wl_to_pwl(Band::Rp, array![480.0].view());
        assert_abs_diff_eq!(p[0], 10.0, epsilon = 1e-8);
    }
}

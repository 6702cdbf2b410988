use ndarray::{Array1, ArrayView1};
use thiserror::Error;

/// Pseudo-wavelength interval sampling grids must lie in.
pub const DEFAULT_SAMPLING_DOMAIN: (f64, f64) = (-10.0, 70.0);

/// Default grid: 600 evenly spaced positions over `[0, 60]`.
pub const DEFAULT_GRID_START: f64 = 0.0;
pub const DEFAULT_GRID_STOP: f64 = 60.0;
pub const DEFAULT_GRID_POINTS: usize = 600;

/// Grid problems. The grid is shared by every source, so any of these aborts the batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GridError {
    #[error("Sampling grid is empty.")]
    Empty,

    #[error("Sampling grid position {index} is not finite ({value}).")]
    NonFinite { index: usize, value: f64 },

    #[error("Sampling grid must be strictly monotonic; positions {index} and {next} break the order.", next = .index + 1)]
    NotMonotonic { index: usize },

    #[error("Sampling grid spans [{min}, {max}], outside the allowed domain [{domain_min}, {domain_max}].")]
    OutOfDomain {
        min: f64,
        max: f64,
        domain_min: f64,
        domain_max: f64,
    },

    #[error("Invalid grid specification '{0}': expected 'start:stop:count' with count >= 1.")]
    InvalidSpec(String),
}

pub fn default_grid() -> Array1<f64> {
    Array1::linspace(DEFAULT_GRID_START, DEFAULT_GRID_STOP, DEFAULT_GRID_POINTS)
}

/// Checks a caller-supplied grid: non-empty, finite, strictly monotonic (either
/// direction) and inside `domain`.
pub fn validate_grid(grid: ArrayView1<'_, f64>, domain: (f64, f64)) -> Result<(), GridError> {
    if grid.is_empty() {
        return Err(GridError::Empty);
    }
    for (index, &value) in grid.iter().enumerate() {
        if !value.is_finite() {
            return Err(GridError::NonFinite { index, value });
        }
    }
    if grid.len() > 1 {
        let increasing = grid[1] > grid[0];
        for index in 0..grid.len() - 1 {
            let (a, b) = (grid[index], grid[index + 1]);
            let ordered = if increasing { b > a } else { b < a };
            if !ordered {
                return Err(GridError::NotMonotonic { index });
            }
        }
    }
    let min = grid.iter().copied().fold(f64::INFINITY, f64::min);
    let max = grid.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let (domain_min, domain_max) = domain;
    if min < domain_min || max > domain_max {
        return Err(GridError::OutOfDomain {
            min,
            max,
            domain_min,
            domain_max,
        });
    }
    Ok(())
}

/// Parses `start:stop:count` into an evenly spaced, endpoint-inclusive grid.
pub fn parse_grid_spec(spec: &str) -> Result<Array1<f64>, GridError> {
    let invalid = || GridError::InvalidSpec(spec.to_string());
    let parts: Vec<&str> = spec.split(':').map(str::trim).collect();
    let [start, stop, count] = parts.as_slice() else {
        return Err(invalid());
    };
    let start: f64 = start.parse().map_err(|_| invalid())?;
    let stop: f64 = stop.parse().map_err(|_| invalid())?;
    let count: usize = count.parse().map_err(|_| invalid())?;
    if count == 0 {
        return Err(invalid());
    }
    Ok(Array1::linspace(start, stop, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn default_grid_is_valid() {
        let g = default_grid();
        assert_eq!(g.len(), 600);
        assert_eq!(g[0], 0.0);
        assert!((g[599] - 60.0).abs() < 1e-12);
        assert!(validate_grid(g.view(), DEFAULT_SAMPLING_DOMAIN).is_ok());
    }

    #[test]
    fn rejects_bad_grids() {
        let domain = DEFAULT_SAMPLING_DOMAIN;
        assert_eq!(
            validate_grid(Array1::<f64>::zeros(0).view(), domain),
            Err(GridError::Empty)
        );
        assert!(matches!(
            validate_grid(array![0.0, f64::NAN].view(), domain),
            Err(GridError::NonFinite { index: 1, .. })
        ));
        assert_eq!(
            validate_grid(array![0.0, 1.0, 1.0].view(), domain),
            Err(GridError::NotMonotonic { index: 1 })
        );
        assert!(matches!(
            validate_grid(array![-11.0, 0.0].view(), domain),
            Err(GridError::OutOfDomain { .. })
        ));
        assert!(matches!(
            validate_grid(array![0.0, 70.5].view(), domain),
            Err(GridError::OutOfDomain { .. })
        ));
    }

    #[test]
    fn accepts_descending_and_single_point_grids() {
        let domain = DEFAULT_SAMPLING_DOMAIN;
        assert!(validate_grid(array![60.0, 30.0, -10.0].view(), domain).is_ok());
        assert!(validate_grid(array![70.0].view(), domain).is_ok());
    }

    #[test]
    fn parses_grid_specs() {
        let g = parse_grid_spec("0:60:7").unwrap();
        assert_eq!(g, array![0.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0]);
        assert!(parse_grid_spec("0:60").is_err());
        assert!(parse_grid_spec("0:60:0").is_err());
        assert!(parse_grid_spec("a:60:3").is_err());
    }
}

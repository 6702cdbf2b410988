use crate::basis::{BasisConfig, BasisError, BasisKind, NormalizationRange};
use crate::grid::DEFAULT_SAMPLING_DOMAIN;
use crate::types::Band;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Basis count of each band in the default table.
pub const DEFAULT_N_BASES: usize = 55;
/// Physical interval mapped onto the Hermite normalised range.
pub const DEFAULT_BASIS_RANGE: (f64, f64) = (0.0, 60.0);
pub const DEFAULT_NORMALIZED_RANGE: (f64, f64) = (-10.3, 10.3);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read basis configuration '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse basis configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("basis configuration has no entry for band '{0}'")]
    MissingBand(Band),

    #[error("band '{band}': {source}")]
    Basis {
        band: Band,
        #[source]
        source: BasisError,
    },

    #[error("sampling domain [{0}, {1}] is invalid")]
    InvalidDomain(f64, f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BandEntry {
    kind: BasisKind,
    n_bases: usize,
    range: [f64; 2],
    normalized_range: [f64; 2],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transformation: Option<Vec<Vec<f64>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableFile {
    #[serde(default = "default_domain")]
    sampling_domain: [f64; 2],
    bands: BTreeMap<Band, BandEntry>,
}

fn default_domain() -> [f64; 2] {
    [DEFAULT_SAMPLING_DOMAIN.0, DEFAULT_SAMPLING_DOMAIN.1]
}

fn nested_vec_to_array2(rows: &[Vec<f64>]) -> Result<Array2<f64>, BasisError> {
    let n = rows.len();
    let p = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != p) {
        return Err(BasisError::InvalidConfig(
            "transformation matrix rows have unequal lengths".to_string(),
        ));
    }
    let mut out = Array2::<f64>::zeros((n, p));
    for (i, row) in rows.iter().enumerate() {
        for (j, &v) in row.iter().enumerate() {
            out[[i, j]] = v;
        }
    }
    Ok(out)
}

fn array2_to_nested_vec(a: &Array2<f64>) -> Vec<Vec<f64>> {
    a.rows().into_iter().map(|r| r.to_vec()).collect()
}

impl BandEntry {
    fn to_config(&self) -> Result<BasisConfig, BasisError> {
        let config = BasisConfig::new(
            self.kind,
            self.n_bases,
            (self.range[0], self.range[1]),
            NormalizationRange {
                min: self.normalized_range[0],
                max: self.normalized_range[1],
            },
        )?;
        match &self.transformation {
            Some(rows) => config.with_transformation(nested_vec_to_array2(rows)?),
            None => Ok(config),
        }
    }

    fn from_config(config: &BasisConfig) -> Self {
        let (lo, hi) = config.domain();
        let norm = config.normalization();
        Self {
            kind: config.kind(),
            n_bases: config.n_bases(),
            range: [lo, hi],
            normalized_range: [norm.min, norm.max],
            transformation: config.transformation().map(array2_to_nested_vec),
        }
    }
}

/// Per-band basis definitions plus the domain sampling grids are validated against.
///
/// Loaded once and treated as immutable for the run.
#[derive(Debug, Clone, PartialEq)]
pub struct BasisTable {
    sampling_domain: (f64, f64),
    bp: BasisConfig,
    rp: BasisConfig,
}

impl BasisTable {
    pub fn new(
        sampling_domain: (f64, f64),
        bp: BasisConfig,
        rp: BasisConfig,
    ) -> Result<Self, ConfigError> {
        let (lo, hi) = sampling_domain;
        if !(lo.is_finite() && hi.is_finite()) || lo >= hi {
            return Err(ConfigError::InvalidDomain(lo, hi));
        }
        Ok(Self {
            sampling_domain,
            bp,
            rp,
        })
    }

    /// 55 Hermite functions per band over pseudo-wavelengths `[0, 60]`.
    pub fn default_xp() -> Self {
        let hermite = BasisConfig::new(
            BasisKind::Hermite,
            DEFAULT_N_BASES,
            DEFAULT_BASIS_RANGE,
            NormalizationRange {
                min: DEFAULT_NORMALIZED_RANGE.0,
                max: DEFAULT_NORMALIZED_RANGE.1,
            },
        );
        // The constants above always describe a valid family.
        match hermite {
            Ok(cfg) => Self {
                sampling_domain: DEFAULT_SAMPLING_DOMAIN,
                bp: cfg.clone(),
                rp: cfg,
            },
            Err(e) => unreachable!("default basis table is invalid: {e}"),
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let file: TableFile = serde_json::from_str(text)?;
        let band_config = |band: Band| -> Result<BasisConfig, ConfigError> {
            let entry = file.bands.get(&band).ok_or(ConfigError::MissingBand(band))?;
            entry
                .to_config()
                .map_err(|source| ConfigError::Basis { band, source })
        };
        let bp = band_config(Band::Bp)?;
        let rp = band_config(Band::Rp)?;
        Self::new((file.sampling_domain[0], file.sampling_domain[1]), bp, rp)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let table = Self::from_json_str(&text)?;
        log::info!("loaded basis configuration from {}", path.display());
        Ok(table)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        let bands = Band::ALL
            .iter()
            .map(|&b| (b, BandEntry::from_config(self.get(b))))
            .collect();
        let file = TableFile {
            sampling_domain: [self.sampling_domain.0, self.sampling_domain.1],
            bands,
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    pub fn sampling_domain(&self) -> (f64, f64) {
        self.sampling_domain
    }

    pub fn get(&self, band: Band) -> &BasisConfig {
        match band {
            Band::Bp => &self.bp,
            Band::Rp => &self.rp,
        }
    }
}

impl Default for BasisTable {
    fn default() -> Self {
        Self::default_xp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_has_both_bands() {
        let t = BasisTable::default_xp();
        for band in Band::ALL {
            let cfg = t.get(band);
            assert_eq!(cfg.n_bases(), DEFAULT_N_BASES);
            assert_eq!(cfg.kind(), BasisKind::Hermite);
        }
        assert_eq!(t.sampling_domain(), (-10.0, 70.0));
    }

    #[test]
    fn parses_json_with_transformation() {
        let text = r#"{
            "sampling_domain": [-5.0, 65.0],
            "bands": {
                "bp": {"kind": "hermite", "n_bases": 3, "range": [0.0, 60.0], "normalized_range": [-4.0, 4.0]},
                "rp": {"kind": "legendre", "n_bases": 2, "range": [0.0, 60.0], "normalized_range": [-1.0, 1.0],
                       "transformation": [[1.0, 0.0, 0.0], [0.0, 1.0, 1.0]]}
            }
        }"#;
        let t = BasisTable::from_json_str(text).unwrap();
        assert_eq!(t.sampling_domain(), (-5.0, 65.0));
        assert_eq!(t.get(Band::Bp).n_bases(), 3);
        assert_eq!(t.get(Band::Rp).kind(), BasisKind::Legendre);
        assert_eq!(t.get(Band::Rp).raw_dimension(), 3);

        let again = BasisTable::from_json_str(&t.to_json_string().unwrap()).unwrap();
        assert_eq!(again, t);
    }

    #[test]
    fn missing_band_and_bad_entries_are_errors() {
        let only_bp = r#"{"bands": {"bp": {"kind": "hermite", "n_bases": 3, "range": [0, 60], "normalized_range": [-4, 4]}}}"#;
        assert!(matches!(
            BasisTable::from_json_str(only_bp),
            Err(ConfigError::MissingBand(Band::Rp))
        ));
        let zero = r#"{"bands": {
            "bp": {"kind": "hermite", "n_bases": 0, "range": [0, 60], "normalized_range": [-4, 4]},
            "rp": {"kind": "hermite", "n_bases": 3, "range": [0, 60], "normalized_range": [-4, 4]}}}"#;
        assert!(matches!(
            BasisTable::from_json_str(zero),
            Err(ConfigError::Basis {
                band: Band::Bp,
                source: BasisError::ZeroBases(0)
            })
        ));
        let unknown = r#"{"bands": {"bp": {"kind": "chebyshev", "n_bases": 3, "range": [0, 60], "normalized_range": [-4, 4]}}}"#;
        assert!(matches!(
            BasisTable::from_json_str(unknown),
            Err(ConfigError::Json(_))
        ));
    }
}

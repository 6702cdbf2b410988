//! CSV readers and writers for continuous and sampled spectra.
//!
//! Array-valued fields are written as `(a, b, c)`; `[a, b, c]` is accepted on
//! input. An empty coefficient field marks the band as absent.
//!
//! The flux scale of a band is read from `{band}_scale` only. Archive exports
//! also carry `{band}_standard_deviation`, the fit's standard deviation, which
//! rescales the coefficient covariance and not the flux; it is not read, and a
//! file with it but no `{band}_scale` is sampled with scale 1 after a warning.

use crate::convert::SampledSpectraTable;
use crate::dispersion::DispersionFunction;
use crate::matrix::DesignMatrix;
use crate::spectrum::{BandInput, CoefficientErrors, SourceRecord};
use crate::types::Band;
use ndarray::{Array1, Array2};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("CSV error in '{path}': {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("'{path}' is missing required column '{column}'")]
    MissingColumn { path: String, column: String },

    #[error("line {line}, column '{column}': {message}")]
    Field {
        line: u64,
        column: String,
        message: String,
    },

    #[error("line {line}: {band} has coefficients but no covariance or coefficient errors")]
    MissingErrors { line: u64, band: Band },
}

fn csv_error(path: &Path) -> impl Fn(csv::Error) -> InputError + '_ {
    move |source| InputError::Csv {
        path: path.display().to_string(),
        source,
    }
}

/// Parses `(a, b, c)`, `[a, b, c]` or a bare comma-separated list.
///
/// Returns `None` for an empty field.
pub fn parse_array(text: &str) -> Result<Option<Array1<f64>>, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let inner = trimmed
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .or_else(|| trimmed.strip_prefix('[').and_then(|t| t.strip_suffix(']')))
        .unwrap_or(trimmed)
        .trim();
    if inner.is_empty() {
        return Ok(Some(Array1::zeros(0)));
    }
    inner
        .split(',')
        .map(|v| {
            let v = v.trim();
            v.parse::<f64>()
                .map_err(|_| format!("'{v}' is not a number"))
        })
        .collect::<Result<Vec<f64>, String>>()
        .map(|values| Some(Array1::from(values)))
}

pub fn format_array<'a>(values: impl IntoIterator<Item = &'a f64>) -> String {
    let parts: Vec<String> = values.into_iter().map(|v| v.to_string()).collect();
    format!("({})", parts.join(", "))
}

/// Packed row-major `n x n` matrix, or a `1 x len` stand-in when `len` is not a
/// perfect square so the shape check downstream reports it against the source.
fn square_from_packed(values: Array1<f64>) -> Array2<f64> {
    let len = values.len();
    let n = (len as f64).sqrt().round() as usize;
    let shape = if n * n == len { (n, n) } else { (1, len) };
    Array2::from_shape_vec(shape, values.to_vec()).unwrap_or_else(|_| Array2::zeros((0, 0)))
}

struct Columns {
    index: HashMap<String, usize>,
}

impl Columns {
    fn new(headers: &csv::StringRecord) -> Self {
        let index = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim().to_ascii_lowercase(), i))
            .collect();
        Self { index }
    }

    fn get<'r>(&self, row: &'r csv::StringRecord, name: &str) -> Option<&'r str> {
        self.index
            .get(name)
            .and_then(|&i| row.get(i))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

fn field_error(line: u64, column: &str, message: impl Into<String>) -> InputError {
    InputError::Field {
        line,
        column: column.to_string(),
        message: message.into(),
    }
}

fn array_field(
    columns: &Columns,
    row: &csv::StringRecord,
    line: u64,
    name: &str,
) -> Result<Option<Array1<f64>>, InputError> {
    match columns.get(row, name) {
        Some(text) => parse_array(text).map_err(|m| field_error(line, name, m)),
        None => Ok(None),
    }
}

fn read_band(
    columns: &Columns,
    row: &csv::StringRecord,
    line: u64,
    band: Band,
) -> Result<Option<BandInput>, InputError> {
    let col = |suffix: &str| format!("{}_{suffix}", band.label());

    let Some(coefficients) = array_field(columns, row, line, &col("coefficients"))? else {
        return Ok(None);
    };
    if coefficients.is_empty() {
        return Ok(None);
    }

    let errors = if let Some(packed) = array_field(columns, row, line, &col("covariance_matrix"))? {
        CoefficientErrors::Covariance(square_from_packed(packed))
    } else {
        let standard_errors = array_field(columns, row, line, &col("coefficient_errors"))?
            .ok_or(InputError::MissingErrors { line, band })?;
        let packed = array_field(columns, row, line, &col("coefficient_correlations"))?
            .unwrap_or_else(|| Array1::zeros(0));
        if packed.is_empty() && standard_errors.len() > 1 {
            // No correlations given: treat the coefficients as independent.
            let n = standard_errors.len();
            CoefficientErrors::Correlation {
                correlation: Array2::eye(n),
                standard_errors,
            }
        } else {
            CoefficientErrors::PackedCorrelation {
                packed,
                standard_errors,
            }
        }
    };

    let scale_col = col("scale");
    let scale = match columns.get(row, &scale_col) {
        Some(text) => text
            .parse::<f64>()
            .map_err(|_| field_error(line, &scale_col, format!("'{text}' is not a number")))?,
        None => 1.0,
    };

    let relevant_col = col("n_relevant_bases");
    let n_relevant_bases = match columns.get(row, &relevant_col) {
        Some(text) => Some(parse_count(text).ok_or_else(|| {
            field_error(line, &relevant_col, format!("'{text}' is not a basis count"))
        })?),
        None => None,
    };

    Ok(Some(BandInput {
        coefficients,
        errors,
        scale,
        n_relevant_bases,
    }))
}

/// Accepts `12` as well as `12.0`, which float-typed exports produce.
fn parse_count(text: &str) -> Option<usize> {
    if let Ok(n) = text.parse::<usize>() {
        return Some(n);
    }
    let v = text.parse::<f64>().ok()?;
    (v >= 0.0 && v.fract() == 0.0 && v <= usize::MAX as f64).then_some(v as usize)
}

/// Reads every source row of a continuous-spectra CSV.
pub fn read_continuous_csv(path: &Path) -> Result<Vec<SourceRecord>, InputError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(csv_error(path))?;
    let headers = reader.headers().map_err(csv_error(path))?.clone();
    let columns = Columns::new(&headers);
    if !columns.index.contains_key("source_id") {
        return Err(InputError::MissingColumn {
            path: path.display().to_string(),
            column: "source_id".to_string(),
        });
    }

    for band in Band::ALL {
        let label = band.label();
        if columns.index.contains_key(&format!("{label}_standard_deviation"))
            && !columns.index.contains_key(&format!("{label}_scale"))
        {
            log::warn!(
                "{}: {label}_standard_deviation is not a flux scale and is ignored; \
                 {label} fluxes use scale 1 (add a {label}_scale column to rescale)",
                path.display()
            );
        }
    }

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(csv_error(path))?;
        let line = row.position().map_or(0, |p| p.line());
        let id_text = columns.get(&row, "source_id").unwrap_or_default();
        let source_id = id_text
            .parse::<u64>()
            .map_err(|_| field_error(line, "source_id", format!("'{id_text}' is not a source id")))?;
        records.push(SourceRecord {
            source_id,
            bp: read_band(&columns, &row, line, Band::Bp)?,
            rp: read_band(&columns, &row, line, Band::Rp)?,
        });
    }
    log::info!("read {} sources from {}", records.len(), path.display());
    Ok(records)
}

/// `out.csv` -> `out_sampling.csv`, next to the main output.
pub fn sampling_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output.with_file_name(format!("{stem}_sampling.csv"))
}

/// Writes one row per source: `source_id`, then per band flux, flux error and,
/// with `with_correlation`, the row-major correlation matrix.
pub fn write_sampled_csv(
    path: &Path,
    table: &SampledSpectraTable,
    with_correlation: bool,
) -> Result<(), InputError> {
    let mut writer = csv::WriterBuilder::new()
        .from_path(path)
        .map_err(csv_error(path))?;

    let mut header = vec!["source_id".to_string()];
    for band in Band::ALL {
        header.push(format!("{band}_flux"));
        header.push(format!("{band}_flux_error"));
        if with_correlation {
            header.push(format!("{band}_correlation"));
        }
    }
    writer.write_record(&header).map_err(csv_error(path))?;

    for row in &table.rows {
        let mut fields = vec![row.source_id.to_string()];
        for band in Band::ALL {
            let s = row.band(band);
            fields.push(format_array(&s.flux));
            fields.push(format_array(&s.flux_error));
            if with_correlation {
                fields.push(s.correlation.as_ref().map_or_else(String::new, |c| format_array(c)));
            }
        }
        writer.write_record(&fields).map_err(csv_error(path))?;
    }
    writer
        .flush()
        .map_err(|e| csv_error(path)(csv::Error::from(e)))?;
    Ok(())
}

/// Writes the grid, plus each band's absolute wavelength when a dispersion
/// function is supplied.
pub fn write_sampling_csv(
    path: &Path,
    positions: &Array1<f64>,
    dispersion: Option<&DispersionFunction>,
) -> Result<(), InputError> {
    let mut writer = csv::WriterBuilder::new()
        .from_path(path)
        .map_err(csv_error(path))?;
    let wavelengths: Vec<Array1<f64>> = dispersion
        .map(|d| {
            Band::ALL
                .iter()
                .map(|&b| d.pwl_to_wl(b, positions.view()))
                .collect()
        })
        .unwrap_or_default();

    let mut header = vec!["pwl".to_string()];
    if !wavelengths.is_empty() {
        header.extend(Band::ALL.iter().map(|b| format!("{b}_wl_nm")));
    }
    writer.write_record(&header).map_err(csv_error(path))?;
    for (i, p) in positions.iter().enumerate() {
        let mut fields = vec![p.to_string()];
        fields.extend(wavelengths.iter().map(|w| w[i].to_string()));
        writer.write_record(&fields).map_err(csv_error(path))?;
    }
    writer
        .flush()
        .map_err(|e| csv_error(path)(csv::Error::from(e)))?;
    Ok(())
}

/// Reads a grid from the `pwl` column (or the first column) of a CSV file.
pub fn read_sampling_csv(path: &Path) -> Result<Array1<f64>, InputError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(csv_error(path))?;
    let headers = reader.headers().map_err(csv_error(path))?.clone();
    let column = Columns::new(&headers).index.get("pwl").copied().unwrap_or(0);
    let mut values = Vec::new();
    for row in reader.records() {
        let row = row.map_err(csv_error(path))?;
        let line = row.position().map_or(0, |p| p.line());
        let text = row.get(column).unwrap_or_default().trim();
        let v = text
            .parse::<f64>()
            .map_err(|_| field_error(line, "pwl", format!("'{text}' is not a number")))?;
        values.push(v);
    }
    Ok(Array1::from(values))
}

/// Writes a design matrix as one row per grid position, one column per basis.
pub fn write_design_csv(path: &Path, design: &DesignMatrix) -> Result<(), InputError> {
    let mut writer = csv::WriterBuilder::new()
        .from_path(path)
        .map_err(csv_error(path))?;
    let mut header = vec!["pwl".to_string()];
    header.extend((0..design.nrows()).map(|i| format!("basis_{i}")));
    writer.write_record(&header).map_err(csv_error(path))?;
    let values = design.view();
    for (j, p) in design.positions().iter().enumerate() {
        let mut fields = vec![p.to_string()];
        fields.extend(values.column(j).iter().map(|v| v.to_string()));
        writer.write_record(&fields).map_err(csv_error(path))?;
    }
    writer
        .flush()
        .map_err(|e| csv_error(path)(csv::Error::from(e)))?;
    Ok(())
}

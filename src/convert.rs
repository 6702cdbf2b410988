//! Batch conversion of continuous spectra into sampled spectra.
//!
//! A [`Converter`] validates the grid and builds every design matrix before
//! the first row is touched; after that each source is sampled independently
//! against the shared, read-only matrices.

use crate::aggregate::{
    BandDesigns, BandError, MergedSpectrumRecord, ShapeErrorPolicy, SkippedBand, SourceOutcome,
    sample_source,
};
use crate::basis::BasisError;
use crate::config::{BasisTable, ConfigError};
use crate::dispersion::{DispersionError, DispersionFunction};
use crate::grid::{GridError, default_grid, validate_grid};
use crate::io::{
    InputError, read_continuous_csv, sampling_path, write_sampled_csv, write_sampling_csv,
};
use crate::matrix::DesignMatrixCache;
use crate::spectrum::SourceRecord;
use crate::types::{Band, SourceId, TruncationPolicy};
use ndarray::Array1;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid basis configuration: {0}")]
    Basis(#[from] BasisError),

    #[error("invalid sampling grid: {0}")]
    Grid(#[from] GridError),

    #[error(transparent)]
    Band(#[from] BandError),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Dispersion(#[from] DispersionError),
}

/// How rows are scheduled. Both strategies produce identical tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionStrategy {
    #[default]
    Sequential,
    /// Rows are mapped on the rayon pool; output order still follows input order.
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConvertOptions {
    pub truncation: TruncationPolicy,
    pub with_correlation: bool,
    pub shape_errors: ShapeErrorPolicy,
    pub execution: ExecutionStrategy,
}

/// One source finished.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedEvent {
    /// Position of the source in the input sequence.
    pub index: usize,
    pub outcome: SourceOutcome,
}

impl ProcessedEvent {
    pub fn source_id(&self) -> SourceId {
        self.outcome.record.source_id
    }
}

/// Receives one call per processed source, in input order.
pub trait ProgressSink {
    fn processed(&mut self, event: &ProcessedEvent);

    fn finished(&mut self, _total: usize) {}
}

/// Discards progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn processed(&mut self, _event: &ProcessedEvent) {}
}

/// Logs a line every `every` sources and once at the end.
#[derive(Debug, Clone)]
pub struct LogProgress {
    every: usize,
    seen: usize,
    skipped: usize,
}

impl LogProgress {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            seen: 0,
            skipped: 0,
        }
    }
}

impl ProgressSink for LogProgress {
    fn processed(&mut self, event: &ProcessedEvent) {
        self.seen += 1;
        self.skipped += event.outcome.skipped.len();
        if self.seen % self.every == 0 {
            log::info!(
                "processed {} sources (last source_id {})",
                self.seen,
                event.source_id()
            );
        }
    }

    fn finished(&mut self, total: usize) {
        log::info!("processed {total} sources, {} bands skipped", self.skipped);
    }
}

/// The assembled batch result: one row per input source plus the grid used.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledSpectraTable {
    pub positions: Arc<Array1<f64>>,
    pub rows: Vec<MergedSpectrumRecord>,
    pub skipped: Vec<SkippedBand>,
}

impl SampledSpectraTable {
    fn new(positions: Arc<Array1<f64>>) -> Self {
        Self {
            positions,
            rows: Vec::new(),
            skipped: Vec::new(),
        }
    }

    fn push(&mut self, outcome: SourceOutcome) {
        self.skipped.extend(outcome.skipped);
        self.rows.push(outcome.record);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows whose `band` carries sampled values.
    pub fn present(&self, band: Band) -> usize {
        self.rows
            .iter()
            .filter(|r| !r.band(band).is_missing())
            .count()
    }

    /// Rows whose `band` was skipped because of a shape error.
    pub fn skipped_in(&self, band: Band) -> usize {
        self.skipped.iter().filter(|s| s.band == band).count()
    }
}

/// Lazy, single-pass sequence of processed sources.
///
/// Yields the first error and then whatever the caller asks for next; callers
/// that want abort semantics stop at the first `Err`.
pub struct Conversion<'a, I> {
    converter: &'a Converter,
    records: I,
    index: usize,
}

impl<I: Iterator<Item = SourceRecord>> Iterator for Conversion<'_, I> {
    type Item = Result<ProcessedEvent, ConvertError>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        let index = self.index;
        self.index += 1;
        Some(
            self.converter
                .convert_source(&record)
                .map(|outcome| ProcessedEvent { index, outcome }),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.records.size_hint()
    }
}

/// Result of [`Converter::convert_file`].
#[derive(Debug, Clone, PartialEq)]
pub struct FileConversion {
    /// One row per input record.
    pub table: SampledSpectraTable,
    pub sampling_path: PathBuf,
}

/// Owns the validated grid and the band design matrices for one batch configuration.
#[derive(Debug, Clone)]
pub struct Converter {
    positions: Arc<Array1<f64>>,
    designs: BandDesigns,
    options: ConvertOptions,
}

impl Converter {
    /// Validates `grid` (or takes the default one) against the table's sampling
    /// domain and builds both bands' design matrices.
    ///
    /// Any failure here happens before a single source is sampled.
    pub fn new(
        table: &BasisTable,
        grid: Option<Array1<f64>>,
        options: ConvertOptions,
    ) -> Result<Self, ConvertError> {
        let grid = grid.unwrap_or_else(default_grid);
        validate_grid(grid.view(), table.sampling_domain())?;

        let mut cache = DesignMatrixCache::new();
        let bp = cache.get_or_build(table.get(Band::Bp), grid.view())?;
        let rp = cache.get_or_build(table.get(Band::Rp), grid.view())?;
        log::debug!("{} distinct design matrices for this batch", cache.len());

        Ok(Self {
            positions: Arc::clone(bp.positions()),
            designs: BandDesigns::new(bp, rp),
            options,
        })
    }

    pub fn positions(&self) -> &Arc<Array1<f64>> {
        &self.positions
    }

    pub fn designs(&self) -> &BandDesigns {
        &self.designs
    }

    pub fn options(&self) -> &ConvertOptions {
        &self.options
    }

    pub fn convert_source(&self, record: &SourceRecord) -> Result<SourceOutcome, ConvertError> {
        Ok(sample_source(
            record,
            &self.designs,
            self.options.truncation,
            self.options.with_correlation,
            self.options.shape_errors,
        )?)
    }

    /// Processes `records` one at a time as the returned iterator is advanced.
    pub fn events<I>(&self, records: I) -> Conversion<'_, I::IntoIter>
    where
        I: IntoIterator<Item = SourceRecord>,
    {
        Conversion {
            converter: self,
            records: records.into_iter(),
            index: 0,
        }
    }

    /// Converts every record into one table row, reporting each to `progress`.
    ///
    /// With [`ShapeErrorPolicy::Abort`] the first failing row (in input order)
    /// is returned and no table is produced.
    pub fn convert<I>(
        &self,
        records: I,
        progress: &mut dyn ProgressSink,
    ) -> Result<SampledSpectraTable, ConvertError>
    where
        I: IntoIterator<Item = SourceRecord>,
    {
        let mut table = SampledSpectraTable::new(Arc::clone(&self.positions));
        log::info!(
            "sampling on {} positions ({:?}, truncation {:?}, correlation {})",
            self.positions.len(),
            self.options.execution,
            self.options.truncation,
            self.options.with_correlation
        );

        match self.options.execution {
            ExecutionStrategy::Sequential => {
                for event in self.events(records) {
                    let event = event?;
                    progress.processed(&event);
                    table.push(event.outcome);
                }
            }
            ExecutionStrategy::Parallel => {
                let records: Vec<SourceRecord> = records.into_iter().collect();
                let outcomes: Vec<Result<SourceOutcome, ConvertError>> = records
                    .par_iter()
                    .map(|record| self.convert_source(record))
                    .collect();
                for (index, outcome) in outcomes.into_iter().enumerate() {
                    let event = ProcessedEvent {
                        index,
                        outcome: outcome?,
                    };
                    progress.processed(&event);
                    table.push(event.outcome);
                }
            }
        }

        progress.finished(table.len());
        log::info!(
            "sampled {} sources (bp present {}, rp present {}, {} bands skipped)",
            table.len(),
            table.present(Band::Bp),
            table.present(Band::Rp),
            table.skipped.len()
        );
        Ok(table)
    }

    /// Reads a continuous-spectra CSV, converts it and writes the sampled
    /// spectra to `output` with the grid beside it (see [`sampling_path`]).
    ///
    /// The dispersion table, when given, is loaded before the input is read and
    /// adds each band's wavelengths to the grid file.
    pub fn convert_file(
        &self,
        input: &Path,
        output: &Path,
        dispersion: Option<&Path>,
        progress: &mut dyn ProgressSink,
    ) -> Result<FileConversion, ConvertError> {
        let dispersion = dispersion.map(DispersionFunction::from_csv).transpose()?;
        let records = read_continuous_csv(input)?;
        let table = self.convert(records, progress)?;

        write_sampled_csv(output, &table, self.options.with_correlation)?;
        let grid_path = sampling_path(output);
        write_sampling_csv(&grid_path, &table.positions, dispersion.as_ref())?;
        log::info!("wrote {} and {}", output.display(), grid_path.display());
        Ok(FileConversion {
            table,
            sampling_path: grid_path,
        })
    }
}

#![deny(dead_code)]

pub mod aggregate;
pub mod basis;
pub mod config;
pub mod convert;
pub mod dispersion;
pub mod grid;
pub mod io;
pub mod linalg;
pub mod matrix;
pub mod sampling;
pub mod spectrum;
pub mod types;

pub use aggregate::{
    BandDesigns, BandError, MergedSpectrumRecord, ShapeErrorPolicy, SkippedBand, SourceOutcome,
    sample_band, sample_source,
};
pub use basis::{
    BasisConfig, BasisError, BasisEvaluator, BasisFamily, BasisKind, HermiteFunctions,
    LegendrePolynomials, NormalizationRange,
};
pub use config::{BasisTable, ConfigError};
pub use convert::{
    ConvertError, ConvertOptions, Converter, ExecutionStrategy, FileConversion, LogProgress,
    NoProgress, ProcessedEvent, ProgressSink, SampledSpectraTable,
};
pub use dispersion::{DispersionError, DispersionFunction};
pub use grid::{GridError, default_grid, parse_grid_spec, validate_grid};
pub use matrix::{DesignMatrix, DesignMatrixCache, build_design_matrix};
pub use sampling::{SampledSpectrum, SamplingError, sample, sampled_covariance};
pub use spectrum::{
    BandInput, CoefficientErrors, ContinuousSpectrum, SourceRecord, SpectrumError,
};
pub use types::{Band, SourceId, TruncationLevel, TruncationPolicy};

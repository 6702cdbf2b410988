use clap::{Args, Parser, Subcommand};
use comfy_table::{Cell, ContentArrangement, Row, Table, presets::UTF8_FULL};
use ndarray::Array1;
use std::fs;
use std::path::{Path, PathBuf};
use xpsample::io::{read_sampling_csv, write_design_csv};
use xpsample::{
    Band, BasisTable, ConvertOptions, Converter, ExecutionStrategy, LogProgress,
    ShapeErrorPolicy, TruncationPolicy, build_design_matrix, default_grid, parse_grid_spec,
    validate_grid,
};

#[derive(Parser, Debug)]
#[command(name = "xpsample")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (build ", env!("XPSAMPLE_BUILD_TIMESTAMP"), ")"))]
#[command(about = "Sample basis-function spectra onto a pseudo-wavelength grid", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a CSV of continuous spectra into sampled spectra.
    Convert(ConvertArgs),
    /// Write one band's design matrix.
    Design(DesignArgs),
    /// Show the basis configuration.
    Bases(BasesArgs),
}

#[derive(Args, Debug)]
struct GridArgs {
    /// Basis configuration JSON; the built-in table is used when omitted.
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// Evenly spaced grid as start:stop:count.
    #[arg(long = "sampling", conflicts_with = "sampling_file")]
    sampling: Option<String>,
    /// CSV whose `pwl` (or first) column holds the grid.
    #[arg(long = "sampling-file")]
    sampling_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    input: PathBuf,
    #[command(flatten)]
    grid: GridArgs,
    /// none, recommended, or a fixed number of leading bases.
    #[arg(long = "truncation", default_value = "none")]
    truncation: String,
    #[arg(long = "with-correlation", default_value_t = false)]
    with_correlation: bool,
    /// NaN-fill bands with inconsistent shapes instead of aborting.
    #[arg(long = "skip-invalid", default_value_t = false)]
    skip_invalid: bool,
    #[arg(long = "parallel", default_value_t = false)]
    parallel: bool,
    /// Dispersion table (wl_nm, bp_pwl, rp_pwl) used to add wavelengths to the sampling file.
    #[arg(long = "dispersion")]
    dispersion: Option<PathBuf>,
    #[arg(long = "out")]
    out: PathBuf,
}

#[derive(Args, Debug)]
struct DesignArgs {
    band: Band,
    #[command(flatten)]
    grid: GridArgs,
    #[arg(long = "out")]
    out: PathBuf,
}

#[derive(Args, Debug)]
struct BasesArgs {
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// Also save the table as JSON.
    #[arg(long = "out")]
    out: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    match cli.command {
        Command::Convert(args) => run_convert(args),
        Command::Design(args) => run_design(args),
        Command::Bases(args) => run_bases(args),
    }
}

fn load_table(path: Option<&Path>) -> Result<BasisTable, String> {
    match path {
        Some(p) => BasisTable::from_path(p).map_err(|e| e.to_string()),
        None => Ok(BasisTable::default_xp()),
    }
}

fn load_grid(args: &GridArgs) -> Result<Option<Array1<f64>>, String> {
    if let Some(spec) = &args.sampling {
        return parse_grid_spec(spec).map(Some).map_err(|e| e.to_string());
    }
    if let Some(path) = &args.sampling_file {
        return read_sampling_csv(path).map(Some).map_err(|e| e.to_string());
    }
    Ok(None)
}

fn parse_truncation(text: &str) -> Result<TruncationPolicy, String> {
    match text.trim().to_ascii_lowercase().as_str() {
        "none" | "full" => Ok(TruncationPolicy::None),
        "recommended" | "auto" => Ok(TruncationPolicy::Recommended),
        other => other.parse::<usize>().map(TruncationPolicy::Fixed).map_err(|_| {
            format!("invalid --truncation '{text}'; expected none, recommended or a basis count")
        }),
    }
}

fn run_convert(args: ConvertArgs) -> Result<(), String> {
    let table = load_table(args.grid.config.as_deref())?;
    let grid = load_grid(&args.grid)?;
    let options = ConvertOptions {
        truncation: parse_truncation(&args.truncation)?,
        with_correlation: args.with_correlation,
        shape_errors: if args.skip_invalid {
            ShapeErrorPolicy::SkipAndReport
        } else {
            ShapeErrorPolicy::Abort
        },
        execution: if args.parallel {
            ExecutionStrategy::Parallel
        } else {
            ExecutionStrategy::Sequential
        },
    };
    // Grid and designs are checked before the input is read.
    let converter = Converter::new(&table, grid, options).map_err(|e| e.to_string())?;
    let mut progress = LogProgress::new(1000);
    let done = converter
        .convert_file(
            &args.input,
            &args.out,
            args.dispersion.as_deref(),
            &mut progress,
        )
        .map_err(|e| e.to_string())?;
    let sampled = &done.table;

    let mut summary = Table::new();
    summary
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Band", "Present", "Missing", "Skipped"]);
    for band in Band::ALL {
        let present = sampled.present(band);
        let skipped = sampled.skipped_in(band);
        summary.add_row(Row::from(vec![
            Cell::new(band.label().to_uppercase()),
            Cell::new(present),
            Cell::new(sampled.len() - present - skipped),
            Cell::new(skipped),
        ]));
    }
    println!(
        "Sampled {} sources on {} positions:",
        sampled.len(),
        sampled.positions.len()
    );
    println!("{summary}");
    for s in sampled.skipped.iter().take(10) {
        println!("  skipped {} of {}: {}", s.band, s.source_id, s.error);
    }
    println!("wrote spectra: {}", args.out.display());
    println!("wrote sampling: {}", done.sampling_path.display());
    Ok(())
}

fn run_design(args: DesignArgs) -> Result<(), String> {
    let table = load_table(args.grid.config.as_deref())?;
    let grid = load_grid(&args.grid)?.unwrap_or_else(default_grid);
    validate_grid(grid.view(), table.sampling_domain()).map_err(|e| e.to_string())?;
    let design =
        build_design_matrix(table.get(args.band), grid.view()).map_err(|e| e.to_string())?;
    write_design_csv(&args.out, &design).map_err(|e| e.to_string())?;
    println!(
        "wrote {} design matrix ({} bases x {} positions): {}",
        args.band,
        design.nrows(),
        design.ncols(),
        args.out.display()
    );
    Ok(())
}

fn run_bases(args: BasesArgs) -> Result<(), String> {
    let table = load_table(args.config.as_deref())?;
    let mut out = Table::new();
    out.load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Band", "Kind", "Bases", "Range", "Normalised", "Transformed"]);
    for band in Band::ALL {
        let cfg = table.get(band);
        let (lo, hi) = cfg.domain();
        let norm = cfg.normalization();
        out.add_row(Row::from(vec![
            Cell::new(band.label().to_uppercase()),
            Cell::new(cfg.kind()),
            Cell::new(cfg.n_bases()),
            Cell::new(format!("[{lo}, {hi}]")),
            Cell::new(format!("[{}, {}]", norm.min, norm.max)),
            Cell::new(if cfg.transformation().is_some() {
                format!("{} -> {}", cfg.raw_dimension(), cfg.n_bases())
            } else {
                "no".to_string()
            }),
        ]));
    }
    let (dmin, dmax) = table.sampling_domain();
    println!("Sampling domain: [{dmin}, {dmax}]");
    println!("{out}");

    if let Some(path) = args.out {
        let payload = table.to_json_string().map_err(|e| e.to_string())?;
        fs::write(&path, payload)
            .map_err(|e| format!("failed to write basis table '{}': {e}", path.display()))?;
        println!("saved basis table: {}", path.display());
    }
    Ok(())
}

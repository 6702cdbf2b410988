use approx::assert_abs_diff_eq;
use ndarray::{Array1, s};
use std::fs;
use std::io::Write;
use tempfile::tempdir;
use xpsample::io::{
    parse_array, read_continuous_csv, read_sampling_csv, sampling_path, write_design_csv,
    write_sampled_csv, write_sampling_csv,
};
use xpsample::{
    Band, BasisTable, CoefficientErrors, ConvertError, ConvertOptions, Converter,
    DispersionFunction, NoProgress, TruncationPolicy,
};

const BASES_JSON: &str = r#"{
    "sampling_domain": [-10.0, 70.0],
    "bands": {
        "bp": {"kind": "hermite", "n_bases": 3, "range": [0.0, 60.0], "normalized_range": [-4.0, 4.0]},
        "rp": {"kind": "hermite", "n_bases": 3, "range": [0.0, 60.0], "normalized_range": [-4.0, 4.0]}
    }
}"#;

const INPUT_CSV: &str = "\
source_id,bp_coefficients,bp_coefficient_errors,bp_coefficient_correlations,bp_n_relevant_bases,bp_scale,rp_coefficients,rp_covariance_matrix
11,\"(1.0, 0.5, 0.25)\",\"(0.1, 0.2, 0.3)\",\"(0.1, 0.0, -0.2)\",2,2.0,\"[2.0, 1.0, 0.0]\",\"[1, 0, 0, 0, 1, 0, 0, 0, 1]\"
12,,,,,,\"[2.0, 1.0, 0.0]\",\"[1, 0, 0, 0, 1, 0, 0, 0, 1]\"
";

#[test]
fn reads_both_error_representations_and_absent_bands() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("input.csv");
    fs::write(&input, INPUT_CSV).expect("write input");

    let records = read_continuous_csv(&input).expect("read");
    assert_eq!(records.len(), 2);
    let bp = records[0].bp.as_ref().expect("bp present");
    assert_eq!(bp.coefficients.len(), 3);
    assert_eq!(bp.scale, 2.0);
    assert_eq!(bp.n_relevant_bases, Some(2));
    assert!(matches!(bp.errors, CoefficientErrors::PackedCorrelation { .. }));
    let rp = records[0].rp.as_ref().expect("rp present");
    assert!(matches!(rp.errors, CoefficientErrors::Covariance(ref c) if c.dim() == (3, 3)));
    assert_eq!(rp.scale, 1.0);
    assert!(records[1].bp.is_none());
    assert!(records[1].rp.is_some());
}

#[test]
fn converted_table_round_trips_through_csv() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("input.csv");
    let config = dir.path().join("bases.json");
    let out = dir.path().join("spectra.csv");
    fs::write(&input, INPUT_CSV).expect("write input");
    fs::write(&config, BASES_JSON).expect("write config");

    let table = BasisTable::from_path(&config).expect("config");
    let options = ConvertOptions {
        truncation: TruncationPolicy::Recommended,
        with_correlation: true,
        ..ConvertOptions::default()
    };
    let grid = Array1::linspace(0.0, 60.0, 7);
    let conv = Converter::new(&table, Some(grid.clone()), options).expect("converter");
    let sampled = conv
        .convert(read_continuous_csv(&input).expect("read"), &mut NoProgress)
        .expect("convert");
    write_sampled_csv(&out, &sampled, true).expect("write output");

    let mut reader = csv::Reader::from_path(&out).expect("open output");
    let headers = reader.headers().expect("headers").clone();
    let names: Vec<&str> = headers.iter().collect();
    assert_eq!(
        names,
        vec![
            "source_id",
            "bp_flux",
            "bp_flux_error",
            "bp_correlation",
            "rp_flux",
            "rp_flux_error",
            "rp_correlation"
        ]
    );
    let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.expect("row")).collect();
    assert_eq!(rows.len(), 2);

    // bp of source 11 keeps 2 bases with scale 2.
    let design = conv.designs().get(Band::Bp);
    let expected = Array1::from(vec![1.0, 0.5]).dot(&design.view().slice(s![..2, ..])) * 2.0;
    let flux = parse_array(&rows[0][1]).expect("parse").expect("values");
    assert_eq!(flux.len(), expected.len());
    for (a, b) in flux.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
    }
    let corr = parse_array(&rows[0][3]).expect("parse").expect("values");
    assert_eq!(corr.len(), 49);

    assert_eq!(&rows[1][0], "12");
    let missing = parse_array(&rows[1][1]).expect("parse").expect("values");
    assert_eq!(missing.len(), 7);
    assert!(missing.iter().all(|v| v.is_nan()));
    let rp_flux = parse_array(&rows[1][4]).expect("parse").expect("values");
    assert!(rp_flux.iter().all(|v| v.is_finite()));

    let grid_path = sampling_path(&out);
    write_sampling_csv(&grid_path, &sampled.positions, None).expect("write grid");
    let back = read_sampling_csv(&grid_path).expect("read grid");
    assert_eq!(back, grid);
}

#[test]
fn sampling_file_carries_wavelengths_with_dispersion() {
    let dir = tempdir().expect("tempdir");
    let table_path = dir.path().join("dispersion.csv");
    let mut f = fs::File::create(&table_path).expect("create");
    writeln!(f, "wl_nm,bp_pwl,rp_pwl").expect("write");
    for i in 0..7 {
        let wl = 330.0 + 100.0 * i as f64;
        writeln!(f, "{wl},{},{}", 60.0 - 10.0 * i as f64, 10.0 * i as f64).expect("write");
    }
    drop(f);
    let dispersion = DispersionFunction::from_csv(&table_path).expect("dispersion");

    let grid = Array1::linspace(0.0, 60.0, 4);
    let path = dir.path().join("run_sampling.csv");
    write_sampling_csv(&path, &grid, Some(&dispersion)).expect("write grid");

    let mut reader = csv::Reader::from_path(&path).expect("open");
    let headers: Vec<String> = reader
        .headers()
        .expect("headers")
        .iter()
        .map(str::to_string)
        .collect();
    assert_eq!(headers, vec!["pwl", "bp_wl_nm", "rp_wl_nm"]);
    for (row, &p) in reader.records().zip(grid.iter()) {
        let row = row.expect("row");
        let bp: f64 = row[1].parse().expect("bp wl");
        let rp: f64 = row[2].parse().expect("rp wl");
        assert_abs_diff_eq!(bp, 330.0 + (60.0 - p) * 10.0, epsilon = 1e-8);
        assert_abs_diff_eq!(rp, 330.0 + p * 10.0, epsilon = 1e-8);
    }
}

#[test]
fn design_dump_has_one_column_per_basis() {
    let dir = tempdir().expect("tempdir");
    let table = BasisTable::default_xp();
    let grid = Array1::linspace(0.0, 60.0, 5);
    let design =
        xpsample::build_design_matrix(table.get(Band::Rp), grid.view()).expect("design");
    let path = dir.path().join("design.csv");
    write_design_csv(&path, &design).expect("write design");

    let mut reader = csv::Reader::from_path(&path).expect("open");
    assert_eq!(reader.headers().expect("headers").len(), 56);
    let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.expect("row")).collect();
    assert_eq!(rows.len(), 5);
    let v: f64 = rows[2][1].parse().expect("value");
    assert_eq!(v.to_bits(), design.view()[[0, 2]].to_bits());
}

fn header_of(path: &std::path::Path) -> Vec<String> {
    let mut reader = csv::Reader::from_path(path).expect("open");
    reader
        .headers()
        .expect("headers")
        .iter()
        .map(str::to_string)
        .collect()
}

#[test]
fn convert_file_writes_spectra_and_grid() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("input.csv");
    let dispersion = dir.path().join("dispersion.csv");
    let out = dir.path().join("spectra.csv");
    fs::write(&input, INPUT_CSV).expect("write input");
    fs::write(
        &dispersion,
        "wl_nm,bp_pwl,rp_pwl\n330,60,0\n430,50,10\n530,40,20\n630,30,30\n",
    )
    .expect("write dispersion");

    let table = BasisTable::from_json_str(BASES_JSON).expect("config");
    let grid = Array1::linspace(0.0, 30.0, 4);
    let conv =
        Converter::new(&table, Some(grid), ConvertOptions::default()).expect("converter");
    let done = conv
        .convert_file(&input, &out, Some(&dispersion), &mut NoProgress)
        .expect("convert file");

    assert_eq!(done.table.len(), 2);
    assert_eq!(done.sampling_path, sampling_path(&out));
    assert_eq!(
        header_of(&out),
        vec!["source_id", "bp_flux", "bp_flux_error", "rp_flux", "rp_flux_error"]
    );
    assert_eq!(header_of(&done.sampling_path), vec!["pwl", "bp_wl_nm", "rp_wl_nm"]);
}

#[test]
fn empty_batch_keeps_correlation_columns() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("empty.csv");
    let out = dir.path().join("spectra.csv");
    fs::write(&input, "source_id,bp_coefficients,rp_coefficients\n").expect("write input");

    let options = ConvertOptions {
        with_correlation: true,
        ..ConvertOptions::default()
    };
    let conv = Converter::new(&BasisTable::default_xp(), None, options).expect("converter");
    let done = conv
        .convert_file(&input, &out, None, &mut NoProgress)
        .expect("convert file");
    assert!(done.table.is_empty());
    assert_eq!(
        header_of(&out),
        vec![
            "source_id",
            "bp_flux",
            "bp_flux_error",
            "bp_correlation",
            "rp_flux",
            "rp_flux_error",
            "rp_correlation"
        ]
    );
}

#[test]
fn file_errors_surface_as_convert_errors() {
    let dir = tempdir().expect("tempdir");
    let out = dir.path().join("spectra.csv");
    let conv = Converter::new(&BasisTable::default_xp(), None, ConvertOptions::default())
        .expect("converter");

    let err = conv
        .convert_file(&dir.path().join("absent.csv"), &out, None, &mut NoProgress)
        .expect_err("missing input");
    assert!(matches!(err, ConvertError::Input(_)), "unexpected error {err}");

    let input = dir.path().join("input.csv");
    let dispersion = dir.path().join("dispersion.csv");
    fs::write(&input, INPUT_CSV).expect("write input");
    fs::write(&dispersion, "wl_nm,bp_pwl,rp_pwl\n330,60,0\n").expect("write dispersion");
    let err = conv
        .convert_file(&input, &out, Some(&dispersion), &mut NoProgress)
        .expect_err("one-row dispersion table");
    assert!(matches!(err, ConvertError::Dispersion(_)), "unexpected error {err}");
    assert!(!out.exists());
}

use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Modules that do the numerical work; file and console I/O stays out of them.
const ENGINE_MODULES: &[&str] = &[
    "src/aggregate.rs",
    "src/basis.rs",
    "src/grid.rs",
    "src/matrix.rs",
    "src/sampling.rs",
    "src/spectrum.rs",
    "src/types.rs",
    "src/linalg",
];

fn main() {
    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src");

    let build_ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=XPSAMPLE_BUILD_TIMESTAMP={build_ts}");

    enforce_engine_io_boundary();
}

fn enforce_engine_io_boundary() {
    let forbidden = [
        "std::fs",
        "File::open",
        "csv::",
        "serde_json",
        "println!",
        "eprintln!",
    ];

    let mut violations = Vec::new();
    let mut stack: Vec<PathBuf> = ENGINE_MODULES.iter().map(PathBuf::from).collect();
    while let Some(path) = stack.pop() {
        if path.is_dir() {
            if let Ok(entries) = fs::read_dir(&path) {
                stack.extend(entries.flatten().map(|e| e.path()));
            }
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) != Some("rs") {
            continue;
        }
        let rel = path.to_string_lossy().to_string();
        let src = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(_) => continue,
        };
        for (line_no, line) in src.lines().enumerate() {
            for token in &forbidden {
                if line.contains(token) {
                    violations.push(format!(
                        "{}:{} contains forbidden token '{}'",
                        rel,
                        line_no + 1,
                        token
                    ));
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\nerror: I/O found in xpsample engine modules:");
        for v in violations {
            eprintln!("  - {v}");
        }
        panic!("engine modules must stay free of file and console I/O");
    }
}

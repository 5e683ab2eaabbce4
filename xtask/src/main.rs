use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{exit, Command};

use clap::{Parser, Subcommand, ValueEnum};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const SAMPLE_CATALOG: &str = "config/catalog.sample.json";
const BENCH_PACKAGE: &str = "bus_sim_core";
const BENCH_TARGET: &str = "performance";
const GATEWAY_BIN: &str = "gateway_lambda";
const GATEWAY_ZIP: &str = "infra/aws_bus_stream/dist/gateway.zip";

#[derive(Parser)]
#[command(
    name = "xtask",
    about = "Task runner for the bus network simulation workspace"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run feeders locally against a catalog, writing Parquet and logging events
    Feed {
        /// Comma-separated feeder list (position, people_count, sensor) or "all"
        #[arg(long, default_value = "all")]
        feeders: String,
        /// Catalog file or s3://bucket/key
        #[arg(long, default_value = SAMPLE_CATALOG)]
        catalog: String,
        /// Parquet output directory
        #[arg(long, default_value = "data")]
        output: String,
        /// Fixed RNG seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,
        /// Seed stop waiting counts from the output directory ("latest" or RFC3339)
        #[arg(long)]
        restore: Option<String>,
    },
    /// Run the simulation benchmarks, optionally limited to one group
    Bench {
        /// Criterion filter, e.g. position_tick
        filter: Option<String>,
    },
    /// Record the current benchmark numbers under a named baseline
    BenchSave {
        #[arg(long, default_value = "main")]
        name: String,
    },
    /// Compare the working tree against a baseline recorded with bench-save
    BenchCompare {
        #[arg(long, default_value = "main")]
        baseline: String,
    },
    /// Run CI checks
    Ci {
        #[arg(value_enum, default_value_t = CiJob::Check)]
        job: CiJob,
    },
    /// Build the gateway Lambda and zip it as `bootstrap`
    ServerlessPackage {
        /// Compilation target triple for the Lambda binary
        #[arg(long, default_value = "x86_64-unknown-linux-gnu")]
        target: String,
        #[arg(value_enum, long, default_value_t = BuildProfile::Release)]
        profile: BuildProfile,
    },
}

#[derive(Clone, ValueEnum)]
enum CiJob {
    /// Formatting, clippy and every crate's tests
    Check,
    /// Benchmarks only
    Bench,
    /// Check, then benchmarks
    All,
}

#[derive(Clone, Copy, ValueEnum)]
enum BuildProfile {
    Debug,
    Release,
}

impl BuildProfile {
    fn dir_name(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
        }
    }
}

// ── helpers ────────────────────────────────────────────────────────

fn step(label: &str) {
    eprintln!("\n=== {label} ===");
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("error: {message}");
    exit(1);
}

fn run_cargo<S: AsRef<str>>(args: &[S]) {
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    eprintln!("+ cargo {}", args.join(" "));
    match Command::new("cargo").args(&args).status() {
        Ok(status) if status.success() => {}
        Ok(status) => exit(status.code().unwrap_or(1)),
        Err(error) => fail(format!("failed to execute cargo: {error}")),
    }
}

fn bench(extra: &[&str]) {
    let mut args = vec!["bench", "-p", BENCH_PACKAGE, "--bench", BENCH_TARGET];
    if !extra.is_empty() {
        args.push("--");
        args.extend_from_slice(extra);
    }
    run_cargo(&args);
}

// ── commands ───────────────────────────────────────────────────────

fn run_feeders(
    feeders: &str,
    catalog: &str,
    output: &str,
    seed: Option<u64>,
    restore: Option<&str>,
) {
    step("Run feeders (ctrl-c to stop)");
    let mut args: Vec<String> = [
        "run",
        "-p",
        "bus_stream_lambda",
        "--bin",
        "feeder",
        "--release",
        "--",
        "--feeders",
        feeders,
        "--catalog",
        catalog,
        "--events",
        "log",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect();
    args.push("--sink".to_string());
    args.push(format!("parquet:{output}"));
    if let Some(seed) = seed {
        args.push("--seed".to_string());
        args.push(seed.to_string());
    }
    if let Some(restore) = restore {
        args.push("--restore".to_string());
        args.push(restore.to_string());
    }
    run_cargo(&args);
}

/// `Some(false)` only when rustup answered and the target is missing.
fn target_installed(target: &str) -> Option<bool> {
    let output = Command::new("rustup")
        .args(["target", "list", "--installed"])
        .output()
        .ok()
        .filter(|output| output.status.success())?;
    let installed = String::from_utf8_lossy(&output.stdout);
    Some(installed.lines().any(|line| line.trim() == target))
}

fn write_bootstrap_zip(binary: &[u8], zip_path: &Path) -> zip::result::ZipResult<()> {
    let mut zip = ZipWriter::new(fs::File::create(zip_path)?);
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o755);
    zip.start_file("bootstrap", options)?;
    zip.write_all(binary)?;
    zip.finish()?;
    Ok(())
}

fn package_gateway(target: &str, profile: BuildProfile) {
    match target_installed(target) {
        Some(true) => {}
        Some(false) => fail(format!(
            "rust target `{target}` is not installed; run `rustup target add {target}`"
        )),
        None => eprintln!("warning: could not query rustup; skipping target check"),
    }

    step("Build gateway lambda");
    let mut args = vec![
        "build",
        "-p",
        "bus_stream_lambda",
        "--bin",
        GATEWAY_BIN,
        "--target",
        target,
    ];
    if matches!(profile, BuildProfile::Release) {
        args.push("--release");
    }
    run_cargo(&args);

    step("Zip bootstrap");
    let binary_path = Path::new("target")
        .join(target)
        .join(profile.dir_name())
        .join(GATEWAY_BIN);
    let binary = fs::read(&binary_path)
        .unwrap_or_else(|error| fail(format!("cannot read {}: {error}", binary_path.display())));
    let zip_path = Path::new(GATEWAY_ZIP);
    if let Some(dist) = zip_path.parent() {
        fs::create_dir_all(dist)
            .unwrap_or_else(|error| fail(format!("cannot create {}: {error}", dist.display())));
    }
    write_bootstrap_zip(&binary, zip_path)
        .unwrap_or_else(|error| fail(format!("cannot write {GATEWAY_ZIP}: {error}")));
    eprintln!("\nPackaged {GATEWAY_ZIP}");
}

fn ci_check() {
    step("Check formatting");
    run_cargo(&["fmt", "--all", "--", "--check"]);

    step("Clippy");
    run_cargo(&["clippy", "--workspace", "--all-targets", "--all-features", "--", "-D", "warnings"]);

    for package in ["bus_sim_core", "bus_stream_core", "bus_stream_lambda"] {
        step(&format!("Test {package}"));
        run_cargo(&["test", "-p", package, "--all-features"]);
    }
}

fn main() {
    match Cli::parse().command {
        Commands::Feed {
            feeders,
            catalog,
            output,
            seed,
            restore,
        } => run_feeders(&feeders, &catalog, &output, seed, restore.as_deref()),
        Commands::Bench { filter } => {
            step("Run benchmarks");
            let filter: Vec<&str> = filter.iter().map(String::as_str).collect();
            bench(&filter);
        }
        Commands::BenchSave { name } => {
            step(&format!("Record baseline '{name}'"));
            bench(&["--save-baseline", name.as_str()]);
        }
        Commands::BenchCompare { baseline } => {
            step(&format!("Compare against baseline '{baseline}'"));
            bench(&["--baseline", baseline.as_str()]);
        }
        Commands::Ci { job } => {
            if matches!(job, CiJob::Check | CiJob::All) {
                ci_check();
            }
            if matches!(job, CiJob::Bench | CiJob::All) {
                step("Run benchmarks");
                bench(&[]);
            }
            eprintln!("\nCI job passed.");
        }
        Commands::ServerlessPackage { target, profile } => package_gateway(&target, profile),
    }
}

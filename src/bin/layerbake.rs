use std::path::PathBuf;

use clap::{Parser, Subcommand};
use layerbake::build::ImageBuild;
use layerbake::spec::load_spec;

#[derive(Debug, Parser)]
#[command(name = "layerbake", version, about = "Build and publish container images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build the image described by a build file and push it
    Build {
        #[arg(short, long, env = "LAYERBAKE_FILE", default_value = "layerbake.yaml")]
        file: PathBuf,
        /// Print the build report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a build file without building
    Validate {
        #[arg(short, long, env = "LAYERBAKE_FILE", default_value = "layerbake.yaml")]
        file: PathBuf,
    },
    /// Print the version
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Build { file, json } => cmd_build(&file, json),
        Command::Validate { file } => cmd_validate(&file),
        Command::Version => {
            println!("layerbake {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn cmd_build(file: &std::path::Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let spec = load_spec(file)?;
    let report = ImageBuild::new(spec)?.run()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("image: {}", report.image);
    println!("digest: {}", report.manifest_digest);
    println!("layers: {}", report.layers);
    println!(
        "rebuilt: {}",
        if report.rebuilt_layers.is_empty() {
            "none".to_string()
        } else {
            report.rebuilt_layers.join(", ")
        }
    );
    println!(
        "blobs: {} pushed, {} already present",
        report.blobs_pushed, report.blobs_existing
    );
    Ok(())
}

fn cmd_validate(file: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let spec = load_spec(file)?;
    println!(
        "valid: {} -> {} ({} workers)",
        spec.base_image, spec.target_image, spec.workers
    );
    Ok(())
}

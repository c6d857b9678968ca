//! CMR dataset CLI
//!
//! Collates archived cardiac MRI studies into per-study series containers.

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cmr_dataset::{
    Config, StudyContainer, checksum, dispatch, enums::Compression, metadata_scan, report,
};

#[derive(Parser)]
#[command(name = "cmr-dataset")]
#[command(about = "Collate cardiac MRI DICOM archives into series containers", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML or JSON); defaults apply without one
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Settings that override the configuration file
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Directory holding the study archives
    #[arg(short, long)]
    root_dir: Option<PathBuf>,

    /// Directory receiving the study containers and reports
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Institution prefix for output folders
    #[arg(short, long)]
    institution: Option<String>,

    /// CSV with a `filenames` column restricting which archives are used
    #[arg(short = 'l', long)]
    safelist: Option<PathBuf>,

    /// Studies processed concurrently
    #[arg(short = 'w', long)]
    workers: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every archive of the input directory
    Run {
        #[command(flatten)]
        overrides: Overrides,

        /// Target size of the shorter frame side before cropping
        #[arg(long)]
        framesize: Option<usize>,

        /// Series compression: none, gzip or zstd
        #[arg(long)]
        compression: Option<Compression>,
    },

    /// Rebuild the failed-studies report from the output directory
    Audit {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Hash every stored series, optionally comparing with a reference
    Checksum {
        /// Output directory to hash
        #[arg(short, long)]
        input_dir: PathBuf,

        /// CSV receiving the checksums
        #[arg(short, long)]
        output_csv: PathBuf,

        /// Reference checksum CSV
        #[arg(long)]
        compare: Option<PathBuf>,
    },

    /// Survey series headers across archives
    Scan {
        #[command(flatten)]
        overrides: Overrides,

        /// Also write a series description frequency table
        #[arg(short, long)]
        summarize: bool,
    },

    /// Print the entries of one study container
    Inspect {
        /// Path to a `.zarr` study container
        container: PathBuf,
    },

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            overrides,
            framesize,
            compression,
        } => {
            let mut config = load_config(cli.config, &overrides)?;
            if let Some(size) = framesize {
                config.processing.frame_size = size;
            }
            if let Some(compression) = compression {
                config.output.compression = compression;
            }
            config.validate()?;
            run_command(&config)?;
        }

        Commands::Audit { overrides } => {
            let config = load_config(cli.config, &overrides)?;
            config.validate()?;
            audit_command(&config)?;
        }

        Commands::Checksum {
            input_dir,
            output_csv,
            compare,
        } => {
            checksum_command(input_dir, output_csv, compare)?;
        }

        Commands::Scan {
            overrides,
            summarize,
        } => {
            let config = load_config(cli.config, &overrides)?;
            config.validate()?;
            scan_command(&config, summarize)?;
        }

        Commands::Inspect { container } => {
            inspect_command(container)?;
        }

        Commands::GenerateConfig { output } => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>, overrides: &Overrides) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(&path)?,
        None => Config::default(),
    };

    // Apply overrides
    if let Some(root_dir) = &overrides.root_dir {
        config.input.root_dir = root_dir.clone();
    }
    if let Some(output_dir) = &overrides.output_dir {
        config.output.output_dir = output_dir.clone();
    }
    if let Some(institution) = &overrides.institution {
        config.institution = institution.clone();
    }
    if let Some(safelist) = &overrides.safelist {
        config.input.safelist = Some(safelist.clone());
    }
    if let Some(workers) = overrides.workers {
        config.processing.workers = workers;
    }
    Ok(config)
}

fn run_command(config: &Config) -> Result<()> {
    let (summary, report_path) = dispatch::run(config)?;
    let failed = summary.failed_studies();

    println!("\n=== Run Summary ===");
    println!("Studies: {}", summary.reports.len());
    println!("Series written: {}", summary.series_written());
    println!("Series skipped: {}", summary.series_skipped());
    println!("Failed studies: {} (see {})", failed.len(), report_path.display());
    println!("===================\n");
    Ok(())
}

fn audit_command(config: &Config) -> Result<()> {
    let inputs = dispatch::resolve_inputs(config)?;
    let failed = report::audit_output(&inputs, &config.output.output_dir)?;

    std::fs::create_dir_all(&config.output.output_dir)?;
    let report_path = config.output.output_dir.join(report::FAILED_STUDIES_FILE);
    report::write_filename_list(&report_path, &failed)?;

    println!(
        "{} of {} studies have no output; written to {}",
        failed.len(),
        inputs.len(),
        report_path.display()
    );
    Ok(())
}

fn checksum_command(input_dir: PathBuf, output_csv: PathBuf, compare: Option<PathBuf>) -> Result<()> {
    let rows = checksum::generate_checksums(&input_dir)?;
    checksum::write_checksums(&output_csv, &rows)?;
    println!("Checksums for {} series saved to {}", rows.len(), output_csv.display());

    let Some(reference_path) = compare else {
        return Ok(());
    };
    let reference = checksum::read_checksums(&reference_path)?;
    let mismatches = checksum::compare_checksums(&rows, &reference);
    if mismatches.is_empty() {
        println!("All series have matching checksums.");
        return Ok(());
    }

    println!("\n=== Mismatched series ===");
    for mismatch in &mismatches {
        println!(
            "{}/{}: expected {}, found {}",
            mismatch.container,
            mismatch.series,
            mismatch.expected.as_deref().unwrap_or("<missing>"),
            mismatch.found.as_deref().unwrap_or("<missing>"),
        );
    }
    bail!("{} series do not match {}", mismatches.len(), reference_path.display())
}

fn scan_command(config: &Config, summarize: bool) -> Result<()> {
    let archives = dispatch::resolve_inputs(config)?;
    let rows = metadata_scan::scan_studies(config, &archives)?;
    let written = metadata_scan::write_scan_outputs(
        &config.output.output_dir,
        &config.institution,
        &rows,
        summarize,
    )?;

    println!("Scanned {} archives, {} series folders", archives.len(), rows.len());
    for path in written {
        println!("Saved {}", path.display());
    }
    Ok(())
}

fn inspect_command(path: PathBuf) -> Result<()> {
    let container = StudyContainer::open(&path)?;
    let attributes = container.attributes()?;

    println!("\n=== {} ===", container.path().display());
    println!("Institution: {}", attributes.institution);
    println!("Subject: {}", attributes.subject_id);
    println!("Study: {}", attributes.study_id);
    println!("Source archives: {}", attributes.source_archives.join(", "));

    for name in container.list_entries()? {
        let series = container.read_attributes(&name)?;
        let data = container.read_series(&name)?;
        println!(
            "  {name}: shape {:?}, {} frames, slices start at {:?}",
            data.shape(),
            series.total_images,
            series.slice_frames
        );
    }
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# CMR dataset configuration

# === INPUT: Where to read study archives from ===
input:
  # Directory holding one tar / tgz archive per study
  root_dir: "/data/archives"

  # Optional CSV with a `filenames` column; only listed archives are processed
  # safelist: "/data/safelist.csv"

  # Archive extensions considered for processing
  extensions: [tgz, tar.gz, tar]

# === OUTPUT: Where study containers are written ===
output:
  # Containers land in <output_dir>/<institution>_<subject>/<study>.zarr
  output_dir: "/data/cmr"

  # Series compression: none | gzip | zstd
  compression: gzip

  # gzip 0-9, zstd 1-22
  compression_level: 4

# === PROCESSING ===
processing:
  # Studies processed concurrently
  workers: 4

  # Per-study extraction directories are created (and removed) below this
  scratch_dir: "/tmp/cmr-dataset"

  # Shorter frame side after resizing, and the center crop fraction
  frame_size: 480
  crop_fraction: 0.75

  # Grayscale is replicated into this many channels
  channels: 3

  # Multi-slice stacks keep at most this many folders
  max_stack_slices: 10

  # Folders with fewer files are skipped as single image series
  min_frames_per_folder: 2

# === INSTITUTION ===
institution: "stanford"

# Institutions not listed here read identity from the DICOM headers and group
# folders by exact series description.
institutions:
  medstar:
    # Identity from `<subject>-<study>.tgz` archive names
    identity: archive_filename
    filename_separator: "-"
  ukbiobank:
    # PatientID is the study, the enclosing folder is the subject
    identity: patient_as_study
    grouping: contains
    exclude: [InlineVF]
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

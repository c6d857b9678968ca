//! Configuration for the preprocessing pipeline.

use crate::enums::Compression;
use crate::grouper::{DEFAULT_MAX_STACK_SLICES, DEFAULT_MIN_FRAMES_PER_FOLDER};
use crate::institution::InstitutionProfile;
use crate::normalizer::{DEFAULT_CROP_FRACTION, DEFAULT_FRAME_SIZE};

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, path::PathBuf};

/// Main configuration, built once at start-up and passed down by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub input: InputConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Institution prefix for output folders and profile lookup
    #[serde(default = "default_institution")]
    pub institution: String,

    /// Per-institution strategies; institutions not listed use the default
    /// profile
    #[serde(default)]
    pub institutions: BTreeMap<String, InstitutionProfile>,
}

/// Where study archives are read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Optional CSV with a `filenames` column restricting which archives run
    #[serde(default)]
    pub safelist: Option<PathBuf>,

    /// Archive file extensions considered for processing
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default)]
    pub compression: Compression,

    /// gzip 0-9, zstd 1-22
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Studies processed concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Root of the per-study extraction directories
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Canonical frame size in pixels (shorter side after resize)
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,

    #[serde(default = "default_crop_fraction")]
    pub crop_fraction: f64,

    /// Output channels; the grayscale plane is replicated into each
    #[serde(default = "default_channels")]
    pub channels: usize,

    /// Folders beyond this count are dropped from multi-slice stacks
    #[serde(default = "default_max_stack_slices")]
    pub max_stack_slices: usize,

    /// Folders with fewer files are skipped
    #[serde(default = "default_min_frames_per_folder")]
    pub min_frames_per_folder: usize,
}

fn default_institution() -> String {
    "default".to_string()
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_extensions() -> Vec<String> {
    vec!["tgz".to_string(), "tar.gz".to_string(), "tar".to_string()]
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_compression_level() -> i32 {
    4
}

fn default_workers() -> usize {
    4
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("cmr-dataset")
}

fn default_frame_size() -> usize {
    DEFAULT_FRAME_SIZE
}

fn default_crop_fraction() -> f64 {
    DEFAULT_CROP_FRACTION
}

fn default_channels() -> usize {
    3
}

fn default_max_stack_slices() -> usize {
    DEFAULT_MAX_STACK_SLICES
}

fn default_min_frames_per_folder() -> usize {
    DEFAULT_MIN_FRAMES_PER_FOLDER
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            safelist: None,
            extensions: default_extensions(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            compression: Compression::default(),
            compression_level: default_compression_level(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            scratch_dir: default_scratch_dir(),
            frame_size: default_frame_size(),
            crop_fraction: default_crop_fraction(),
            channels: default_channels(),
            max_stack_slices: default_max_stack_slices(),
            min_frames_per_folder: default_min_frames_per_folder(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input: InputConfig::default(),
            output: OutputConfig::default(),
            processing: ProcessingConfig::default(),
            institution: default_institution(),
            institutions: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Strategy table entry for the configured institution
    pub fn profile(&self) -> InstitutionProfile {
        self.institutions
            .get(&self.institution)
            .cloned()
            .unwrap_or_default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.institution.trim().is_empty() {
            anyhow::bail!("institution must not be empty");
        }
        if self.institution.contains(['/', '\\']) {
            anyhow::bail!("institution must not contain path separators");
        }
        if self.processing.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.processing.frame_size == 0 {
            anyhow::bail!("frame_size must be positive");
        }
        if !(self.processing.crop_fraction > 0.0 && self.processing.crop_fraction <= 1.0) {
            anyhow::bail!(
                "crop_fraction must be in (0, 1], got {}",
                self.processing.crop_fraction
            );
        }
        if self.processing.channels == 0 {
            anyhow::bail!("channels must be at least 1");
        }
        if self.processing.max_stack_slices == 0 {
            anyhow::bail!("max_stack_slices must be at least 1");
        }
        let level = self.output.compression_level;
        match self.output.compression {
            Compression::Gzip if !(0..=9).contains(&level) => {
                anyhow::bail!("gzip compression level must be 0-9, got {level}")
            }
            Compression::Zstd if !(1..=22).contains(&level) => {
                anyhow::bail!("zstd compression level must be 1-22, got {level}")
            }
            _ => {}
        }
        if self.input.extensions.is_empty() {
            anyhow::bail!("at least one archive extension is required");
        }
        Ok(())
    }
}

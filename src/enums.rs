use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Chunk compression used for series arrays in a study container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Zstd,
}

impl Compression {
    /// Codec name, `None` for uncompressed chunks
    pub fn codec_id(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gzip => Some("gzip"),
            Compression::Zstd => Some("zstd"),
        }
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "raw" => Ok(Compression::None),
            "gzip" | "gz" => Ok(Compression::Gzip),
            "zstd" => Ok(Compression::Zstd),
            other => Err(format!("unknown compression mode '{other}'")),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.codec_id().unwrap_or("none"))
    }
}

/// How two series descriptions are compared when grouping folders
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityMatch {
    #[default]
    Exact,
    // Either description contains the other, for vendors that suffix slice
    // numbers onto the description.
    Contains,
}

impl IdentityMatch {
    pub fn matches(&self, a: &str, b: &str) -> bool {
        match self {
            IdentityMatch::Exact => a == b,
            IdentityMatch::Contains => {
                if a.is_empty() || b.is_empty() {
                    return a == b;
                }
                a.contains(b) || b.contains(a)
            }
        }
    }
}

/// Lifecycle of a single study run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStage {
    Pending,
    Extracted,
    Grouped,
    Collating,
    CleanedUp,
    Done,
    Failed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Pending => "pending",
            PipelineStage::Extracted => "extracted",
            PipelineStage::Grouped => "grouped",
            PipelineStage::Collating => "collating",
            PipelineStage::CleanedUp => "cleaned-up",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

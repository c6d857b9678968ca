//! # CMR dataset library
//!
//! This crate turns archived cardiac MRI studies into a training-ready
//! dataset. Every study archive holds one folder of single-frame DICOM files
//! per acquisition; the library collates those frames into one
//! `(channel, frame, height, width)` array per series and stores every series
//! of a study in a single container.
//!
//! The work for one study runs in stages:
//!  - Extract the archive into a scratch directory
//!  - Group series folders by series description (multi-slice acquisitions
//!    split across folders become one stacked series)
//!  - Order frames by slice location and instance number, stack them and
//!    record where each slice starts
//!  - Resize every frame so its shorter side matches the target size, then
//!    center-crop
//!  - Append the series to the study container
//!
//! Corrupt frames, ragged series and unreadable archives are logged and
//! skipped; a run never stops because of one bad study. Studies that
//! produced no output are listed in `failed_to_process.csv`.
//!
//! Given the same input files the stored arrays are identical from run to
//! run, regardless of file system enumeration order or worker count.
//!
//! DICOM files are assumed to have the following attributes:
//!   - No multiframe (always the first frame is used)
//!   - Grayscale or RGB pixel data
//!
//! # Examples
//!
//! ## Processing every archive of an input directory
//!
//! ```no_run
//! # use cmr_dataset::{Config, dispatch};
//! # use std::path::Path;
//! let config = Config::from_file(Path::new("config.yaml")).expect("should have loaded config");
//! config.validate().expect("config should be valid");
//! let (summary, report) = dispatch::run(&config).expect("run should have completed");
//! println!("{} failed studies listed in {}", summary.failed_studies().len(), report.display());
//! ```
//!
//! ## Reading a stored series back
//!
//! ```no_run
//! # use cmr_dataset::store::StudyContainer;
//! let container = StudyContainer::open("output/stanford_MRN1/ACC1.zarr")
//!     .expect("should have opened container");
//! for name in container.list_entries().expect("should have listed entries") {
//!     let data = container.read_series(&name).expect("should have read series");
//!     let attributes = container.read_attributes(&name).expect("should have read attributes");
//!     println!("{name}: {:?}, slices start at {:?}", data.dim(), attributes.slice_frames);
//! }
//! ```

pub mod archive;
pub mod checksum;
pub mod config;
pub mod dispatch;
pub mod enums;
pub mod frame;
pub mod grouper;
pub mod institution;
mod interpolator;
pub mod metadata_scan;
pub mod natural_order;
pub mod normalizer;
pub mod pipeline;
pub mod report;
pub mod series;
pub mod series_collator;
pub mod store;

pub use config::Config;
pub use pipeline::StudyPipeline;
pub use report::{RunSummary, StudyReport};
pub use series::CollatedSeries;
pub use store::{SeriesStoreWriter, StudyContainer, WriteOutcome};

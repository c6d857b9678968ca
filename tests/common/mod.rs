//! Synthetic studies for the integration tests.

#![allow(dead_code)]

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_dictionary_std::{tags, uids};
use flate2::{Compression as GzLevel, write::GzEncoder};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use cmr_dataset::{Config, enums::Compression};

/// Header and pixel content of one synthetic frame
#[derive(Debug, Clone)]
pub struct FrameSpec {
    pub series_description: String,
    pub patient_id: String,
    pub accession: String,
    pub instance_number: u32,
    pub slice_location: Option<f64>,
    pub rows: u16,
    pub columns: u16,
}

impl FrameSpec {
    pub fn new(series_description: &str, instance_number: u32) -> Self {
        Self {
            series_description: series_description.to_string(),
            patient_id: "MRN001".to_string(),
            accession: "ACC001".to_string(),
            instance_number,
            slice_location: None,
            rows: 16,
            columns: 16,
        }
    }

    pub fn at(mut self, slice_location: f64) -> Self {
        self.slice_location = Some(slice_location);
        self
    }

    pub fn size(mut self, rows: u16, columns: u16) -> Self {
        self.rows = rows;
        self.columns = columns;
        self
    }

    /// Deterministic pixel ramp, distinct per instance and slice
    fn pixels(&self) -> Vec<u16> {
        let offset = self.instance_number * 97 + self.slice_location.unwrap_or(0.0) as u32 * 13;
        (0..u32::from(self.rows) * u32::from(self.columns))
            .map(|i| ((offset + i * 7) % 4096) as u16)
            .collect()
    }
}

/// Write one single-frame MR image as explicit VR little endian
pub fn write_dicom(path: &Path, spec: &FrameSpec) {
    let sop_instance_uid = format!("1.2.826.0.1.3680043.10.1.{}", spec.instance_number);
    let mut elements = vec![
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uids::MR_IMAGE_STORAGE)),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop_instance_uid.as_str())),
        DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("MR")),
        DataElement::new(tags::MANUFACTURER, VR::LO, PrimitiveValue::from("GE MEDICAL SYSTEMS")),
        DataElement::new(tags::SERIES_DESCRIPTION, VR::LO, PrimitiveValue::from(spec.series_description.as_str())),
        DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from(spec.patient_id.as_str())),
        DataElement::new(tags::ACCESSION_NUMBER, VR::SH, PrimitiveValue::from(spec.accession.as_str())),
        DataElement::new(tags::MAGNETIC_FIELD_STRENGTH, VR::DS, PrimitiveValue::from("1.5")),
        DataElement::new(tags::INSTANCE_NUMBER, VR::IS, PrimitiveValue::from(spec.instance_number.to_string())),
        DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)),
        DataElement::new(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, PrimitiveValue::from("MONOCHROME2")),
        DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(spec.rows)),
        DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(spec.columns)),
        DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16)),
        DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(16_u16)),
        DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(15_u16)),
        DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0_u16)),
        DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::U16(spec.pixels().into())),
    ];
    if let Some(location) = spec.slice_location {
        elements.push(DataElement::new(
            tags::SLICE_LOCATION,
            VR::DS,
            PrimitiveValue::from(format!("{location}")),
        ));
    }

    let object = InMemDicomObject::from_element_iter(elements)
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(uids::MR_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(sop_instance_uid),
        )
        .unwrap();
    object.write_to_file(path).unwrap();
}

/// Write a series folder `<study_root>/<patient>/<folder>/<n>.dcm`
pub fn write_series_folder(study_root: &Path, folder: &str, frames: &[FrameSpec]) -> PathBuf {
    let dir = study_root.join("MRN001").join(folder);
    fs::create_dir_all(&dir).unwrap();
    for spec in frames {
        write_dicom(&dir.join(format!("{}.dcm", spec.instance_number)), spec);
    }
    dir
}

/// `count` frames of one slice
pub fn cine(series_description: &str, count: u32, location: f64) -> Vec<FrameSpec> {
    (1..=count)
        .map(|i| FrameSpec::new(series_description, i).at(location))
        .collect()
}

/// Pack a directory tree into a gzip-compressed tar archive
pub fn pack_tgz(source: &Path, archive: &Path) {
    let file = File::create(archive).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, GzLevel::fast()));
    builder.append_dir_all(".", source).unwrap();
    builder.into_inner().unwrap().finish().unwrap();
}

/// Pack a directory tree into an uncompressed tar archive
pub fn pack_tar(source: &Path, archive: &Path) {
    let mut builder = tar::Builder::new(File::create(archive).unwrap());
    builder.append_dir_all(".", source).unwrap();
    builder.finish().unwrap();
}

/// Workspace layout for one test run
pub struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["archives", "output", "scratch", "studies"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        Self { dir }
    }

    pub fn archives(&self) -> PathBuf {
        self.dir.path().join("archives")
    }

    pub fn output(&self) -> PathBuf {
        self.dir.path().join("output")
    }

    pub fn scratch(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    /// Fresh directory for building a study before packing it
    pub fn study_dir(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join("studies").join(name);
        fs::create_dir_all(&path).unwrap();
        path
    }

    /// Pack a built study into `archives/<name>`
    pub fn add_archive(&self, study_root: &Path, name: &str) {
        pack_tgz(study_root, &self.archives().join(name));
    }

    /// Pack a built study into `archives/<name>` without compression
    pub fn add_tar_archive(&self, study_root: &Path, name: &str) {
        pack_tar(study_root, &self.archives().join(name));
    }

    /// Small-frame configuration pointing at this workspace
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.institution = "test".to_string();
        config.input.root_dir = self.archives();
        config.output.output_dir = self.output();
        config.output.compression = Compression::Gzip;
        config.output.compression_level = 1;
        config.processing.scratch_dir = self.scratch();
        config.processing.frame_size = 16;
        config.processing.workers = 2;
        config
    }
}

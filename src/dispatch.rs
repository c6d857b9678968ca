//! Fans study archives out to a bounded pool of workers.

use crate::config::Config;
use crate::pipeline::StudyPipeline;
use crate::report::{
    FAILED_STUDIES_FILE, RunSummary, StudyReport, read_filename_list, write_filename_list,
};

use anyhow::{Context, Result};
use rayon::prelude::*;
use std::{
    any::Any,
    collections::BTreeSet,
    fs,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{debug, error, info, warn};

fn has_archive_extension(file_name: &str, extensions: &[String]) -> bool {
    let lower = file_name.to_ascii_lowercase();
    extensions.iter().any(|ext| {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        lower.len() > ext.len() + 1 && lower.ends_with(&format!(".{ext}"))
    })
}

/// Archive file names directly below `root_dir`, sorted and deduplicated.
///
/// With a safelist only the listed archives are returned; listed names
/// that do not exist are reported and skipped.
pub fn discover_archives(
    root_dir: &Path,
    extensions: &[String],
    safelist: Option<&[String]>,
) -> Result<Vec<String>> {
    let mut found = BTreeSet::new();
    let entries = fs::read_dir(root_dir)
        .with_context(|| format!("cannot read input directory {}", root_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            warn!(path = %entry.path().display(), "skipping non UTF-8 file name");
            continue;
        };
        if has_archive_extension(&name, extensions) {
            found.insert(name);
        } else {
            debug!(file = %name, "not an archive");
        }
    }

    let Some(safelist) = safelist else {
        return Ok(found.into_iter().collect());
    };
    let allowed: BTreeSet<&str> = safelist.iter().map(String::as_str).collect();
    for name in &allowed {
        if !found.contains(*name) {
            warn!(archive = %name, "safelisted archive not found in input directory");
        }
    }
    Ok(found
        .into_iter()
        .filter(|name| allowed.contains(name.as_str()))
        .collect())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Process one study, turning a worker panic into a failed report
fn run_isolated(pipeline: &StudyPipeline, archive: &str) -> StudyReport {
    match panic::catch_unwind(AssertUnwindSafe(|| pipeline.process(archive))) {
        Ok(report) => report,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(archive = %archive, panic = %message, "worker panicked");
            let mut report = StudyReport::new(archive);
            report.fail(format!("worker panicked: {message}"));
            report
        }
    }
}

/// Run every archive through its own pipeline on a pool of
/// `processing.workers` threads. Reports come back in input order.
pub fn run_studies(config: &Config, archives: &[String]) -> Result<RunSummary> {
    let pipeline = StudyPipeline::new(config)?;
    fs::create_dir_all(&config.output.output_dir).with_context(|| {
        format!(
            "cannot create output directory {}",
            config.output.output_dir.display()
        )
    })?;
    fs::create_dir_all(&config.processing.scratch_dir).with_context(|| {
        format!(
            "cannot create scratch directory {}",
            config.processing.scratch_dir.display()
        )
    })?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.processing.workers)
        .thread_name(|index| format!("study-worker-{index}"))
        .build()?;

    let reports = pool.install(|| {
        archives
            .par_iter()
            .map(|archive| run_isolated(&pipeline, archive))
            .collect()
    });
    Ok(RunSummary { reports })
}

/// Resolve the archive list for a run from the input settings
pub fn resolve_inputs(config: &Config) -> Result<Vec<String>> {
    let safelist = match &config.input.safelist {
        Some(path) => Some(
            read_filename_list(path)
                .with_context(|| format!("cannot read safelist {}", path.display()))?,
        ),
        None => None,
    };
    discover_archives(
        &config.input.root_dir,
        &config.input.extensions,
        safelist.as_deref(),
    )
}

/// Process every input study and write the failed-studies report.
///
/// Returns the run summary and the path of the report.
pub fn run(config: &Config) -> Result<(RunSummary, PathBuf)> {
    let archives = resolve_inputs(config)?;
    info!(
        archives = archives.len(),
        workers = config.processing.workers,
        "starting run"
    );

    let start = Instant::now();
    let summary = run_studies(config, &archives)?;
    let failed = summary.failed_studies();

    let report_path = config.output.output_dir.join(FAILED_STUDIES_FILE);
    write_filename_list(&report_path, &failed)?;

    info!(
        studies = summary.reports.len(),
        failed = failed.len(),
        series_written = summary.series_written(),
        series_skipped = summary.series_skipped(),
        elapsed_s = start.elapsed().as_secs_f64(),
        report = %report_path.display(),
        "run complete"
    );
    Ok((summary, report_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extensions() -> Vec<String> {
        vec!["tgz".into(), "tar.gz".into(), "tar".into()]
    }

    #[test]
    fn discovers_archives_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.tgz", "a.tar.gz", "c.tar", "notes.txt", ".tgz"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(dir.path().join("d.tgz")).unwrap();

        let archives = discover_archives(dir.path(), &extensions(), None).unwrap();
        assert_eq!(archives, vec!["a.tar.gz", "b.tgz", "c.tar"]);
    }

    #[test]
    fn safelist_restricts_and_ignores_missing() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.tgz", "b.tgz", "c.tgz"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let safelist = vec!["c.tgz".to_string(), "missing.tgz".into(), "a.tgz".into()];
        let archives = discover_archives(dir.path(), &extensions(), Some(&safelist)).unwrap();
        assert_eq!(archives, vec!["a.tgz", "c.tgz"]);
    }

    #[test]
    fn panics_are_described() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(3_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}

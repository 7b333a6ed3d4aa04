use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::info;

use super::{SAVE_RESULTS, Step, StepReport};
use crate::artifact::ArtifactRef;
use crate::error::{PipelineError, StepResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Destinations written by this call.
    pub copied: Vec<PathBuf>,
    /// Destinations that already were the source file.
    pub skipped: Vec<PathBuf>,
}

impl PublishReport {
    pub fn summary(&self) -> String {
        if self.copied.is_empty() {
            "Results already in place; nothing was copied.".to_string()
        } else {
            format!(
                "Published {} file(s): {}",
                self.copied.len(),
                self.copied
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        }
    }
}

/// Copy the model and metrics into `dest_dir`.
pub fn publish(
    model_src: &Path,
    metrics_src: &Path,
    dest_dir: &Path,
) -> StepResult<PublishReport> {
    let report = publish_files(&[model_src, metrics_src], dest_dir)?;
    println!("{}", report.summary());
    Ok(report)
}

/// Copy each source to `dest_dir/<file name>`, skipping sources that already
/// live there. Sources are never removed.
pub fn publish_files(sources: &[&Path], dest_dir: &Path) -> StepResult<PublishReport> {
    fs::create_dir_all(dest_dir).map_err(|err| PipelineError::io(dest_dir, err))?;

    let mut report = PublishReport::default();
    for &src in sources {
        let name = src.file_name().ok_or_else(|| {
            PipelineError::io(
                src,
                io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"),
            )
        })?;
        let src_canonical = src.canonicalize().map_err(|err| PipelineError::io(src, err))?;
        let dest = dest_dir.join(name);

        if is_same_file(&src_canonical, &dest) {
            info!("{} is already in {}; skipping", src.display(), dest_dir.display());
            info!("sha256 {}  {}", sha256_file(&dest)?, dest.display());
            report.skipped.push(dest);
            continue;
        }

        fs::copy(src, &dest).map_err(|err| PipelineError::io(&dest, err))?;
        info!("Copied {} -> {}", src.display(), dest.display());
        info!("sha256 {}  {}", sha256_file(&dest)?, dest.display());
        report.copied.push(dest);
    }
    Ok(report)
}

/// `dest` is resolved through any symlink; copying onto it would truncate
/// the source.
fn is_same_file(src_canonical: &Path, dest: &Path) -> bool {
    match dest.canonicalize() {
        Ok(resolved) if resolved == src_canonical => true,
        Ok(_) => same_inode(src_canonical, dest),
        Err(_) => false,
    }
}

#[cfg(unix)]
fn same_inode(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_inode(_: &Path, _: &Path) -> bool {
    false
}

pub fn sha256_file(path: &Path) -> StepResult<String> {
    let file = File::open(path).map_err(|err| PipelineError::io(path, err))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|err| PipelineError::io(path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub struct PublishStep {
    pub model: ArtifactRef,
    pub metrics: ArtifactRef,
    pub results_dir: PathBuf,
}

impl PublishStep {
    fn destination(&self, artifact: &ArtifactRef) -> ArtifactRef {
        let name = artifact.path.file_name().map(PathBuf::from).unwrap_or_default();
        ArtifactRef::new(self.results_dir.join(name), artifact.kind)
    }
}

impl Step for PublishStep {
    fn id(&self) -> &'static str {
        SAVE_RESULTS
    }

    fn inputs(&self) -> Vec<ArtifactRef> {
        vec![self.model.clone(), self.metrics.clone()]
    }

    fn outputs(&self) -> Vec<ArtifactRef> {
        vec![self.destination(&self.model), self.destination(&self.metrics)]
    }

    fn execute(&self) -> StepResult<StepReport> {
        let report = publish(&self.model.path, &self.metrics.path, &self.results_dir)?;
        Ok(StepReport {
            step: SAVE_RESULTS,
            summary: report.summary(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn copies_then_becomes_noop_in_place() {
        let temp = tempdir().unwrap();
        let model = temp.path().join("work/model.safetensors");
        let metrics = temp.path().join("work/metrics.json");
        fs::create_dir_all(model.parent().unwrap()).unwrap();
        fs::write(&model, b"weights").unwrap();
        fs::write(&metrics, b"{}").unwrap();
        let results = temp.path().join("results");

        let first = publish(&model, &metrics, &results).unwrap();
        assert_eq!(first.copied.len(), 2);
        assert!(model.exists());
        assert_eq!(fs::read(results.join("model.safetensors")).unwrap(), b"weights");

        let published_model = results.join("model.safetensors");
        let published_metrics = results.join("metrics.json");
        let second = publish(&published_model, &published_metrics, &results).unwrap();
        assert!(second.copied.is_empty());
        assert_eq!(second.skipped.len(), 2);
        assert_eq!(fs::read(&published_model).unwrap(), b"weights");
    }

    #[test]
    fn dotted_source_path_counts_as_in_place() {
        let temp = tempdir().unwrap();
        let results = temp.path().join("results");
        fs::create_dir_all(&results).unwrap();
        let file = results.join("metrics.json");
        fs::write(&file, b"{}").unwrap();

        let dotted = results.join(".").join("metrics.json");
        let report = publish_files(&[dotted.as_path()], &results).unwrap();
        assert!(report.copied.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn destination_symlink_to_source_is_skipped() {
        let temp = tempdir().unwrap();
        let work = temp.path().join("work");
        let results = temp.path().join("results");
        fs::create_dir_all(&work).unwrap();
        fs::create_dir_all(&results).unwrap();
        let model = work.join("model.safetensors");
        fs::write(&model, b"weights").unwrap();
        std::os::unix::fs::symlink(&model, results.join("model.safetensors")).unwrap();

        let report = publish_files(&[model.as_path()], &results).unwrap();
        assert!(report.copied.is_empty());
        assert_eq!(report.skipped, vec![results.join("model.safetensors")]);
        assert_eq!(fs::read(&model).unwrap(), b"weights");
    }

    #[cfg(unix)]
    #[test]
    fn destination_hard_link_to_source_is_skipped() {
        let temp = tempdir().unwrap();
        let results = temp.path().join("results");
        fs::create_dir_all(&results).unwrap();
        let metrics = temp.path().join("metrics.json");
        fs::write(&metrics, b"{\"accuracy\":1.0}").unwrap();
        fs::hard_link(&metrics, results.join("metrics.json")).unwrap();

        let report = publish_files(&[metrics.as_path()], &results).unwrap();
        assert!(report.copied.is_empty());
        assert_eq!(fs::read(&metrics).unwrap(), b"{\"accuracy\":1.0}");
    }

    #[test]
    fn missing_source_is_io_error() {
        let temp = tempdir().unwrap();
        let absent = temp.path().join("absent.json");
        let err = publish_files(&[absent.as_path()], temp.path()).unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }));
    }

    #[test]
    fn digest_is_stable() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("digest.bin");
        fs::write(&path, b"diagnosis").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), sha256_file(&path).unwrap());
        assert_eq!(sha256_file(&path).unwrap().len(), 64);
    }
}

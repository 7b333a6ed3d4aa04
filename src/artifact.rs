//! Path-addressed artifacts exchanged between pipeline steps.
//!
//! Tables travel as bincode envelopes tagged with the [`ArtifactKind`] that
//! produced them, numeric matrices and the fitted model as safetensors files
//! with their column metadata in the header.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, StepResult};
use crate::table::Table;

const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    SourceCsv,
    LoadedTable,
    CleanTable,
    Model,
    TestFeatures,
    TestLabels,
    Metrics,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::SourceCsv => "source csv",
            Self::LoadedTable => "loaded table",
            Self::CleanTable => "preprocessed table",
            Self::Model => "model",
            Self::TestFeatures => "test features",
            Self::TestLabels => "test labels",
            Self::Metrics => "metrics",
        };
        f.write_str(label)
    }
}

/// A typed reference to an artifact file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub path: PathBuf,
    pub kind: ArtifactKind,
}

impl ArtifactRef {
    pub fn new(path: impl Into<PathBuf>, kind: ArtifactKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn read_table(&self) -> StepResult<Table> {
        read_table(&self.path, self.kind)
    }

    pub fn write_table(&self, table: &Table) -> StepResult<()> {
        write_table(&self.path, self.kind, table)
    }
}

#[derive(Serialize)]
struct TableEnvelopeRef<'a> {
    version: u32,
    kind: ArtifactKind,
    table: &'a Table,
}

#[derive(Deserialize)]
struct TableEnvelope {
    version: u32,
    kind: ArtifactKind,
    table: Table,
}

pub fn ensure_parent_dir(path: &Path) -> StepResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|err| PipelineError::io(parent, err))?;
    }
    Ok(())
}

pub fn write_table(path: &Path, kind: ArtifactKind, table: &Table) -> StepResult<()> {
    ensure_parent_dir(path)?;
    let file = File::create(path).map_err(|err| PipelineError::io(path, err))?;
    let envelope = TableEnvelopeRef {
        version: ENVELOPE_VERSION,
        kind,
        table,
    };
    bincode::serialize_into(BufWriter::new(file), &envelope)
        .map_err(|err| PipelineError::io(path, io::Error::other(err.to_string())))
}

pub fn read_table(path: &Path, expected: ArtifactKind) -> StepResult<Table> {
    let file = File::open(path).map_err(|err| PipelineError::io(path, err))?;
    let envelope: TableEnvelope = bincode::deserialize_from(BufReader::new(file))
        .map_err(|err| PipelineError::parse(path, err.to_string()))?;
    if envelope.version != ENVELOPE_VERSION {
        return Err(PipelineError::parse(
            path,
            format!("unsupported table envelope version {}", envelope.version),
        ));
    }
    if envelope.kind != expected {
        return Err(PipelineError::Schema(format!(
            "'{}' holds a {}, expected a {}",
            path.display(),
            envelope.kind,
            expected
        )));
    }
    Ok(envelope.table)
}

/// One tensor to be written into a safetensors file.
pub struct TensorEntry {
    pub name: &'static str,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub bytes: Vec<u8>,
}

impl TensorEntry {
    pub fn f64(
        name: &'static str,
        shape: Vec<usize>,
        values: impl IntoIterator<Item = f64>,
    ) -> Self {
        Self {
            name,
            dtype: Dtype::F64,
            shape,
            bytes: values.into_iter().flat_map(f64::to_le_bytes).collect(),
        }
    }

    pub fn i64(
        name: &'static str,
        shape: Vec<usize>,
        values: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self {
            name,
            dtype: Dtype::I64,
            shape,
            bytes: values.into_iter().flat_map(i64::to_le_bytes).collect(),
        }
    }
}

pub fn write_safetensors(
    path: &Path,
    entries: &[TensorEntry],
    metadata: HashMap<String, String>,
) -> StepResult<()> {
    let encode_err = |message: String| PipelineError::io(path, io::Error::other(message));
    let views = entries
        .iter()
        .map(|entry| {
            TensorView::new(entry.dtype, entry.shape.clone(), &entry.bytes)
                .map(|view| (entry.name, view))
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| encode_err(format!("invalid tensor: {err}")))?;
    let bytes = safetensors::serialize(views, Some(metadata))
        .map_err(|err| encode_err(format!("safetensors serialization failed: {err}")))?;

    ensure_parent_dir(path)?;
    fs::write(path, bytes).map_err(|err| PipelineError::io(path, err))
}

/// Raw contents of a safetensors artifact: header metadata plus the file bytes.
pub struct TensorFile {
    path: PathBuf,
    data: Vec<u8>,
    metadata: HashMap<String, String>,
}

impl TensorFile {
    pub fn open(path: &Path) -> StepResult<Self> {
        let data = fs::read(path).map_err(|err| PipelineError::io(path, err))?;
        let (_, header) = SafeTensors::read_metadata(&data)
            .map_err(|err| PipelineError::parse(path, format!("invalid safetensors: {err}")))?;
        let metadata = header.metadata().clone().unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            data,
            metadata,
        })
    }

    pub fn metadata(&self, key: &str) -> StepResult<&str> {
        self.metadata.get(key).map(String::as_str).ok_or_else(|| {
            PipelineError::parse(&self.path, format!("missing metadata key '{key}'"))
        })
    }

    pub fn metadata_json<T: for<'de> Deserialize<'de>>(&self, key: &str) -> StepResult<T> {
        let raw = self.metadata(key)?;
        serde_json::from_str(raw).map_err(|err| {
            PipelineError::parse(&self.path, format!("metadata '{key}' is malformed: {err}"))
        })
    }

    pub fn f64_tensor(&self, name: &str) -> StepResult<(Vec<usize>, Vec<f64>)> {
        let (shape, bytes) = self.tensor(name, Dtype::F64)?;
        let values = bytes
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect();
        Ok((shape, values))
    }

    pub fn i64_tensor(&self, name: &str) -> StepResult<(Vec<usize>, Vec<i64>)> {
        let (shape, bytes) = self.tensor(name, Dtype::I64)?;
        let values = bytes
            .chunks_exact(8)
            .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect();
        Ok((shape, values))
    }

    fn tensor(&self, name: &str, dtype: Dtype) -> StepResult<(Vec<usize>, &[u8])> {
        let tensors = SafeTensors::deserialize(&self.data).map_err(|err| {
            PipelineError::parse(&self.path, format!("invalid safetensors: {err}"))
        })?;
        let view = tensors.tensor(name).map_err(|err| {
            PipelineError::parse(&self.path, format!("tensor '{name}' not found: {err}"))
        })?;
        if view.dtype() != dtype {
            return Err(PipelineError::parse(
                &self.path,
                format!("tensor '{name}' has dtype {:?}, expected {:?}", view.dtype(), dtype),
            ));
        }
        Ok((view.shape().to_vec(), view.data()))
    }
}

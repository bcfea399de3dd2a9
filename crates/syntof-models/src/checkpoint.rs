//! SafeTensors persistence for trained weights.
//!
//! Files live in one directory and are keyed by identifier and repetition:
//!
//! | File | Content |
//! |------|---------|
//! | `{id}_{a|b}_rep{r}.safetensors` | one pretrained branch, metadata `architecture` |
//! | `{id}_joint_rep{r}.safetensors` | both branches (`a.*`, `b.*`) and `centroids`, metadata `branch_a`, `branch_b`, `alpha` |
//!
//! Architectures are stored as JSON in the file metadata so a joint model can
//! be rebuilt without its original configuration.
//!
//! ```rust,ignore
//! let store = WeightStore::new(paths.weights_dir());
//! store.save_branch("PD", BranchId::A, 3, &branch)?;
//! let dual = store.load_dual::<CpuBackend>("PD", 3, &spec_a, &spec_b, &device)?;
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use ndarray::Array2;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use syntof_core::{Result, SyntofError};

use crate::architecture::ArchitectureSpec;
use crate::autoencoder::Autoencoder;
use crate::dual::{BranchId, DualBranchModel};
use crate::joint::DeepClusteringModel;
use crate::soft_assignment::SoftAssignment;

/// A parameter copied to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl NamedTensor {
    pub fn from_tensor<B: Backend, const D: usize>(name: String, tensor: Tensor<B, D>) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let values: Vec<f32> = tensor
            .into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(|e| SyntofError::Tensor(format!("{name}: {e:?}")))?;
        Ok(Self { name, shape, values })
    }

    pub fn to_tensor1<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1> {
        Tensor::from_data(TensorData::new(self.values.clone(), [self.values.len()]), device)
    }

    pub fn to_tensor2<B: Backend>(&self, device: &B::Device) -> Result<Tensor<B, 2>> {
        match self.shape.as_slice() {
            &[rows, cols] => Ok(Tensor::from_data(TensorData::new(self.values.clone(), [rows, cols]), device)),
            other => Err(SyntofError::Tensor(format!("{} is not 2-D: {:?}", self.name, other))),
        }
    }

    fn prefixed(mut self, prefix: &str) -> Self {
        self.name = format!("{prefix}{}", self.name);
        self
    }
}

/// Directory of persisted weights.
#[derive(Debug, Clone)]
pub struct WeightStore {
    root: PathBuf,
}

impl WeightStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn branch_path(&self, identifier: &str, branch: BranchId, repetition: usize) -> PathBuf {
        self.root.join(format!("{identifier}_{branch}_rep{repetition}.safetensors"))
    }

    pub fn joint_path(&self, identifier: &str, repetition: usize) -> PathBuf {
        self.root.join(format!("{identifier}_joint_rep{repetition}.safetensors"))
    }

    pub fn save_branch<B: Backend>(
        &self,
        identifier: &str,
        branch: BranchId,
        repetition: usize,
        model: &Autoencoder<B>,
    ) -> Result<PathBuf> {
        let path = self.branch_path(identifier, branch, repetition);
        let mut metadata = HashMap::new();
        metadata.insert("architecture".to_string(), spec_json(model.spec(), &path)?);
        write_tensors(&path, &model.named_tensors()?, metadata)?;
        tracing::info!(path = %path.display(), "saved branch weights");
        Ok(path)
    }

    /// Rebuild a branch from `spec` and load its persisted weights.
    pub fn load_branch<B: Backend>(
        &self,
        identifier: &str,
        branch: BranchId,
        repetition: usize,
        spec: &ArchitectureSpec,
        device: &B::Device,
    ) -> Result<Autoencoder<B>> {
        let path = self.branch_path(identifier, branch, repetition);
        let file = read_file(&path, "branch", identifier, repetition)?;

        let stored: ArchitectureSpec = file.metadata_json("architecture")?;
        if stored.widths != spec.widths || stored.stages != spec.ordered_stages() {
            return Err(SyntofError::IncompatibleWeights {
                path,
                reason: format!(
                    "stored widths {:?} / stages {:?}, requested {:?} / {:?}",
                    stored.widths, stored.stages, spec.widths, spec.stages
                ),
            });
        }
        let model = spec.build::<B>(device)?;
        model
            .load_named(device, |name| file.tensors.get(name))
            .map_err(|e| file.incompatible(e))
    }

    /// Load both pretrained branches of one repetition.
    pub fn load_dual<B: Backend>(
        &self,
        identifier: &str,
        repetition: usize,
        spec_a: &ArchitectureSpec,
        spec_b: &ArchitectureSpec,
        device: &B::Device,
    ) -> Result<DualBranchModel<B>> {
        let branch_a = self.load_branch(identifier, BranchId::A, repetition, spec_a, device)?;
        let branch_b = self.load_branch(identifier, BranchId::B, repetition, spec_b, device)?;
        Ok(DualBranchModel::new(branch_a, branch_b))
    }

    pub fn save_joint<B: Backend>(
        &self,
        identifier: &str,
        repetition: usize,
        model: &DeepClusteringModel<B>,
    ) -> Result<PathBuf> {
        let path = self.joint_path(identifier, repetition);

        let mut tensors = Vec::new();
        for id in BranchId::ALL {
            let prefix = format!("{id}.");
            tensors.extend(
                model
                    .embedding
                    .branch(id)
                    .named_tensors()?
                    .into_iter()
                    .map(|t| t.prefixed(&prefix)),
            );
        }
        tensors.push(NamedTensor::from_tensor(
            "centroids".to_string(),
            model.assignment.centroids.val(),
        )?);

        let mut metadata = HashMap::new();
        metadata.insert("branch_a".to_string(), spec_json(model.embedding.branch_a.spec(), &path)?);
        metadata.insert("branch_b".to_string(), spec_json(model.embedding.branch_b.spec(), &path)?);
        metadata.insert("alpha".to_string(), model.assignment.alpha().to_string());

        write_tensors(&path, &tensors, metadata)?;
        tracing::info!(path = %path.display(), clusters = model.n_clusters(), "saved joint model");
        Ok(path)
    }

    /// Rebuild a joint model entirely from its file.
    pub fn load_joint<B: Backend>(
        &self,
        identifier: &str,
        repetition: usize,
        device: &B::Device,
    ) -> Result<DeepClusteringModel<B>> {
        let path = self.joint_path(identifier, repetition);
        let file = read_file(&path, "joint", identifier, repetition)?;

        let spec_a: ArchitectureSpec = file.metadata_json("branch_a")?;
        let spec_b: ArchitectureSpec = file.metadata_json("branch_b")?;
        let alpha: f64 = file
            .metadata("alpha")?
            .parse()
            .map_err(|e| file.incompatible(format!("alpha: {e}")))?;

        let load = |id: BranchId, spec: &ArchitectureSpec| -> Result<Autoencoder<B>> {
            let prefix = format!("{id}.");
            spec.build::<B>(device)?
                .load_named(device, |name| file.tensors.get(&format!("{prefix}{name}")))
                .map_err(|e| file.incompatible(e))
        };
        let embedding = DualBranchModel::new(load(BranchId::A, &spec_a)?, load(BranchId::B, &spec_b)?);

        let centroids = file
            .tensors
            .get("centroids")
            .ok_or_else(|| file.incompatible("missing tensor 'centroids'"))?;
        let centroids = match centroids.shape.as_slice() {
            &[k, e] if e == embedding.embedding_dim() => Array2::from_shape_vec((k, e), centroids.values.clone())
                .map_err(|err| file.incompatible(err))?,
            other => {
                return Err(file.incompatible(format!(
                    "centroid shape {:?} does not match embedding width {}",
                    other,
                    embedding.embedding_dim()
                )))
            }
        };
        let assignment = SoftAssignment::from_centroids(&centroids, alpha, device);
        Ok(DeepClusteringModel::new(embedding, assignment))
    }
}

/// Tensors and metadata of one file, copied to the host.
struct LoadedFile {
    path: PathBuf,
    tensors: HashMap<String, NamedTensor>,
    metadata: HashMap<String, String>,
}

impl LoadedFile {
    fn incompatible(&self, reason: impl ToString) -> SyntofError {
        SyntofError::IncompatibleWeights {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    fn metadata(&self, key: &str) -> Result<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| self.incompatible(format!("missing metadata '{key}'")))
    }

    fn metadata_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T> {
        serde_json::from_str(self.metadata(key)?).map_err(|e| self.incompatible(format!("{key}: {e}")))
    }
}

fn spec_json(spec: &ArchitectureSpec, path: &Path) -> Result<String> {
    serde_json::to_string(spec).map_err(|e| SyntofError::IncompatibleWeights {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn write_tensors(path: &Path, tensors: &[NamedTensor], metadata: HashMap<String, String>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let incompatible = |reason: String| SyntofError::IncompatibleWeights {
        path: path.to_path_buf(),
        reason,
    };

    let views = tensors
        .iter()
        .map(|t| {
            TensorView::new(Dtype::F32, t.shape.clone(), bytemuck::cast_slice(t.values.as_slice()))
                .map(|view| (t.name.clone(), view))
                .map_err(|e| incompatible(format!("{}: {e:?}", t.name)))
        })
        .collect::<Result<Vec<_>>>()?;

    safetensors::tensor::serialize_to_file(
        views.iter().map(|(k, v)| (k.clone(), v.clone())),
        &Some(metadata),
        path,
    )
    .map_err(|e| incompatible(format!("{e:?}")))
}

fn read_file(path: &Path, kind: &str, identifier: &str, repetition: usize) -> Result<LoadedFile> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SyntofError::MissingWeights {
                kind: kind.to_string(),
                identifier: identifier.to_string(),
                repetition,
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(e.into()),
    };
    let incompatible = |reason: String| SyntofError::IncompatibleWeights {
        path: path.to_path_buf(),
        reason,
    };

    let (_, header) = SafeTensors::read_metadata(&bytes).map_err(|e| incompatible(format!("{e:?}")))?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let file = SafeTensors::deserialize(&bytes).map_err(|e| incompatible(format!("{e:?}")))?;

    let mut tensors = HashMap::new();
    for (name, view) in file.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(incompatible(format!("{name}: expected F32, got {:?}", view.dtype())));
        }
        let values = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let tensor = NamedTensor {
            name: name.clone(),
            shape: view.shape().to_vec(),
            values,
        };
        tensors.insert(name, tensor);
    }

    Ok(LoadedFile {
        path: path.to_path_buf(),
        tensors,
        metadata,
    })
}

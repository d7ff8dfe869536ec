//! Reference backend on candle.
//!
//! A compact residue model: token embedding, a tanh projection producing the
//! per-token hidden states, and a language model head producing per-token
//! logits over the ESM-2 alphabet. Embeddings are the mean hidden state over the
//! residue positions, leaving out `<cls>`, `<eos>` and padding. `sample` runs the
//! head over supplied hidden states and greedily decodes the masked positions.
//!
//! A checkpoint is a directory with `config.json` and `model.safetensors`.
use super::tokenizer::ResidueTokenizer;
use super::{BackendFault, ModelBackend};
use crate::error::BackendError;
use crate::request::{
    Operation, ResolvedOptions, EMBEDDINGS, HIDDEN_STATES, MASK, SEQUENCES, TOKEN_LOGITS,
};
use crate::tensor::{NamedTensor, TensorData, TensorMap};
use async_trait::async_trait;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Embedding, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::sync::Semaphore;

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

pub fn device(cpu: bool) -> candle_core::Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            tracing::info!("running on CPU, build with `--features metal` to run on the GPU");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            tracing::info!("running on CPU, build with `--features cuda` to run on the GPU");
        }
        Ok(Device::Cpu)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidueModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
}

impl Default for ResidueModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 33,
            hidden_size: 64,
        }
    }
}

pub struct ResidueModel {
    embed_tokens: Embedding,
    projection: Linear,
    lm_head: Linear,
    config: ResidueModelConfig,
}

impl ResidueModel {
    pub fn load(vb: VarBuilder, config: &ResidueModelConfig) -> candle_core::Result<Self> {
        let embed_tokens =
            candle_nn::embedding(config.vocab_size, config.hidden_size, vb.pp("embed_tokens"))?;
        let projection =
            candle_nn::linear(config.hidden_size, config.hidden_size, vb.pp("projection"))?;
        let lm_head =
            candle_nn::linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?;
        Ok(Self {
            embed_tokens,
            projection,
            lm_head,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ResidueModelConfig {
        &self.config
    }

    /// `[batch, tokens]` u32 ids to `[batch, tokens, hidden]`.
    pub fn hidden_states(&self, ids: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.embed_tokens.forward(ids)?;
        self.projection.forward(&xs)?.tanh()
    }

    /// `[batch, tokens, hidden]` to `[batch, tokens, vocab]`.
    pub fn logits(&self, hidden: &Tensor) -> candle_core::Result<Tensor> {
        self.lm_head.forward(hidden)
    }
}

/// Write a freshly initialized checkpoint into `dir`.
pub fn init_checkpoint(dir: &Path, config: &ResidueModelConfig) -> anyhow::Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    ResidueModel::load(vb, config)?;
    varmap.save(dir.join(WEIGHTS_FILE))?;
    std::fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(config)?)?;
    Ok(())
}

struct LoadedModel {
    model: ResidueModel,
    tokenizer: ResidueTokenizer,
    device: Device,
}

pub struct CandleBackend {
    name: String,
    loaded: RwLock<Option<Arc<LoadedModel>>>,
    // held by each blocking task until it returns, even after the caller gave up
    workers: Arc<Semaphore>,
}

impl CandleBackend {
    /// Load a checkpoint directory. Any failure leaves the backend unavailable.
    pub fn load(checkpoint: &Path, device: Device) -> Result<Self, BackendError> {
        let unavailable = |what: &str, e: &dyn std::fmt::Display| {
            BackendError::unavailable(format!(
                "failed to load {what} from {}: {e}",
                checkpoint.display()
            ))
        };
        let config_str = std::fs::read_to_string(checkpoint.join(CONFIG_FILE))
            .map_err(|e| unavailable(CONFIG_FILE, &e))?;
        let config: ResidueModelConfig =
            serde_json::from_str(&config_str).map_err(|e| unavailable(CONFIG_FILE, &e))?;

        let weights = checkpoint.join(WEIGHTS_FILE);
        if !weights.is_file() {
            return Err(unavailable(WEIGHTS_FILE, &"no such file"));
        }
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device) }
            .map_err(|e| unavailable(WEIGHTS_FILE, &e))?;
        let model = ResidueModel::load(vb, &config).map_err(|e| unavailable(WEIGHTS_FILE, &e))?;

        let tokenizer = ResidueTokenizer::esm2();
        if tokenizer.len() != config.vocab_size {
            return Err(unavailable(
                CONFIG_FILE,
                &format!(
                    "vocab_size {} does not match the {} token alphabet",
                    config.vocab_size,
                    tokenizer.len()
                ),
            ));
        }

        tracing::info!(
            checkpoint = %checkpoint.display(),
            hidden_size = config.hidden_size,
            device = ?device,
            "loaded residue model"
        );
        Ok(Self {
            name: format!("candle:{}", checkpoint.display()),
            loaded: RwLock::new(Some(Arc::new(LoadedModel {
                model,
                tokenizer,
                device,
            }))),
            workers: Arc::new(Semaphore::new(1)),
        })
    }

    /// Allow up to `workers` model runs at once. Defaults to one.
    pub fn with_max_in_flight(mut self, workers: usize) -> Self {
        self.workers = Arc::new(Semaphore::new(workers.max(1)));
        self
    }

    /// Workers not currently running the model.
    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }

    fn model(&self) -> Result<Arc<LoadedModel>, BackendFault> {
        self.loaded
            .read()
            .map_err(|_| BackendFault::Internal("model lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| BackendFault::Unavailable("model has been shut down".to_string()))
    }
}

#[async_trait]
impl ModelBackend for CandleBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        operation: Operation,
        inputs: TensorMap,
        options: &ResolvedOptions,
    ) -> Result<TensorMap, BackendFault> {
        let model = self.model()?;
        let options = *options;
        let worker = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BackendFault::Unavailable("model has been shut down".to_string()))?;
        tokio::task::spawn_blocking(move || {
            let _worker = worker;
            model.run(operation, &inputs, &options)
        })
        .await
        .map_err(|e| BackendFault::Internal(format!("model task failed: {e}")))?
    }

    async fn shutdown(&self) {
        if let Ok(mut loaded) = self.loaded.write() {
            if loaded.take().is_some() {
                tracing::info!(backend = %self.name, "model released");
            }
        }
    }
}

impl LoadedModel {
    fn run(
        &self,
        operation: Operation,
        inputs: &TensorMap,
        options: &ResolvedOptions,
    ) -> Result<TensorMap, BackendFault> {
        match operation {
            Operation::Embed | Operation::Hidden => self.encode(inputs, options),
            Operation::Sample => self.sample(inputs, options),
        }
    }

    fn encode(&self, inputs: &TensorMap, options: &ResolvedOptions) -> Result<TensorMap, BackendFault> {
        let input = inputs
            .get(SEQUENCES)
            .ok_or_else(|| rejected(SEQUENCES, "missing"))?;
        let sequences = input.to_sequences().map_err(|e| rejected(SEQUENCES, e))?;
        let batch = self.tokenizer.encode_batch(&sequences, input.shape()[1]);
        let ids = Tensor::from_vec(batch.ids, (batch.batch, batch.tokens), &self.device)?;
        let hidden = self.model.hidden_states(&ids)?;

        let mut outputs = TensorMap::new();
        if options.include_hiddens {
            insert(&mut outputs, to_named(HIDDEN_STATES, &hidden)?);
            let mask = NamedTensor::new(
                MASK,
                vec![batch.batch, batch.tokens],
                TensorData::Int64(batch.mask.clone()),
            )
            .map_err(internal)?;
            insert(&mut outputs, mask);
        }
        self.heads(&mut outputs, &hidden, &batch.mask, options)?;
        Ok(outputs)
    }

    fn sample(&self, inputs: &TensorMap, options: &ResolvedOptions) -> Result<TensorMap, BackendFault> {
        let states = inputs
            .get(HIDDEN_STATES)
            .ok_or_else(|| rejected(HIDDEN_STATES, "missing"))?;
        let &[batch, tokens, hidden_size] = states.shape() else {
            return Err(rejected(HIDDEN_STATES, "expected [batch, tokens, hidden]"));
        };
        if hidden_size != self.model.config().hidden_size {
            return Err(rejected(
                HIDDEN_STATES,
                format!(
                    "hidden size {hidden_size} does not match the model's {}",
                    self.model.config().hidden_size
                ),
            ));
        }
        let shape = (batch, tokens, hidden_size);
        let hidden = match states.data() {
            TensorData::Float32(v) => Tensor::from_slice(v, shape, &self.device)?,
            TensorData::Float16(v) => {
                Tensor::from_slice(v, shape, &self.device)?.to_dtype(DType::F32)?
            }
            _ => return Err(rejected(HIDDEN_STATES, "expected float32 or float16")),
        };
        let mask = match inputs.get(MASK).map(NamedTensor::data) {
            Some(TensorData::Int64(v)) => v.clone(),
            Some(TensorData::Int32(v)) => v.iter().map(|&m| m as i64).collect(),
            Some(_) => return Err(rejected(MASK, "expected int32 or int64")),
            None => vec![1; batch * tokens],
        };

        let best = self.model.logits(&hidden)?.argmax(D::Minus1)?.to_vec2::<u32>()?;
        let decoded: Vec<String> = best
            .iter()
            .zip(mask.chunks(tokens))
            .map(|(ids, mask)| {
                let kept: Vec<u32> = ids
                    .iter()
                    .zip(mask)
                    .filter(|(_, &m)| m != 0)
                    .map(|(&id, _)| id)
                    .collect();
                self.tokenizer.decode(&kept)
            })
            .collect();

        let mut outputs = TensorMap::new();
        insert(
            &mut outputs,
            NamedTensor::from_ascii_rows_padded(SEQUENCES, &decoded, tokens).map_err(internal)?,
        );
        self.heads(&mut outputs, &hidden, &mask, options)?;
        Ok(outputs)
    }

    /// Embedding and logit outputs shared by every operation.
    fn heads(
        &self,
        outputs: &mut TensorMap,
        hidden: &Tensor,
        mask: &[i64],
        options: &ResolvedOptions,
    ) -> Result<(), BackendFault> {
        if options.include_embeddings {
            let embeddings = mean_over_residues(hidden, mask)?;
            insert(outputs, to_named(EMBEDDINGS, &embeddings)?);
        }
        if options.include_logits {
            let logits = self.model.logits(hidden)?;
            insert(outputs, to_named(TOKEN_LOGITS, &logits)?);
        }
        Ok(())
    }
}

/// Mean over positions `1..len-1` of each row, `len` being the row's mask count.
fn mean_over_residues(hidden: &Tensor, mask: &[i64]) -> candle_core::Result<Tensor> {
    let (batch, tokens, _) = hidden.dims3()?;
    let mut weights = vec![0f32; batch * tokens];
    let mut counts = vec![1f32; batch];
    for (row, row_mask) in mask.chunks(tokens).enumerate() {
        let residues = row_mask.iter().filter(|&&m| m != 0).count().saturating_sub(2);
        weights[row * tokens + 1..row * tokens + 1 + residues].fill(1.0);
        counts[row] = residues.max(1) as f32;
    }
    let weights = Tensor::from_vec(weights, (batch, tokens, 1), hidden.device())?;
    let counts = Tensor::from_vec(counts, (batch, 1), hidden.device())?;
    hidden.broadcast_mul(&weights)?.sum(1)?.broadcast_div(&counts)
}

fn to_named(name: &str, tensor: &Tensor) -> Result<NamedTensor, BackendFault> {
    let shape = tensor.dims().to_vec();
    let data = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    NamedTensor::new(name, shape, TensorData::Float32(data)).map_err(internal)
}

fn insert(outputs: &mut TensorMap, tensor: NamedTensor) {
    outputs.insert(tensor.name().to_string(), tensor);
}

fn rejected(field: &str, reason: impl ToString) -> BackendFault {
    BackendFault::Rejected {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn internal(e: BackendError) -> BackendFault {
    BackendFault::Internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint() -> (tempfile::TempDir, CandleBackend) {
        let dir = tempfile::tempdir().unwrap();
        let config = ResidueModelConfig {
            vocab_size: 33,
            hidden_size: 8,
        };
        init_checkpoint(dir.path(), &config).unwrap();
        let backend = CandleBackend::load(dir.path(), Device::Cpu).unwrap();
        (dir, backend)
    }

    fn options(hiddens: bool, embeddings: bool, logits: bool) -> ResolvedOptions {
        ResolvedOptions {
            micro_batch_size: None,
            include_hiddens: hiddens,
            include_embeddings: embeddings,
            include_logits: logits,
        }
    }

    fn sequences(seqs: &[&str]) -> TensorMap {
        let t = NamedTensor::from_sequences(SEQUENCES, seqs).unwrap();
        [(SEQUENCES.to_string(), t)].into()
    }

    #[tokio::test]
    async fn test_hidden_outputs() {
        let (_dir, backend) = checkpoint();
        let out = backend
            .invoke(Operation::Hidden, sequences(&["ACDE", "GG"]), &options(true, true, true))
            .await
            .unwrap();
        assert_eq!(out[HIDDEN_STATES].shape(), &[2, 6, 8]);
        assert_eq!(
            out[MASK].data(),
            &TensorData::Int64(vec![1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0])
        );
        assert_eq!(out[EMBEDDINGS].shape(), &[2, 8]);
        assert_eq!(out[TOKEN_LOGITS].shape(), &[2, 6, 33]);
    }

    #[tokio::test]
    async fn test_embedding_is_mean_of_residue_states() {
        let (_dir, backend) = checkpoint();
        let out = backend
            .invoke(Operation::Embed, sequences(&["LA"]), &options(true, true, false))
            .await
            .unwrap();
        let TensorData::Float32(hidden) = out[HIDDEN_STATES].data() else {
            panic!("expected float32 hidden states");
        };
        let TensorData::Float32(embedding) = out[EMBEDDINGS].data() else {
            panic!("expected float32 embeddings");
        };
        // tokens are <cls> L A <eos>, residues sit at positions 1 and 2
        for d in 0..8 {
            let expected = (hidden[8 + d] + hidden[16 + d]) / 2.0;
            assert!((embedding[d] - expected).abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn test_sample_decodes_masked_rows() {
        let (_dir, backend) = checkpoint();
        let hidden = backend
            .invoke(Operation::Hidden, sequences(&["ACDE", "GG"]), &options(true, false, false))
            .await
            .unwrap();
        let out = backend
            .invoke(Operation::Sample, hidden, &options(false, false, false))
            .await
            .unwrap();
        let decoded = out[SEQUENCES].to_sequences().unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(decoded.iter().all(|s| s.len() <= 6));
        assert!(!out.contains_key(EMBEDDINGS));
    }

    #[tokio::test]
    async fn test_wrong_hidden_size_is_rejected() {
        let (_dir, backend) = checkpoint();
        let states =
            NamedTensor::new(HIDDEN_STATES, vec![1, 2, 3], TensorData::Float32(vec![0.0; 6])).unwrap();
        let err = backend
            .invoke(
                Operation::Sample,
                [(HIDDEN_STATES.to_string(), states)].into(),
                &options(false, false, false),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackendFault::Rejected { ref field, .. } if field == HIDDEN_STATES));
    }

    #[tokio::test]
    async fn test_abandoned_call_keeps_worker_until_done() {
        let (_dir, backend) = checkpoint();
        assert_eq!(backend.idle_workers(), 1);
        // the caller stops waiting right after the model run was handed off
        let _ = tokio::time::timeout(
            std::time::Duration::ZERO,
            backend.invoke(Operation::Embed, sequences(&["ACDE"]), &options(false, true, false)),
        )
        .await;

        for _ in 0..200 {
            if backend.idle_workers() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(backend.idle_workers(), 1);
        let out = backend
            .invoke(Operation::Embed, sequences(&["ACDE"]), &options(false, true, false))
            .await
            .unwrap();
        assert_eq!(out[EMBEDDINGS].rows(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_makes_backend_unavailable() {
        let (_dir, backend) = checkpoint();
        backend.shutdown().await;
        let err = backend
            .invoke(Operation::Embed, sequences(&["ACDE"]), &options(false, true, false))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendFault::Unavailable(_)));
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let err = CandleBackend::load(dir.path(), Device::Cpu).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::BackendUnavailable);
    }
}

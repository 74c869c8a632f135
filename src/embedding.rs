//! # Embedding provider
//!
//! Converts transaction descriptions and user questions into fixed-dimension
//! vectors. The retrieval core consumes this through the [`Embedder`] trait so
//! tests can substitute a deterministic implementation; production uses
//! [`MiniLmEmbedder`], the all-MiniLM-L6-v2 sentence model run locally with
//! Candle (pure Rust, weights fetched from the Hugging Face Hub on first use).
//!
//! The encode pipeline is tokenize → BERT forward pass → attention-masked mean
//! pooling → L2 normalization, producing 384-dimensional unit vectors.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use hf_hub::{Repo, RepoType, api::sync::Api};
use thiserror::Error;
use tokenizers::Tokenizer;

/// Dimensionality of all-MiniLM-L6-v2 sentence embeddings.
pub const EMBEDDING_DIM: usize = 384;

/// Failures from the embedding provider.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// The model could not be loaded or reached; the caller decides whether to
    /// retry, skip the record, or degrade.
    #[error("embedding model unavailable: {0}")]
    Unavailable(String),

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("model inference failed: {0}")]
    Inference(String),
}

impl From<candle_core::Error> for EmbeddingError {
    fn from(err: candle_core::Error) -> Self {
        EmbeddingError::Inference(err.to_string())
    }
}

/// Anything that can turn text into a fixed-dimension vector.
///
/// Implementations must be deterministic for a given input within one process
/// lifetime; the retrieval tiers store whatever this returns verbatim.
pub trait Embedder: Send + Sync {
    /// Dimensionality of every vector this embedder produces.
    fn dimension(&self) -> usize;

    /// Embed one piece of text.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Sentence embeddings via Candle.
pub struct MiniLmEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl MiniLmEmbedder {
    /// Load the model from the Hugging Face Hub (cached locally after the
    /// first download).
    ///
    /// # Errors
    /// Returns [`EmbeddingError::Unavailable`] if the hub is unreachable or
    /// the weights cannot be read.
    pub fn load() -> Result<Self, EmbeddingError> {
        let device = Device::Cpu;
        let model_id = "sentence-transformers/all-MiniLM-L6-v2";

        let repo = Repo::with_revision(model_id.to_string(), RepoType::Model, "main".to_string());
        let api = Api::new().map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;
        let api_repo = api.repo(repo);

        let config_filename = api_repo
            .get("config.json")
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;
        let tokenizer_filename = api_repo
            .get("tokenizer.json")
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;
        let weights_filename = api_repo
            .get("model.safetensors")
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        let config = std::fs::read_to_string(config_filename)
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;
        let config: Config = serde_json::from_str(&config)
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_filename], DTYPE, &device)
                .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?
        };
        let model = BertModel::load(vb, &config)
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        Ok(Self {
            model,
            tokenizer,
            device,
        })
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        // The tokenizer truncates at 512 tokens.
        let tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| EmbeddingError::Tokenize(e.to_string()))?;

        let token_ids = Tensor::new(tokens.get_ids(), &self.device)?.unsqueeze(0)?;
        let token_type_ids = Tensor::new(tokens.get_type_ids(), &self.device)?.unsqueeze(0)?;

        let output = self.model.forward(&token_ids, &token_type_ids, None)?;

        let pooled = self.mean_pool(&output, tokens.get_attention_mask())?;
        let normalized = Self::l2_normalize(&pooled)?;

        Ok(normalized.to_vec1::<f32>()?)
    }

    /// Mean over token embeddings, weighted by the attention mask so padding
    /// does not dilute the sentence vector.
    fn mean_pool(
        &self,
        embeddings: &Tensor,
        attention_mask: &[u32],
    ) -> Result<Tensor, EmbeddingError> {
        // embeddings: [1, seq_len, hidden]; mask must broadcast as [1, seq_len, 1]
        let mask = Tensor::new(attention_mask, &self.device)?
            .to_dtype(DType::F32)?
            .unsqueeze(0)?
            .unsqueeze(2)?;

        let masked = embeddings.broadcast_mul(&mask)?;
        let sum = masked.sum(1)?;
        let count = mask.sum(1)?.clamp(1f32, f32::INFINITY)?;
        let mean = sum.broadcast_div(&count)?;

        Ok(mean.squeeze(0)?)
    }

    fn l2_normalize(tensor: &Tensor) -> Result<Tensor, EmbeddingError> {
        let norm = tensor.sqr()?.sum_all()?.sqrt()?;
        Ok(tensor.broadcast_div(&norm)?)
    }
}

impl Embedder for MiniLmEmbedder {
    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.encode(text)
    }
}

use crate::config::{EmbedderConfig, EmbedderKind};
use crate::error::EmbedError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "onnx")]
pub use onnx::OnnxEmbedder;

/// Text-to-vector capability. Implementations return one unit-length vector
/// per input, in input order.
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    /// Generate embedding vector for a single text
    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.embed(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or(EmbedError::CountMismatch {
                expected: 1,
                got: 0,
            })
    }
}

/// Build the embedder selected in the config.
pub fn build_embedder(config: &EmbedderConfig) -> anyhow::Result<Arc<dyn Embedder>> {
    match config.kind {
        EmbedderKind::Http => Ok(Arc::new(HttpEmbedder::new(
            config.url.clone(),
            config.timeout(),
        ))),
        #[cfg(feature = "onnx")]
        EmbedderKind::Onnx => {
            let dir = match &config.model_dir {
                Some(dir) => dir.clone(),
                None => onnx::default_model_dir()?,
            };
            Ok(Arc::new(OnnxEmbedder::new(&dir)?))
        }
        #[cfg(not(feature = "onnx"))]
        EmbedderKind::Onnx => Err(anyhow::anyhow!(
            "embedder kind \"onnx\" requires building with `--features onnx`"
        )),
    }
}

/// Normalize embeddings to unit length (for inner-product similarity)
pub fn normalize(embedding: &[f32]) -> Vec<f32> {
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return embedding.to_vec();
    }
    embedding.iter().map(|x| x / norm).collect()
}

fn check_count(expected: usize, vectors: &[Vec<f32>]) -> Result<(), EmbedError> {
    if vectors.len() != expected {
        return Err(EmbedError::CountMismatch {
            expected,
            got: vectors.len(),
        });
    }
    Ok(())
}

// ============================================================================
// Remote model service
// ============================================================================

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    model: Option<String>,
}

/// Embedder backed by an HTTP model service.
///
/// Request: `POST <url>` with `{"texts": ["..."]}`.
/// Response: `{"embeddings": [[...], ...], "model": "optional name"}`.
pub struct HttpEmbedder {
    url: String,
    agent: ureq::Agent,
}

impl HttpEmbedder {
    pub fn new(url: String, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { url, agent }
    }
}

impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.url
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let response = match self
            .agent
            .post(&self.url)
            .send_json(EmbedRequest { texts })
        {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(EmbedError::Request(format!(
                    "{} returned {}: {}",
                    self.url, code, body
                )));
            }
            Err(e) => return Err(EmbedError::Request(e.to_string())),
        };

        let parsed: EmbedResponse = response
            .into_json()
            .map_err(|e| EmbedError::Request(format!("invalid response body: {}", e)))?;
        if let Some(model) = &parsed.model {
            log::debug!("Embedded {} texts with {}", texts.len(), model);
        }

        check_count(texts.len(), &parsed.embeddings)?;
        Ok(parsed.embeddings.iter().map(|v| normalize(v)).collect())
    }
}

// ============================================================================
// Local ONNX model
// ============================================================================

#[cfg(feature = "onnx")]
mod onnx {
    use super::{check_count, normalize, Embedder};
    use crate::error::EmbedError;
    use anyhow::{Context, Result};
    use ndarray::Array2;
    use ort::session::builder::GraphOptimizationLevel;
    use ort::session::{Session, SessionInputValue};
    use ort::value::Tensor;
    use std::borrow::Cow;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use tokenizers::Tokenizer;

    const MAX_SEQ_LENGTH: usize = 512;

    /// Local sentence-embedding model (BERT-style ONNX export, e.g.
    /// `BAAI/bge-small-zh-v1.5`) with CLS pooling.
    ///
    /// Expected directory structure:
    /// ```text
    /// <model_dir>/
    /// ├── model.onnx
    /// └── tokenizer.json
    /// ```
    pub struct OnnxEmbedder {
        session: Mutex<Session>,
        tokenizer: Tokenizer,
        name: String,
    }

    pub fn default_model_dir() -> Result<PathBuf> {
        let home = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE"))?;
        Ok(PathBuf::from(home)
            .join(".novelseek")
            .join("models")
            .join("bge-small-zh-v1.5"))
    }

    impl OnnxEmbedder {
        pub fn new(model_dir: &Path) -> Result<Self> {
            let model_path = model_dir.join("model.onnx");
            let tokenizer_path = model_dir.join("tokenizer.json");

            if !model_path.exists() {
                return Err(anyhow::anyhow!(
                    "Model file not found at {:?}. Please download the ONNX model first.",
                    model_path
                ));
            }
            if !tokenizer_path.exists() {
                return Err(anyhow::anyhow!(
                    "Tokenizer file not found at {:?}. Please download tokenizer.json first.",
                    tokenizer_path
                ));
            }

            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(4)?
                .commit_from_file(&model_path)
                .context("Failed to load ONNX model")?;

            let tokenizer = Tokenizer::from_file(&tokenizer_path)
                .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

            log::info!("Embedding model loaded successfully from {:?}", model_dir);

            Ok(Self {
                session: Mutex::new(session),
                tokenizer,
                name: model_dir.display().to_string(),
            })
        }

        fn run(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let encodings = self
                .tokenizer
                .encode_batch(texts.to_vec(), true)
                .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;

            let batch_size = texts.len();
            let seq_len = encodings
                .iter()
                .map(|e| e.get_ids().len())
                .max()
                .unwrap_or(1)
                .clamp(1, MAX_SEQ_LENGTH);

            let mut input_ids = Vec::with_capacity(batch_size * seq_len);
            let mut attention_mask = Vec::with_capacity(batch_size * seq_len);
            let mut type_ids = Vec::with_capacity(batch_size * seq_len);
            for encoding in &encodings {
                let ids = encoding.get_ids();
                let mask = encoding.get_attention_mask();
                let types = encoding.get_type_ids();
                for i in 0..seq_len {
                    input_ids.push(ids.get(i).copied().unwrap_or(0) as i64);
                    attention_mask.push(mask.get(i).copied().unwrap_or(0) as i64);
                    type_ids.push(types.get(i).copied().unwrap_or(0) as i64);
                }
            }

            let input_ids = Array2::from_shape_vec((batch_size, seq_len), input_ids)?;
            let attention_mask = Array2::from_shape_vec((batch_size, seq_len), attention_mask)?;
            let type_ids = Array2::from_shape_vec((batch_size, seq_len), type_ids)?;

            let mut session = self
                .session
                .lock()
                .map_err(|_| anyhow::anyhow!("ONNX session lock poisoned"))?;

            let wants_type_ids = session.inputs.iter().any(|i| i.name == "token_type_ids");
            let mut inputs: Vec<(Cow<'_, str>, SessionInputValue<'_>)> = vec![
                ("input_ids".into(), Tensor::from_array(input_ids)?.into()),
                ("attention_mask".into(), Tensor::from_array(attention_mask)?.into()),
            ];
            if wants_type_ids {
                inputs.push(("token_type_ids".into(), Tensor::from_array(type_ids)?.into()));
            }

            let outputs = session.run(inputs).context("ONNX inference failed")?;
            let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

            // [batch, seq, hidden] -> CLS token; [batch, hidden] is already pooled
            let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            let (stride, hidden) = match dims.as_slice() {
                [_, seq, hidden] => (seq * hidden, *hidden),
                [_, hidden] => (*hidden, *hidden),
                other => anyhow::bail!("unexpected model output shape {:?}", other),
            };

            Ok((0..batch_size)
                .map(|b| normalize(&data[b * stride..b * stride + hidden]))
                .collect())
        }
    }

    impl Embedder for OnnxEmbedder {
        fn model_name(&self) -> &str {
            &self.name
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            if texts.is_empty() {
                return Ok(vec![]);
            }
            let vectors = self
                .run(texts)
                .map_err(|e| EmbedError::Inference(format!("{:#}", e)))?;
            check_count(texts.len(), &vectors)?;
            Ok(vectors)
        }
    }
}

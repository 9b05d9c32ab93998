use anyhow::{anyhow, bail, Context, Result};
use candle::{DType, Device, Tensor};
use candle_transformers::models::t5::{self, T5ForConditionalGeneration};
use std::{fs, path::Path};
use tokenizers::{Tokenizer, TruncationParams};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    build_prompt,
    checkpoint::{build_var_builder, CheckpointFiles},
    device::build_device,
    generation::{generate, NextTokenLogits, SpecialTokens},
    Summarizer,
};
use crate::config::{GenerationConfig, ServiceConfig};

// ---------------------------------------------------------
// PUBLIC SERVICE
// ---------------------------------------------------------
pub struct T5Summarizer {
    // The decoder KV cache makes every forward pass `&mut`.
    model: Mutex<T5ForConditionalGeneration>,
    tokenizer: Tokenizer,
    device: Device,
    generation: GenerationConfig,
    special: SpecialTokens,
    use_cache: bool,
}

impl T5Summarizer {
    pub async fn load(config: &ServiceConfig) -> Result<Self> {
        info!("🧠 Loading T5 from {}", config.model);
        let files = CheckpointFiles::resolve(&config.model).await?;

        let device = build_device(config.device.as_deref())?;
        info!("🔌 T5 → {device:?}");

        let tokenizer = load_tokenizer(&files.tokenizer, config.generation.max_input_tokens)?;

        let raw = fs::read(&files.config)
            .with_context(|| format!("failed to read {}", files.config.display()))?;
        let mut model_config: t5::Config = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", files.config.display()))?;

        let use_cache = config.generation.strategy.uses_kv_cache();
        model_config.use_cache = use_cache;

        let special = SpecialTokens {
            decoder_start: model_config
                .decoder_start_token_id
                .unwrap_or(model_config.pad_token_id) as u32,
            eos: model_config.eos_token_id as u32,
        };

        // T5 activations overflow in f16.
        let vb = build_var_builder(&files.weights, DType::F32, &device)?;
        let model = T5ForConditionalGeneration::load(vb, &model_config)
            .context("failed to build T5 model")?;

        info!(
            "🚀 T5 ready ({} layers, d_model={}) with {}",
            model_config.num_layers, model_config.d_model, config.generation.strategy
        );

        Ok(Self {
            model: Mutex::new(model),
            tokenizer,
            device,
            generation: config.generation.clone(),
            special,
            use_cache,
        })
    }
}

impl Summarizer for T5Summarizer {
    /// Blocks the calling thread for the whole generation; run it off the
    /// async reactor.
    fn summarize(&self, text: &str) -> Result<String> {
        let encoding = self
            .tokenizer
            .encode(build_prompt(text), true)
            .map_err(|e| anyhow!("T5 encode error: {e}"))?;
        let input_ids = encoding.get_ids();
        debug!(
            input_tokens = input_ids.len(),
            truncated = !encoding.get_overflowing().is_empty(),
            "prompt encoded"
        );

        let input = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;

        let output = {
            let mut model = self.model.blocking_lock();
            model.clear_kv_cache();
            let encoder_output = model.encode(&input)?;

            let mut decoder = T5Decoder {
                model: &mut *model,
                encoder_output,
                expanded: None,
                device: &self.device,
                use_cache: self.use_cache,
                fed: 0,
            };
            generate(&self.generation.strategy, self.special, &mut decoder)?
        };
        debug!(output_tokens = output.len(), "generation finished");

        self.tokenizer
            .decode(&output, true)
            .map_err(|e| anyhow!("T5 decode error: {e}"))
    }
}

// ---------------------------------------------------------
// Decoder step
// ---------------------------------------------------------

struct T5Decoder<'a> {
    model: &'a mut T5ForConditionalGeneration,
    encoder_output: Tensor,
    /// Encoder output broadcast to the current beam count.
    expanded: Option<(usize, Tensor)>,
    device: &'a Device,
    use_cache: bool,
    /// Tokens already pushed through the KV cache.
    fed: usize,
}

impl T5Decoder<'_> {
    fn encoder_output_for(&mut self, batch: usize) -> Result<Tensor> {
        if batch == 1 {
            return Ok(self.encoder_output.clone());
        }
        if let Some((size, tensor)) = &self.expanded {
            if *size == batch {
                return Ok(tensor.clone());
            }
        }
        let (_, src_len, hidden) = self.encoder_output.dims3()?;
        let tensor = self
            .encoder_output
            .broadcast_as((batch, src_len, hidden))?
            .contiguous()?;
        self.expanded = Some((batch, tensor.clone()));
        Ok(tensor)
    }
}

impl NextTokenLogits for T5Decoder<'_> {
    fn next_token_logits(&mut self, sequences: &[Vec<u32>]) -> Result<Vec<Vec<f32>>> {
        let batch = sequences.len();
        let seq_len = sequences
            .first()
            .map(Vec::len)
            .ok_or_else(|| anyhow!("empty decoder batch"))?;
        if sequences.iter().any(|s| s.len() != seq_len) {
            bail!("decoder batch has ragged sequences");
        }
        if self.use_cache && batch != 1 {
            bail!("KV-cached decoding supports a single sequence, got {batch}");
        }

        let start = if self.use_cache { self.fed } else { 0 };
        let ids: Vec<u32> = sequences
            .iter()
            .flat_map(|s| s[start..].iter().copied())
            .collect();
        let ids = Tensor::from_vec(ids, (batch, seq_len - start), self.device)?;

        let encoder_output = self.encoder_output_for(batch)?;
        let logits = self.model.decode(&ids, &encoder_output)?;
        if self.use_cache {
            self.fed = seq_len;
        }

        Ok(logits.to_dtype(DType::F32)?.to_vec2::<f32>()?)
    }
}

fn load_tokenizer(path: &Path, max_input_tokens: usize) -> Result<Tokenizer> {
    let mut tokenizer = Tokenizer::from_file(path)
        .map_err(|e| anyhow!("Tokenizer load failed ({}): {e}", path.display()))?;
    tokenizer.with_padding(None);
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: max_input_tokens,
            ..Default::default()
        }))
        .map_err(|e| anyhow!("invalid truncation settings: {e}"))?;
    Ok(tokenizer)
}

use anyhow::{anyhow, bail, Context, Result};
use std::{fmt, net::SocketAddr, path::PathBuf, str::FromStr};

pub const DEFAULT_ADDR: &str = "127.0.0.1:5000";
pub const DEFAULT_REVISION: &str = "main";
pub const DEFAULT_MAX_INPUT_TOKENS: usize = 512;

// ---------------------------------------------------------
// Model source
// ---------------------------------------------------------

/// Where the checkpoint is loaded from at startup.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    /// Public pretrained checkpoint, fetched through the HF hub cache.
    Hub { repo: String, revision: String },
    /// Locally fine-tuned checkpoint. `tokenizer` is the hub repo used when
    /// the directory carries no `tokenizer.json` of its own.
    Local { dir: PathBuf, tokenizer: String },
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Hub { repo, revision } => write!(f, "hub:{repo}@{revision}"),
            ModelSource::Local { dir, tokenizer } => {
                write!(f, "local:{} (tokenizer fallback {tokenizer})", dir.display())
            }
        }
    }
}

// ---------------------------------------------------------
// Decoding strategy
// ---------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct BeamSearchParams {
    pub num_beams: usize,
    /// Upper bound on decoder tokens, start token included.
    pub max_length: usize,
    /// EOS is masked until the sequence reaches this length.
    pub min_length: usize,
    /// Stop as soon as `num_beams` hypotheses are complete.
    pub early_stopping: bool,
    pub length_penalty: f64,
}

impl Default for BeamSearchParams {
    fn default() -> Self {
        Self {
            num_beams: 4,
            max_length: 200,
            min_length: 0,
            early_stopping: true,
            length_penalty: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// `0.0` degenerates to greedy argmax.
    pub temperature: f64,
    /// `0` disables top-k filtering.
    pub top_k: usize,
    /// `1.0` disables nucleus filtering.
    pub top_p: f64,
    pub max_length: usize,
    pub min_length: usize,
    /// Fixed seed for reproducible output; a fresh one is drawn per request otherwise.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 50,
            top_p: 0.95,
            max_length: 200,
            min_length: 100,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodingStrategy {
    BeamSearch(BeamSearchParams),
    Sampling(SamplingParams),
}

impl DecodingStrategy {
    pub fn max_length(&self) -> usize {
        match self {
            DecodingStrategy::BeamSearch(p) => p.max_length,
            DecodingStrategy::Sampling(p) => p.max_length,
        }
    }

    pub fn min_length(&self) -> usize {
        match self {
            DecodingStrategy::BeamSearch(p) => p.min_length,
            DecodingStrategy::Sampling(p) => p.min_length,
        }
    }

    /// Beam search re-runs the decoder over all beams at once, so only the
    /// single-sequence sampler can keep an incremental KV cache.
    pub fn uses_kv_cache(&self) -> bool {
        matches!(self, DecodingStrategy::Sampling(_))
    }
}

impl fmt::Display for DecodingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodingStrategy::BeamSearch(p) => write!(
                f,
                "beam search (beams={}, len={}..{}, early_stopping={}, length_penalty={})",
                p.num_beams, p.min_length, p.max_length, p.early_stopping, p.length_penalty
            ),
            DecodingStrategy::Sampling(p) => write!(
                f,
                "sampling (temperature={}, top_k={}, top_p={}, len={}..{}, seed={:?})",
                p.temperature, p.top_k, p.top_p, p.min_length, p.max_length, p.seed
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodingKind {
    Beam,
    Sampling,
}

impl FromStr for DecodingKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "beam" | "beam-search" | "beam_search" => Ok(DecodingKind::Beam),
            "sampling" | "sample" => Ok(DecodingKind::Sampling),
            other => Err(anyhow!("unknown decoding strategy '{other}' (expected beam|sampling)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// Prompts longer than this are truncated before encoding.
    pub max_input_tokens: usize,
    pub strategy: DecodingStrategy,
}

// ---------------------------------------------------------
// Presets
// ---------------------------------------------------------

/// The two shipped configurations of the same handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// Pretrained `t5-base`, stochastic sampling.
    BaseSampling,
    /// Fine-tuned `t5-small` weights under `./model/`, beam search.
    SmallBeam,
}

impl Preset {
    pub fn name(&self) -> &'static str {
        match self {
            Preset::BaseSampling => "base-sampling",
            Preset::SmallBeam => "small-beam",
        }
    }

    fn tokenizer_repo(&self) -> &'static str {
        match self {
            Preset::BaseSampling => "t5-base",
            Preset::SmallBeam => "t5-small",
        }
    }

    fn model_source(&self) -> ModelSource {
        match self {
            Preset::BaseSampling => ModelSource::Hub {
                repo: "t5-base".into(),
                revision: DEFAULT_REVISION.into(),
            },
            Preset::SmallBeam => ModelSource::Local {
                dir: PathBuf::from("./model/"),
                tokenizer: self.tokenizer_repo().into(),
            },
        }
    }

    fn decoding(&self) -> DecodingKind {
        match self {
            Preset::BaseSampling => DecodingKind::Sampling,
            Preset::SmallBeam => DecodingKind::Beam,
        }
    }
}

impl FromStr for Preset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "base-sampling" | "base" => Ok(Preset::BaseSampling),
            "small-beam" | "small" => Ok(Preset::SmallBeam),
            other => Err(anyhow!(
                "unknown preset '{other}' (expected base-sampling|small-beam)"
            )),
        }
    }
}

// ---------------------------------------------------------
// Service config
// ---------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub preset: Preset,
    pub addr: SocketAddr,
    pub model: ModelSource,
    /// Raw `SUMMARIZER_DEVICE` preference; `None` means auto.
    pub device: Option<String>,
    pub generation: GenerationConfig,
}

impl ServiceConfig {
    /// Reads `.env` (if present) and the process environment.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let preset = parse_var::<Preset>(&var, "SUMMARIZER_PRESET")?.unwrap_or(Preset::BaseSampling);

        let addr = match parse_var::<SocketAddr>(&var, "SUMMARIZER_ADDR")? {
            Some(addr) => addr,
            None => DEFAULT_ADDR.parse()?,
        };

        let revision = var("SUMMARIZER_REVISION").unwrap_or_else(|| DEFAULT_REVISION.into());
        let tokenizer = var("SUMMARIZER_TOKENIZER");
        let model = match (var("SUMMARIZER_MODEL_DIR"), var("SUMMARIZER_MODEL")) {
            (Some(dir), repo) => ModelSource::Local {
                dir: PathBuf::from(dir),
                tokenizer: tokenizer
                    .or(repo)
                    .unwrap_or_else(|| preset.tokenizer_repo().into()),
            },
            (None, Some(repo)) => ModelSource::Hub { repo, revision },
            (None, None) => match preset.model_source() {
                ModelSource::Hub { repo, .. } => ModelSource::Hub { repo, revision },
                ModelSource::Local { dir, tokenizer: fallback } => ModelSource::Local {
                    dir,
                    tokenizer: tokenizer.unwrap_or(fallback),
                },
            },
        };

        let max_input_tokens = parse_var(&var, "SUMMARIZER_MAX_INPUT_TOKENS")?
            .unwrap_or(DEFAULT_MAX_INPUT_TOKENS);
        if max_input_tokens == 0 {
            bail!("SUMMARIZER_MAX_INPUT_TOKENS must be positive");
        }

        let kind = parse_var::<DecodingKind>(&var, "SUMMARIZER_DECODING")?
            .unwrap_or_else(|| preset.decoding());
        let strategy = match kind {
            DecodingKind::Beam => {
                let d = BeamSearchParams::default();
                DecodingStrategy::BeamSearch(BeamSearchParams {
                    num_beams: parse_var(&var, "SUMMARIZER_NUM_BEAMS")?.unwrap_or(d.num_beams),
                    max_length: parse_var(&var, "SUMMARIZER_MAX_LENGTH")?.unwrap_or(d.max_length),
                    min_length: parse_var(&var, "SUMMARIZER_MIN_LENGTH")?.unwrap_or(d.min_length),
                    early_stopping: parse_bool(&var, "SUMMARIZER_EARLY_STOPPING")?
                        .unwrap_or(d.early_stopping),
                    length_penalty: parse_var(&var, "SUMMARIZER_LENGTH_PENALTY")?
                        .unwrap_or(d.length_penalty),
                })
            }
            DecodingKind::Sampling => {
                let d = SamplingParams::default();
                DecodingStrategy::Sampling(SamplingParams {
                    temperature: parse_var(&var, "SUMMARIZER_TEMPERATURE")?.unwrap_or(d.temperature),
                    top_k: parse_var(&var, "SUMMARIZER_TOP_K")?.unwrap_or(d.top_k),
                    top_p: parse_var(&var, "SUMMARIZER_TOP_P")?.unwrap_or(d.top_p),
                    max_length: parse_var(&var, "SUMMARIZER_MAX_LENGTH")?.unwrap_or(d.max_length),
                    min_length: parse_var(&var, "SUMMARIZER_MIN_LENGTH")?.unwrap_or(d.min_length),
                    seed: parse_var(&var, "SUMMARIZER_SEED")?,
                })
            }
        };
        validate_strategy(&strategy)?;

        Ok(Self {
            preset,
            addr,
            model,
            device: var("SUMMARIZER_DEVICE"),
            generation: GenerationConfig {
                max_input_tokens,
                strategy,
            },
        })
    }
}

fn validate_strategy(strategy: &DecodingStrategy) -> Result<()> {
    // The decoder start token occupies the first position.
    if strategy.max_length() < 2 {
        bail!("SUMMARIZER_MAX_LENGTH must be at least 2");
    }
    if strategy.min_length() > strategy.max_length() {
        bail!(
            "SUMMARIZER_MIN_LENGTH ({}) exceeds SUMMARIZER_MAX_LENGTH ({})",
            strategy.min_length(),
            strategy.max_length()
        );
    }

    match strategy {
        DecodingStrategy::BeamSearch(p) => {
            if p.num_beams == 0 {
                bail!("SUMMARIZER_NUM_BEAMS must be at least 1");
            }
            if !p.length_penalty.is_finite() {
                bail!("SUMMARIZER_LENGTH_PENALTY must be finite");
            }
        }
        DecodingStrategy::Sampling(p) => {
            if !(p.temperature >= 0.0 && p.temperature.is_finite()) {
                bail!("SUMMARIZER_TEMPERATURE must be a non-negative number");
            }
            if !(p.top_p > 0.0 && p.top_p <= 1.0) {
                bail!("SUMMARIZER_TOP_P must be in (0, 1]");
            }
        }
    }
    Ok(())
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    var(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| anyhow!("{e}"))
                .with_context(|| format!("invalid {key}='{raw}'"))
        })
        .transpose()
}

fn parse_bool(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    var(key)
        .map(|raw| match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow!("invalid {key}='{raw}' (expected true|false)")),
        })
        .transpose()
}

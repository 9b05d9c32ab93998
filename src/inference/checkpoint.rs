use anyhow::{anyhow, Context, Result};
use candle::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::{api::tokio::Api, Repo, RepoType};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::ModelSource;

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHT_CANDIDATES: [&str; 2] = ["model.safetensors", "pytorch_model.bin"];

/// On-disk paths of everything needed to build the model.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointFiles {
    pub config: PathBuf,
    pub weights: PathBuf,
    pub tokenizer: PathBuf,
}

impl CheckpointFiles {
    pub async fn resolve(source: &ModelSource) -> Result<Self> {
        match source {
            ModelSource::Hub { repo, revision } => {
                let api = Api::new().context("failed to initialise HF hub client")?;
                let repo = api.repo(Repo::with_revision(
                    repo.clone(),
                    RepoType::Model,
                    revision.clone(),
                ));
                let config = repo
                    .get(CONFIG_FILE)
                    .await
                    .with_context(|| format!("failed to fetch {CONFIG_FILE} from {source}"))?;
                let tokenizer = repo
                    .get(TOKENIZER_FILE)
                    .await
                    .with_context(|| format!("failed to fetch {TOKENIZER_FILE} from {source}"))?;

                let mut weights = None;
                for candidate in WEIGHT_CANDIDATES {
                    match repo.get(candidate).await {
                        Ok(path) => {
                            weights = Some(path);
                            break;
                        }
                        Err(err) => debug!("{candidate} not available from {source}: {err}"),
                    }
                }
                let weights =
                    weights.ok_or_else(|| anyhow!("no model weights found in {source}"))?;

                info!("📦 Checkpoint fetched from {source}");
                Ok(Self {
                    config,
                    weights,
                    tokenizer,
                })
            }
            ModelSource::Local { dir, tokenizer } => {
                let local = LocalCheckpoint::scan(dir)?;
                let tokenizer = match local.tokenizer {
                    Some(path) => path,
                    None => {
                        info!(
                            "no {TOKENIZER_FILE} under {}, using tokenizer from hub:{tokenizer}",
                            dir.display()
                        );
                        Api::new()
                            .context("failed to initialise HF hub client")?
                            .model(tokenizer.clone())
                            .get(TOKENIZER_FILE)
                            .await
                            .with_context(|| {
                                format!("failed to fetch {TOKENIZER_FILE} from hub:{tokenizer}")
                            })?
                    }
                };

                info!("📁 Local checkpoint: {}", dir.display());
                Ok(Self {
                    config: local.config,
                    weights: local.weights,
                    tokenizer,
                })
            }
        }
    }
}

/// Files found in a fine-tuned checkpoint directory.
#[derive(Debug)]
struct LocalCheckpoint {
    config: PathBuf,
    weights: PathBuf,
    tokenizer: Option<PathBuf>,
}

impl LocalCheckpoint {
    fn scan(dir: &Path) -> Result<Self> {
        let config = dir.join(CONFIG_FILE);
        if !config.exists() {
            return Err(anyhow!("{CONFIG_FILE} not found under {}", dir.display()));
        }
        let weights = find_model_weights(dir)
            .ok_or_else(|| anyhow!("no model weights found under {}", dir.display()))?;
        let tokenizer = Some(dir.join(TOKENIZER_FILE)).filter(|p| p.exists());

        Ok(Self {
            config,
            weights,
            tokenizer,
        })
    }
}

fn find_model_weights(dir: &Path) -> Option<PathBuf> {
    WEIGHT_CANDIDATES
        .iter()
        .map(|candidate| dir.join(candidate))
        .find(|path| path.exists())
}

/// Memory-maps safetensors; anything else is read as a PyTorch pickle.
pub fn build_var_builder(path: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let is_safetensors = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"));
    let vb = if is_safetensors {
        unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device) }
    } else {
        VarBuilder::from_pth(path, dtype, device)
    };
    vb.with_context(|| format!("failed to load weights from {}", path.display()))
}

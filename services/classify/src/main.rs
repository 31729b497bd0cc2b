use anyhow::{Context, Result};
use clap::Parser;
use coach_core::retry::transient;
use coach_core::{init_tracing, load_config, retry_async, ArtifactKind, RegistryClient, RetryConfig};
use std::path::{Path, PathBuf};
use tracing::info;

/// Cache a model from the Coach registry and classify an image with it.
#[derive(Debug, Parser)]
#[command(name = "coach-classify", version)]
struct Args {
    /// Registry api key; the first five characters name the profile.
    #[arg(long, env = "COACH_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Model name as listed in the profile.
    #[arg(long)]
    model: String,

    /// Image to classify. Without it the model is only cached.
    #[arg(long)]
    image: Option<PathBuf>,

    /// Overrides the configured cache root.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    #[arg(long, default_value_t = ArtifactKind::Frozen)]
    kind: ArtifactKind,

    /// Download even when the cached version matches the registry.
    #[arg(long)]
    no_skip: bool,

    #[arg(long, default_value_t = 5)]
    top: usize,

    /// Extra attempts for failed downloads.
    #[arg(long, default_value_t = 3)]
    retries: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("coach-classify");
    let args = Args::parse();

    let cfg = load_config().context("loading client config")?;
    let cache_dir = args.cache_dir.clone().unwrap_or_else(|| cfg.cache_dir.clone());
    let mut client = RegistryClient::new(cfg)?;
    let profile = client.login(&args.api_key).await?;
    info!(profile = %profile.id, models = profile.models.len(), "logged in");

    let retry = RetryConfig { max_retries: args.retries, ..Default::default() };
    let client = &client;
    let outcome = retry_async(&retry, transient, |_| client.resolve_and_cache(&args.model, &cache_dir, !args.no_skip, args.kind))
        .await
        .with_context(|| format!("caching model '{}'", args.model))?;
    info!(dir = %outcome.model_dir.display(), version = outcome.version, downloaded = outcome.downloaded, "model ready");

    match &args.image {
        Some(image) => classify(&outcome.model_dir, args.kind, image, args.top).await,
        None => Ok(()),
    }
}

#[cfg(feature = "tensorflow")]
async fn classify(model_dir: &Path, kind: ArtifactKind, image: &Path, top: usize) -> Result<()> {
    let mut model = coach_core::load_cached::<coach_core::TractBackend>(model_dir, kind).await?;
    let result = model.classify(image).with_context(|| format!("classifying {}", image.display()))?;
    println!("{}", serde_json::to_string_pretty(&result.top(top))?);
    Ok(())
}

#[cfg(not(feature = "tensorflow"))]
async fn classify(_model_dir: &Path, _kind: ArtifactKind, image: &Path, _top: usize) -> Result<()> {
    anyhow::bail!("built without the `tensorflow` feature, cannot classify {}", image.display())
}

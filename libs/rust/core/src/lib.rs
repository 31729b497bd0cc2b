//! Coach client: registry login, versioned model caching and single-image
//! classification.
//!
//! ```no_run
//! # async fn run() -> coach_core::Result<()> {
//! # #[cfg(feature = "tensorflow")] {
//! use coach_core::{RegistryClient, load_config, ArtifactKind, TractBackend};
//! let mut client = RegistryClient::new(load_config()?)?;
//! client.login("abcde-secret").await?;
//! let cache = std::path::Path::new("models");
//! let outcome = client.resolve_and_cache("flowers", cache, true, ArtifactKind::Frozen).await?;
//! let mut model = client.load::<TractBackend>(&outcome.model_dir).await?;
//! let result = model.classify(std::path::Path::new("rose.jpg"))?;
//! println!("{:?}", result.best());
//! # }
//! # Ok(()) }
//! ```

use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub mod backend;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod ranking;
pub mod registry;
pub mod retry;

pub use backend::{InferenceBackend, RawOutput};
#[cfg(feature = "tensorflow")]
pub use backend::TractBackend;
pub use config::{load_config, ClientConfig};
pub use descriptor::{ArtifactKind, ModelDescriptor, Profile};
pub use error::{CoachError, Result};
pub use metrics::{CoachMetrics, COACH_METRICS};
pub use model::{FormatVersion, ModelHandle, DEFAULT_INPUT_TENSOR, DEFAULT_OUTPUT_TENSOR};
pub use normalize::{normalize, ImageSource, ImageTensor, NormalizeParams};
pub use ranking::{rank, Prediction, RankedResult};
pub use registry::{load_cached, CacheOutcome, RegistryClient};
pub use retry::{retry_async, RetryConfig};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs a global `tracing` subscriber once per process. Filtering follows
/// `RUST_LOG` (default `info`); `COACH_JSON_LOG=1` switches to JSON lines.
/// A subscriber installed elsewhere is left in place.
pub fn init_tracing(service: &str) {
    TRACING_INIT.get_or_init(|| {
        let json = std::env::var("COACH_JSON_LOG").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let installed = if json {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .try_init()
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_line_number(true)
                .try_init()
        };
        if installed.is_ok() {
            info!(service, json, "tracing initialized");
        }
    });
}

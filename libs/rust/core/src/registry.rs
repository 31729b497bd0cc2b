//! Registry session, manifest reconciliation and artifact caching.
//!
//! Each model is cached under `<cache_dir>/<model name>/` as a
//! `manifest.json` plus one artifact file per [`ArtifactKind`]. The artifact
//! is always written before the manifest, so a manifest on disk never points
//! at a version whose binary failed to land. When the cached version changes,
//! artifacts of the other kinds are removed: every artifact file present in a
//! model directory belongs to the version its manifest names.

use parking_lot::Mutex;
use reqwest::{header, Url};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::backend::InferenceBackend;
use crate::config::ClientConfig;
use crate::descriptor::{
    manifest_path, parse_manifest, read_manifest, write_manifest, ArtifactKind, ModelDescriptor, Profile,
};
use crate::error::{CoachError, Result};
use crate::metrics::COACH_METRICS;
use crate::model::{FormatVersion, ModelHandle};

pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Length of the key prefix that identifies a profile.
const PROFILE_ID_LEN: usize = 5;

struct Session {
    api_key: String,
    profile: Profile,
}

/// What `resolve_and_cache` did for a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOutcome {
    pub model_dir: PathBuf,
    pub version: u32,
    /// False when the local copy was already current.
    pub downloaded: bool,
}

pub struct RegistryClient {
    http: reqwest::Client,
    config: ClientConfig,
    session: Option<Session>,
    // one async lock per model directory, dropped again once no call holds it
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("profile_endpoint", &self.config.profile_endpoint)
            .field("artifact_endpoint", &self.config.artifact_endpoint)
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

impl RegistryClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("coach-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(CoachError::HttpClient)?;
        Ok(Self { http, config, session: None, locks: Mutex::new(HashMap::new()) })
    }

    pub fn config(&self) -> &ClientConfig { &self.config }

    pub fn is_authenticated(&self) -> bool { self.session.is_some() }

    pub fn profile(&self) -> Option<&Profile> { self.session.as_ref().map(|s| &s.profile) }

    pub fn models(&self) -> &[ModelDescriptor] {
        self.profile().map(|p| p.models.as_slice()).unwrap_or_default()
    }

    /// Authenticates with `api_key` and fetches the caller's profile. Any
    /// failure leaves the client unauthenticated.
    #[instrument(skip_all)]
    pub async fn login(&mut self, api_key: &str) -> Result<&Profile> {
        self.session = None;
        if api_key.is_empty() {
            return Err(CoachError::InvalidCredential { reason: "api key is empty" });
        }
        let id = api_key
            .get(..PROFILE_ID_LEN)
            .ok_or(CoachError::InvalidCredential { reason: "api key is shorter than its 5-character profile prefix" })?;

        let url = format!("{}/{}", self.config.profile_endpoint.trim_end_matches('/'), id);
        let auth_err = |message: String| CoachError::Authentication { url: url.clone(), message };
        let resp = self
            .http
            .get(&url)
            .header(API_KEY_HEADER, api_key)
            .send()
            .await
            .map_err(|e| auth_err(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            warn!(%status, "profile request rejected");
            return Err(auth_err(format!("registry answered {status}")));
        }
        let profile: Profile = resp.json().await.map_err(|e| auth_err(format!("invalid profile: {e}")))?;
        info!(profile = %profile.id, models = profile.models.len(), "authenticated");
        let session = self.session.insert(Session { api_key: api_key.to_string(), profile });
        Ok(&session.profile)
    }

    fn lock_for(&self, model_dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(model_dir.to_path_buf()).or_default().clone()
    }

    fn prune_locks(&self) {
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Makes sure `<cache_dir>/<model_name>` holds the registry's current
    /// version of the model as a `kind` artifact.
    ///
    /// With `skip_on_version_match`, a manifest whose version equals the
    /// registry's (and an artifact of `kind` next to it) short-circuits
    /// without touching the network. Otherwise the artifact is downloaded and
    /// the manifest replaced once the artifact is in place.
    #[instrument(skip(self, cache_dir, kind), fields(kind = %kind))]
    pub async fn resolve_and_cache(
        &self,
        model_name: &str,
        cache_dir: &Path,
        skip_on_version_match: bool,
        kind: ArtifactKind,
    ) -> Result<CacheOutcome> {
        let session = self.session.as_ref().ok_or(CoachError::NotAuthenticated)?;
        let remote = session
            .profile
            .model(model_name)
            .ok_or_else(|| CoachError::UnknownModel { name: model_name.to_string() })?;
        if !remote.is_ready() {
            warn!(status = %remote.status, "caching a model that is not ready");
        }

        let model_dir = model_dir_in(cache_dir, model_name)?;
        let lock = self.lock_for(&model_dir);
        let outcome = {
            let _guard = lock.lock().await;
            self.reconcile(session, remote, model_dir, skip_on_version_match, kind).await
        };
        drop(lock);
        self.prune_locks();
        outcome
    }

    async fn reconcile(
        &self,
        session: &Session,
        remote: &ModelDescriptor,
        model_dir: PathBuf,
        skip_on_version_match: bool,
        kind: ArtifactKind,
    ) -> Result<CacheOutcome> {
        let model_name = remote.name.as_str();
        let artifact_path = model_dir.join(kind.file_name());
        let local = match read_manifest(&model_dir).await {
            Ok(m) => m,
            Err(CoachError::Manifest { path, source }) => {
                warn!(path = %path.display(), error = %source, "unreadable manifest, treating cache as stale");
                None
            }
            Err(e) => return Err(e),
        };
        if let Some(local) = &local {
            let artifact_present = tokio::fs::try_exists(&artifact_path).await.unwrap_or(false);
            if skip_on_version_match && local.version == remote.version && artifact_present {
                debug!(version = local.version, "version match, skipping download");
                COACH_METRICS.cache_hits_total.add(1, &[]);
                return Ok(CacheOutcome { model_dir, version: local.version, downloaded: false });
            }
            debug!(local = local.version, remote = remote.version, artifact_present, "refreshing cached model");
        }

        tokio::fs::create_dir_all(&model_dir).await.map_err(|e| CoachError::io(&model_dir, e))?;
        let url = self.artifact_url(&session.profile.bucket, remote, kind)?;
        let bytes = match self.download(&session.api_key, model_name, &url, &artifact_path).await {
            Ok(n) => n,
            Err(e) => {
                COACH_METRICS.download_failures_total.add(1, &[]);
                return Err(e);
            }
        };
        if local.as_ref().map(|l| l.version) != Some(remote.version) {
            remove_other_kinds(&model_dir, kind).await?;
        }
        write_manifest(&model_dir, remote).await?;

        COACH_METRICS.downloads_total.add(1, &[]);
        COACH_METRICS.downloaded_bytes_total.add(bytes, &[]);
        info!(version = remote.version, bytes, path = %artifact_path.display(), "model cached");
        Ok(CacheOutcome { model_dir, version: remote.version, downloaded: true })
    }

    fn artifact_url(&self, bucket: &str, model: &ModelDescriptor, kind: ArtifactKind) -> Result<Url> {
        let base = format!("{}/{}/model-bin", self.config.artifact_endpoint.trim_end_matches('/'), bucket);
        let mut url = Url::parse(&base).map_err(|e| CoachError::download(&model.name, &base, e))?;
        url.query_pairs_mut()
            .append_pair("object", &format!("trained/{}/{}/model/{}", model.name, model.version, kind.file_name()));
        Ok(url)
    }

    /// Streams the artifact into `<dest>.partial`, checks the length against
    /// the response header, then renames it over `dest`.
    async fn download(&self, api_key: &str, model: &str, url: &Url, dest: &Path) -> Result<u64> {
        let fail = |message: String| CoachError::download(model, url.as_str(), message);
        let mut resp = self
            .http
            .get(url.clone())
            .header(API_KEY_HEADER, api_key)
            .header(header::ACCEPT, "application/octet-stream")
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(fail(format!("registry answered {status}")));
        }

        let expected = resp.content_length();
        let partial = partial_path(dest);
        let written = match write_body(&mut resp, &partial).await {
            Ok(n) => n,
            Err(message) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(fail(message));
            }
        };
        if let Some(expected) = expected.filter(|&n| n != written) {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(fail(format!("expected {expected} bytes, received {written}")));
        }
        tokio::fs::rename(&partial, dest)
            .await
            .map_err(|e| fail(format!("cannot move artifact to {}: {e}", dest.display())))?;
        Ok(written)
    }

    /// Builds a [`ModelHandle`] from the frozen graph cached in `model_dir`.
    /// Needs no session; same as [`load_cached`] with [`ArtifactKind::Frozen`].
    pub async fn load<B: InferenceBackend + 'static>(&self, model_dir: &Path) -> Result<ModelHandle<B>> {
        load_cached(model_dir, ArtifactKind::Frozen).await
    }

    /// Session-free, forwards to [`load_cached`].
    pub async fn load_kind<B: InferenceBackend + 'static>(&self, model_dir: &Path, kind: ArtifactKind) -> Result<ModelHandle<B>> {
        load_cached(model_dir, kind).await
    }

    /// `resolve_and_cache` (skipping on version match, frozen graph) followed
    /// by `load`.
    pub async fn resolve_and_cache_and_load<B: InferenceBackend + 'static>(&self, model_name: &str, cache_dir: &Path) -> Result<ModelHandle<B>> {
        let outcome = self.resolve_and_cache(model_name, cache_dir, true, ArtifactKind::Frozen).await?;
        self.load(&outcome.model_dir).await
    }
}

/// `<cache_dir>/<model_name>`, refusing names that are not a single plain
/// path component.
fn model_dir_in(cache_dir: &Path, model_name: &str) -> Result<PathBuf> {
    let mut components = Path::new(model_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(cache_dir.join(model_name)),
        _ => Err(CoachError::InvalidInput(format!("model name '{model_name}' is not a plain directory name"))),
    }
}

/// Removes the artifacts of every kind except `keep`.
async fn remove_other_kinds(model_dir: &Path, keep: ArtifactKind) -> Result<()> {
    for kind in ArtifactKind::ALL.into_iter().filter(|k| *k != keep) {
        let path = model_dir.join(kind.file_name());
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed artifact of a superseded version"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CoachError::io(path, e)),
        }
    }
    Ok(())
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}

async fn write_body(resp: &mut reqwest::Response, path: &Path) -> std::result::Result<u64, String> {
    let io_err = |e: std::io::Error| format!("cannot write {}: {e}", path.display());
    let mut file = tokio::fs::File::create(path).await.map_err(io_err)?;
    let mut written = 0u64;
    while let Some(chunk) = resp.chunk().await.map_err(|e| e.to_string())? {
        file.write_all(&chunk).await.map_err(io_err)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    Ok(written)
}

/// Loads a cached model without a registry session.
#[instrument]
pub async fn load_cached<B: InferenceBackend + 'static>(model_dir: &Path, kind: ArtifactKind) -> Result<ModelHandle<B>> {
    if !kind.is_graph_def() {
        return Err(CoachError::InvalidInput(format!("{kind} artifacts cannot be imported as a graph")));
    }
    let manifest = manifest_path(model_dir);
    let manifest_bytes = read_artifact(&manifest).await?;
    let descriptor = parse_manifest(&manifest, &manifest_bytes)?;
    // gate before paying for the graph import
    FormatVersion::from_declared(descriptor.format_version)?;

    let graph_path = model_dir.join(kind.file_name());
    let graph_def = read_artifact(&graph_path).await?;
    let graph = tokio::task::spawn_blocking(move || B::import(&graph_def))
        .await
        .map_err(|e| CoachError::Backend(Box::new(e)))?
        .map_err(CoachError::Backend)?;
    debug!(model = %descriptor.name, version = descriptor.version, "graph imported");
    ModelHandle::construct(graph, descriptor.labels, &descriptor.base_module, descriptor.format_version)
}

async fn read_artifact(path: &Path) -> Result<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CoachError::ArtifactNotFound { path: path.to_path_buf() }),
        Err(e) => Err(CoachError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(partial_path(Path::new("/c/flowers/frozen.pb")), PathBuf::from("/c/flowers/frozen.pb.partial"));
    }

    #[test]
    fn artifact_url_is_version_scoped() {
        let cfg = ClientConfig { artifact_endpoint: "http://registry.local/prod/".into(), ..Default::default() };
        let client = RegistryClient::new(cfg).unwrap();
        let model = ModelDescriptor {
            name: "flowers".into(),
            status: "Ready".into(),
            version: 7,
            base_module: "m_224".into(),
            labels: vec![],
            format_version: 2.0,
        };
        let url = client.artifact_url("bkt", &model, ArtifactKind::Unity).unwrap();
        assert_eq!(url.path(), "/prod/bkt/model-bin");
        let object: Vec<_> = url.query_pairs().filter(|(k, _)| *k == "object").map(|(_, v)| v.into_owned()).collect();
        assert_eq!(object, ["trained/flowers/7/model/unity.bytes"]);
    }

    fn with_profile(names: &[&str]) -> RegistryClient {
        let mut client = RegistryClient::new(ClientConfig::default()).unwrap();
        let models = names
            .iter()
            .map(|name| ModelDescriptor {
                name: name.to_string(),
                status: "Ready".into(),
                version: 1,
                base_module: "m_224".into(),
                labels: vec![],
                format_version: 2.0,
            })
            .collect();
        let profile = Profile { id: "abcde".into(), bucket: "bkt".into(), models };
        client.session = Some(Session { api_key: "abcde-key".into(), profile });
        client
    }

    #[test]
    fn model_dir_must_be_a_single_component() {
        let root = Path::new("/cache");
        assert_eq!(model_dir_in(root, "flowers").unwrap(), PathBuf::from("/cache/flowers"));
        for bad in ["", ".", "..", "../escape", "/etc", "a/b"] {
            assert!(matches!(model_dir_in(root, bad), Err(CoachError::InvalidInput(_))), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn registry_names_cannot_escape_cache_dir() {
        let client = with_profile(&["../escape", "/abs"]);
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        for name in ["../escape", "/abs"] {
            let err = client.resolve_and_cache(name, &cache, true, ArtifactKind::Frozen).await.unwrap_err();
            assert!(matches!(err, CoachError::InvalidInput(_)), "{name}: {err}");
        }
        assert!(!dir.path().join("escape").exists());
        assert!(client.locks.lock().is_empty());
    }

    #[test]
    fn idle_locks_are_pruned() {
        let client = RegistryClient::new(ClientConfig::default()).unwrap();
        let held = client.lock_for(Path::new("/c/a"));
        let _ = client.lock_for(Path::new("/c/b"));
        client.prune_locks();
        assert_eq!(client.locks.lock().len(), 1);
        drop(held);
        client.prune_locks();
        assert!(client.locks.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_cache_call_releases_its_lock() {
        let mut client = with_profile(&["flowers"]);
        client.config.artifact_endpoint = "not a url".into();
        let dir = tempfile::tempdir().unwrap();
        let err = client.resolve_and_cache("flowers", dir.path(), true, ArtifactKind::Frozen).await.unwrap_err();
        assert!(matches!(err, CoachError::Download { .. }), "{err}");
        assert!(client.locks.lock().is_empty());
    }

    #[tokio::test]
    async fn unauthenticated_client_cannot_cache() {
        let client = RegistryClient::new(ClientConfig::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = client.resolve_and_cache("flowers", dir.path(), true, ArtifactKind::Frozen).await.unwrap_err();
        assert!(matches!(err, CoachError::NotAuthenticated));
        assert!(client.models().is_empty());
    }

    #[tokio::test]
    async fn short_or_empty_keys_are_rejected_locally() {
        let mut client = RegistryClient::new(ClientConfig::default()).unwrap();
        for key in ["", "abc"] {
            let err = client.login(key).await.unwrap_err();
            assert!(matches!(err, CoachError::InvalidCredential { .. }), "{key:?}");
        }
        assert!(!client.is_authenticated());
    }
}

//! Container registry access
//!
//! Speaks the OCI distribution API (`/v2/...`) directly: manifests, blobs
//! and tag listing, with basic credentials from a docker config and bearer
//! token exchange on `401` challenges.

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const MANIFEST_MEDIA_TYPES: &str = "application/vnd.oci.image.manifest.v1+json, \
application/vnd.oci.image.index.v1+json, \
application/vnd.docker.distribution.manifest.v2+json, \
application/vnd.docker.distribution.manifest.list.v2+json";

const DIGEST_HEADER: &str = "Docker-Content-Digest";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("invalid image reference {0:?}")]
    InvalidReference(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid registry credentials: {0}")]
    Credentials(String),
}

/// A pulled image: manifest digest, config labels and raw layer blobs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReleaseImage {
    pub digest: String,
    pub labels: BTreeMap<String, String>,
    /// Zero-sized layers are kept as empty blobs and never fetched
    pub layers: Vec<Vec<u8>>,
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Pull manifest, config and layers of `tag`
    async fn image(&self, tag: &str) -> Result<ReleaseImage, RegistryError>;

    /// Manifest digest of `tag` without pulling layers
    async fn digest(&self, tag: &str) -> Result<String, RegistryError>;

    async fn list_tags(&self) -> Result<Vec<String>, RegistryError>;
}

/// Builds clients per repository with the current registry settings
pub trait RegistryFactory: Send + Sync {
    fn client(
        &self,
        repository: &str,
        settings: &RegistrySettings,
    ) -> Result<Arc<dyn RegistryClient>, RegistryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    #[default]
    Https,
    Http,
}

impl Scheme {
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("http") {
            Scheme::Http
        } else {
            Scheme::Https
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Scheme::Https => "https",
            Scheme::Http => "http",
        }
    }
}

/// Connection settings shared by every repository of one registry
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrySettings {
    /// `<host>/<path>` prefix of platform images
    pub base: String,
    /// `.dockerconfigjson` content
    pub docker_config: Option<String>,
    /// PEM bundle trusted in addition to system roots
    pub ca: Option<String>,
    pub scheme: Scheme,
    pub user_agent: String,
    pub timeout: Duration,
}

impl RegistrySettings {
    pub fn release_channel_repository(&self) -> String {
        format!("{}/release-channel", self.base.trim_end_matches('/'))
    }

    pub fn image_for_tag(&self, tag: &str) -> String {
        format!("{}:{}", self.base.trim_end_matches('/'), tag)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpRegistryFactory;

impl RegistryFactory for HttpRegistryFactory {
    fn client(
        &self,
        repository: &str,
        settings: &RegistrySettings,
    ) -> Result<Arc<dyn RegistryClient>, RegistryError> {
        Ok(Arc::new(HttpRegistryClient::new(repository, settings)?))
    }
}

pub struct HttpRegistryClient {
    http: reqwest::Client,
    base_url: String,
    repository: String,
    basic: Option<(String, String)>,
    token: Mutex<Option<String>>,
}

impl HttpRegistryClient {
    /// `repository` is a full reference without tag, e.g.
    /// `registry.deckhouse.io/deckhouse/ce/release-channel`
    pub fn new(repository: &str, settings: &RegistrySettings) -> Result<Self, RegistryError> {
        let (host, path) = repository
            .split_once('/')
            .filter(|(host, path)| !host.is_empty() && !path.is_empty())
            .ok_or_else(|| RegistryError::InvalidReference(repository.to_string()))?;

        let basic = match &settings.docker_config {
            Some(config) => credentials_for_host(config, host)?,
            None => None,
        };

        let mut builder = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(settings.user_agent.clone());
        if let Some(ca) = &settings.ca {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(ca.as_bytes())?);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: format!("{}://{}", settings.scheme.as_str(), host),
            repository: path.trim_end_matches('/').to_string(),
            basic,
            token: Mutex::new(None),
        })
    }

    fn bearer(&self) -> Option<String> {
        self.token.lock().ok().and_then(|t| t.clone())
    }

    fn request(&self, method: Method, url: &str, accept: Option<&str>) -> reqwest::RequestBuilder {
        let mut request = self.http.request(method, url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        match (self.bearer(), &self.basic) {
            (Some(token), _) => request.bearer_auth(token),
            (None, Some((username, password))) => request.basic_auth(username, Some(password)),
            (None, None) => request,
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, RegistryError> {
        let url = format!("{}/v2/{}/{}", self.base_url, self.repository, path);
        let response = self.request(method.clone(), &url, accept).send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_bearer_challenge);
            if let Some(challenge) = challenge {
                self.authenticate(&challenge).await?;
                let retried = self.request(method, &url, accept).send().await?;
                return check_status(retried, &url);
            }
        }

        check_status(response, &url)
    }

    async fn authenticate(&self, challenge: &BTreeMap<String, String>) -> Result<(), RegistryError> {
        let realm = challenge
            .get("realm")
            .ok_or_else(|| RegistryError::Credentials("bearer challenge without realm".into()))?;

        let query: Vec<(&str, &str)> = ["service", "scope"]
            .iter()
            .filter_map(|key| challenge.get(*key).map(|v| (*key, v.as_str())))
            .collect();

        let mut request = self.http.get(realm.as_str()).query(&query);
        if let Some((username, password)) = &self.basic {
            request = request.basic_auth(username, Some(password));
        }
        let response = check_status(request.send().await?, realm)?;
        let token: TokenResponse = response.json().await?;
        let token = token
            .token
            .or(token.access_token)
            .ok_or_else(|| RegistryError::Credentials("token endpoint returned no token".into()))?;

        debug!(realm = %realm, "Obtained registry bearer token");
        if let Ok(mut slot) = self.token.lock() {
            *slot = Some(token);
        }
        Ok(())
    }

    async fn manifest(&self, reference: &str) -> Result<(String, Manifest), RegistryError> {
        let response = self
            .send(Method::GET, &format!("manifests/{reference}"), Some(MANIFEST_MEDIA_TYPES))
            .await?;
        let header_digest = digest_header(&response);
        let body = response.bytes().await?;
        let digest = header_digest.unwrap_or_else(|| sha256_digest(&body));
        let manifest = serde_json::from_slice(&body)
            .map_err(|e| RegistryError::InvalidManifest(e.to_string()))?;
        Ok((digest, manifest))
    }

    async fn blob(&self, digest: &str) -> Result<Vec<u8>, RegistryError> {
        let response = self.send(Method::GET, &format!("blobs/{digest}"), None).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn image(&self, tag: &str) -> Result<ReleaseImage, RegistryError> {
        let (digest, mut manifest) = self.manifest(tag).await?;

        // Multi-arch index: follow the linux/amd64 entry, else the first one
        if manifest.config.is_none() && !manifest.manifests.is_empty() {
            let entry = manifest
                .manifests
                .iter()
                .find(|m| {
                    m.platform
                        .as_ref()
                        .is_some_and(|p| p.os == "linux" && p.architecture == "amd64")
                })
                .or_else(|| manifest.manifests.first())
                .map(|m| m.digest.clone())
                .ok_or_else(|| RegistryError::InvalidManifest("empty index".into()))?;
            manifest = self.manifest(&entry).await?.1;
        }

        let config = manifest
            .config
            .as_ref()
            .ok_or_else(|| RegistryError::InvalidManifest("manifest has no config".into()))?;
        let config_blob = self.blob(&config.digest).await?;
        let image_config: ImageConfig = serde_json::from_slice(&config_blob)
            .map_err(|e| RegistryError::InvalidManifest(format!("image config: {e}")))?;

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            if layer.size == 0 {
                layers.push(Vec::new());
                continue;
            }
            layers.push(self.blob(&layer.digest).await?);
        }

        Ok(ReleaseImage {
            digest,
            labels: image_config
                .config
                .and_then(|c| c.labels)
                .unwrap_or_default(),
            layers,
        })
    }

    async fn digest(&self, tag: &str) -> Result<String, RegistryError> {
        let response = self
            .send(Method::HEAD, &format!("manifests/{tag}"), Some(MANIFEST_MEDIA_TYPES))
            .await?;
        match digest_header(&response) {
            Some(digest) => Ok(digest),
            None => Ok(self.manifest(tag).await?.0),
        }
    }

    async fn list_tags(&self) -> Result<Vec<String>, RegistryError> {
        let response = self.send(Method::GET, "tags/list", None).await?;
        let tags: TagList = response.json().await?;
        Ok(tags.tags.unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    /// Present on image indexes only
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    os: String,
}

#[derive(Debug, Deserialize)]
struct ImageConfig {
    #[serde(default)]
    config: Option<ContainerConfig>,
}

#[derive(Debug, Deserialize)]
struct ContainerConfig {
    #[serde(default, rename = "Labels")]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

#[derive(Debug, Deserialize)]
struct DockerAuth {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

fn check_status(response: reqwest::Response, url: &str) -> Result<reqwest::Response, RegistryError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(RegistryError::Status {
            status: response.status().as_u16(),
            url: url.to_string(),
        })
    }
}

fn digest_header(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(DIGEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub fn sha256_digest(body: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(body))
}

/// Username and password for `host` from a `.dockerconfigjson` document
fn credentials_for_host(
    config: &str,
    host: &str,
) -> Result<Option<(String, String)>, RegistryError> {
    let config: DockerConfig =
        serde_json::from_str(config).map_err(|e| RegistryError::Credentials(e.to_string()))?;

    let entry = config.auths.iter().find(|(key, _)| {
        let key = key
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        key == host
    });
    let Some((_, auth)) = entry else {
        return Ok(None);
    };

    if let (Some(username), Some(password)) = (&auth.username, &auth.password) {
        return Ok(Some((username.clone(), password.clone())));
    }

    match &auth.auth {
        Some(encoded) if !encoded.is_empty() => {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| RegistryError::Credentials(e.to_string()))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|e| RegistryError::Credentials(e.to_string()))?;
            let (username, password) = decoded
                .split_once(':')
                .ok_or_else(|| RegistryError::Credentials("auth is not user:password".into()))?;
            Ok(Some((username.to_string(), password.to_string())))
        }
        _ => Ok(None),
    }
}

/// Parameters of a `Bearer realm="...",service="...",scope="..."` challenge
fn parse_bearer_challenge(header: &str) -> Option<BTreeMap<String, String>> {
    let (scheme, mut rest) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut params = BTreeMap::new();
    loop {
        rest = rest.trim_start().trim_start_matches(',').trim_start();
        if rest.is_empty() {
            break;
        }
        let (key, after) = rest.split_once('=')?;
        let (value, remainder) = match after.strip_prefix('"') {
            Some(quoted) => {
                let end = quoted.find('"')?;
                (&quoted[..end], &quoted[end + 1..])
            }
            None => match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            },
        };
        params.insert(key.trim().to_string(), value.to_string());
        rest = remainder;
    }
    Some(params)
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;

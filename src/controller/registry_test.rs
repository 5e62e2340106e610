#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity
#![allow(clippy::expect_used)] // Tests can use expect for better error messages

use super::*;
use crate::controller::memory::tar_layer;
use crate::controller::metadata::ReleaseMetadata;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode as HttpStatus};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

const REPOSITORY: &str = "deckhouse/release-channel";
const TOKEN: &str = "test-token";

struct FakeRegistry {
    port: u16,
    require_token: bool,
    manifest: Vec<u8>,
    manifest_digest: String,
    blobs: HashMap<String, Vec<u8>>,
}

impl FakeRegistry {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        if !self.require_token {
            return true;
        }
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {TOKEN}"))
    }

    fn challenge(&self) -> Response {
        let value = format!(
            "Bearer realm=\"http://127.0.0.1:{}/token\",service=\"registry\",scope=\"repository:{REPOSITORY}:pull,push\"",
            self.port
        );
        (HttpStatus::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, value)]).into_response()
    }
}

async fn manifest_handler(
    State(state): State<Arc<FakeRegistry>>,
    Path(reference): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(&headers) {
        return state.challenge();
    }
    if reference != "stable" {
        return HttpStatus::NOT_FOUND.into_response();
    }
    (
        HttpStatus::OK,
        [("Docker-Content-Digest", state.manifest_digest.clone())],
        state.manifest.clone(),
    )
        .into_response()
}

async fn blob_handler(
    State(state): State<Arc<FakeRegistry>>,
    Path(digest): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(&headers) {
        return state.challenge();
    }
    match state.blobs.get(&digest) {
        Some(blob) => (HttpStatus::OK, blob.clone()).into_response(),
        None => HttpStatus::NOT_FOUND.into_response(),
    }
}

async fn tags_handler(State(state): State<Arc<FakeRegistry>>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return state.challenge();
    }
    axum::Json(serde_json::json!({
        "name": REPOSITORY,
        "tags": ["stable", "v1.30.0", "v1.30.5"]
    }))
    .into_response()
}

async fn token_handler(headers: HeaderMap) -> Response {
    let expected = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode("user:secret")
    );
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !authorized {
        return HttpStatus::UNAUTHORIZED.into_response();
    }
    axum::Json(serde_json::json!({ "token": TOKEN })).into_response()
}

/// Start a registry serving one `stable` image; returns its port
async fn start_registry(require_token: bool) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let layer = tar_layer(&[(
        "version.json",
        br#"{"version": "v1.30.5", "requirements": {"k8s": "1.19"}}"#.as_slice(),
    )])
    .unwrap();
    let layer_digest = sha256_digest(&layer);
    let config = serde_json::to_vec(&serde_json::json!({
        "config": {"Labels": {"cooldown": "2026-02-01 10:30"}}
    }))
    .unwrap();
    let config_digest = sha256_digest(&config);
    let manifest = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {"digest": config_digest, "size": config.len()},
        "layers": [
            {"digest": "sha256:empty", "size": 0},
            {"digest": layer_digest, "size": layer.len()}
        ]
    }))
    .unwrap();

    let state = Arc::new(FakeRegistry {
        port,
        require_token,
        manifest_digest: "sha256:feedface".to_string(),
        manifest,
        blobs: HashMap::from([(config_digest, config), (layer_digest, layer)]),
    });

    let app = Router::new()
        .route(
            &format!("/v2/{REPOSITORY}/manifests/{{reference}}"),
            get(manifest_handler),
        )
        .route(&format!("/v2/{REPOSITORY}/blobs/{{digest}}"), get(blob_handler))
        .route(&format!("/v2/{REPOSITORY}/tags/list"), get(tags_handler))
        .route("/token", get(token_handler))
        .with_state(state);

    tokio::spawn(async move { axum::serve(listener, app).await });
    port
}

fn settings(port: u16) -> RegistrySettings {
    let auth = base64::engine::general_purpose::STANDARD.encode("user:secret");
    let mut auths = serde_json::Map::new();
    auths.insert(format!("127.0.0.1:{port}"), serde_json::json!({ "auth": auth }));
    RegistrySettings {
        base: format!("127.0.0.1:{port}/deckhouse"),
        docker_config: Some(serde_json::json!({ "auths": auths }).to_string()),
        ca: None,
        scheme: Scheme::Http,
        user_agent: "test-cluster-uuid".to_string(),
        timeout: Duration::from_secs(5),
    }
}

fn client(port: u16) -> HttpRegistryClient {
    let settings = settings(port);
    HttpRegistryClient::new(&settings.release_channel_repository(), &settings).unwrap()
}

#[tokio::test]
async fn test_image_pulls_labels_and_layers() {
    // ARRANGE
    let port = start_registry(false).await;

    // ACT
    let image = client(port).image("stable").await.unwrap();

    // ASSERT
    assert_eq!(image.digest, "sha256:feedface");
    assert_eq!(image.labels.get("cooldown").unwrap(), "2026-02-01 10:30");
    assert_eq!(image.layers.len(), 2);
    assert!(image.layers[0].is_empty(), "zero-sized layer is not fetched");

    let metadata = ReleaseMetadata::decode(&image.layers, &image.labels).unwrap();
    assert_eq!(metadata.version, "v1.30.5");
    assert!(metadata.cooldown.is_some());
}

#[tokio::test]
async fn test_digest_uses_manifest_head() {
    let port = start_registry(false).await;

    let digest = client(port).digest("stable").await.unwrap();

    assert_eq!(digest, "sha256:feedface");
}

#[tokio::test]
async fn test_list_tags() {
    let port = start_registry(false).await;

    let tags = client(port).list_tags().await.unwrap();

    assert_eq!(tags, vec!["stable", "v1.30.0", "v1.30.5"]);
}

#[tokio::test]
async fn test_bearer_token_exchange_on_challenge() {
    // ARRANGE: registry answers 401 with a bearer challenge until a token is presented
    let port = start_registry(true).await;
    let client = client(port);

    // ACT
    let image = client.image("stable").await.unwrap();
    let digest = client.digest("stable").await.unwrap();

    // ASSERT
    assert_eq!(image.digest, "sha256:feedface");
    assert_eq!(digest, "sha256:feedface");
}

#[tokio::test]
async fn test_unknown_tag_is_status_error() {
    let port = start_registry(false).await;

    let err = client(port).image("missing").await.unwrap_err();

    assert!(matches!(err, RegistryError::Status { status: 404, .. }));
}

#[test]
fn test_reference_without_repository_is_rejected() {
    let err = HttpRegistryClient::new("registry.example.com", &settings(5000)).err();
    assert!(matches!(err, Some(RegistryError::InvalidReference(_))));
}

#[test]
fn test_credentials_from_docker_config() {
    let auth = base64::engine::general_purpose::STANDARD.encode("robot:pa:ss");
    let config = serde_json::json!({
        "auths": {
            "https://registry.example.com/": {"auth": auth},
            "other.example.com": {"username": "u", "password": "p"}
        }
    })
    .to_string();

    assert_eq!(
        credentials_for_host(&config, "registry.example.com").unwrap(),
        Some(("robot".to_string(), "pa:ss".to_string()))
    );
    assert_eq!(
        credentials_for_host(&config, "other.example.com").unwrap(),
        Some(("u".to_string(), "p".to_string()))
    );
    assert_eq!(credentials_for_host(&config, "unknown.example.com").unwrap(), None);
    assert!(credentials_for_host("not json", "registry.example.com").is_err());
}

#[test]
fn test_parse_bearer_challenge_keeps_commas_in_quoted_values() {
    let params = parse_bearer_challenge(
        r#"Bearer realm="https://auth.example.com/token",service="registry",scope="repository:a/b:pull,push""#,
    )
    .unwrap();

    assert_eq!(params.get("realm").unwrap(), "https://auth.example.com/token");
    assert_eq!(params.get("service").unwrap(), "registry");
    assert_eq!(params.get("scope").unwrap(), "repository:a/b:pull,push");
    assert!(parse_bearer_challenge("Basic realm=\"x\"").is_none());
}

#[test]
fn test_release_channel_repository_and_image() {
    let settings = settings(5000);
    assert_eq!(
        settings.release_channel_repository(),
        "127.0.0.1:5000/deckhouse/release-channel"
    );
    assert_eq!(settings.image_for_tag("v1.30.5"), "127.0.0.1:5000/deckhouse:v1.30.5");
}

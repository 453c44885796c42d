use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::engine::AnalysisChunk;

/// Variants the site accepts in a registration
const RECOGNIZED_VARIANTS: [&str; 8] = [
    "chess",
    "antichess",
    "atomic",
    "crazyhouse",
    "horde",
    "kingofthehill",
    "racingkings",
    "3check",
];

/// Work acquisition long-polls; cap the request so a network stall doesn't
/// stall the whole provider.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(12);

/// Errors produced by the site and broker APIs
#[derive(Error, Debug)]
pub enum ApiError {
    /// Request failed outright or the server answered with an error status
    #[error("http failure: {0}")]
    HttpFailure(#[source] reqwest::Error),

    /// The peer closed the connection while an upload was streaming
    #[error("peer closed connection")]
    PeerClosed(#[source] reqwest::Error),
}

/// Engine record registered with the site
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub name: String,
    pub max_threads: u32,
    pub max_hash: u32,
    pub variants: Vec<String>,
    pub provider_secret: String,
}

#[derive(Debug, Deserialize)]
struct EngineRecord {
    id: String,
    name: String,
}

/// One analysis request handed out by the broker
#[derive(Debug, Deserialize)]
pub struct Job {
    pub id: String,
    pub work: Work,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Work {
    pub session_id: String,
    pub threads: u32,
    pub hash: u32,
    pub multi_pv: u32,
    /// Older broker deployments omit this; plain chess is implied
    #[serde(default = "default_variant")]
    pub variant: String,
    pub initial_fen: String,
    #[serde(default)]
    pub moves: Vec<String>,
    pub movetime: Option<u64>,
    pub depth: Option<u32>,
    pub nodes: Option<u64>,
}

fn default_variant() -> String {
    "chess".to_string()
}

/// The provider secret to register and pick up work with: the configured
/// value, or a fresh URL-safe token with 32 bytes of entropy.
pub fn provider_secret(fixed: Option<&str>) -> String {
    match fixed {
        Some(secret) if !secret.is_empty() => secret.to_string(),
        _ => URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>()),
    }
}

/// Variants to register: the engine's advertised set (plain chess if it
/// advertised none), restricted to what the site recognizes.
pub fn registration_variants(supported: &[String]) -> Vec<String> {
    let advertised: Vec<&str> = if supported.is_empty() {
        vec!["chess"]
    } else {
        supported.iter().map(String::as_str).collect()
    };
    advertised
        .into_iter()
        .filter(|variant| RECOGNIZED_VARIANTS.contains(variant))
        .map(str::to_string)
        .collect()
}

/// Thin client for the site and broker HTTP APIs
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    lichess: String,
    broker: String,
    token: String,
}

impl ApiClient {
    pub fn new(lichess: &str, broker: &str, token: &str) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(ApiError::HttpFailure)?;
        Ok(ApiClient {
            http,
            lichess: lichess.trim_end_matches('/').to_string(),
            broker: broker.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Upsert the engine registration on the site, keyed by name
    pub async fn register_engine(&self, registration: &Registration) -> Result<(), ApiError> {
        let url = format!("{}/api/external-engine", self.lichess);
        let engines: Vec<EngineRecord> = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(ApiError::HttpFailure)?
            .json()
            .await
            .map_err(ApiError::HttpFailure)?;

        match engines.iter().find(|e| e.name == registration.name) {
            Some(existing) => {
                log::info!("Updating engine {}", existing.id);
                self.http
                    .put(format!("{}/{}", url, existing.id))
                    .bearer_auth(&self.token)
                    .json(registration)
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status)
                    .map_err(ApiError::HttpFailure)?;
            }
            None => {
                log::info!("Registering new engine");
                self.http
                    .post(&url)
                    .bearer_auth(&self.token)
                    .json(registration)
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status)
                    .map_err(ApiError::HttpFailure)?;
            }
        }
        Ok(())
    }

    /// Long-poll the broker for the next job. `Ok(None)` means the poll
    /// came back without work.
    pub async fn acquire(&self, secret: &str) -> Result<Option<Job>, ApiError> {
        let res = self
            .http
            .post(format!("{}/api/external-engine/work", self.broker))
            .bearer_auth(&self.token)
            .timeout(ACQUIRE_TIMEOUT)
            .json(&serde_json::json!({ "providerSecret": secret }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(ApiError::HttpFailure)?;
        if res.status() != reqwest::StatusCode::OK {
            return Ok(None);
        }
        res.json().await.map(Some).map_err(ApiError::HttpFailure)
    }

    /// Stream analysis output to the broker as a chunked request body. The
    /// body is pulled from `chunks` as the engine produces it, so a peer
    /// hangup surfaces while the analysis is still running.
    pub async fn upload(
        &self,
        job_id: &str,
        chunks: mpsc::Receiver<AnalysisChunk>,
    ) -> Result<(), ApiError> {
        let body = reqwest::Body::wrap_stream(futures_util::stream::unfold(
            chunks,
            |mut rx| async move { rx.recv().await.map(|chunk| (chunk, rx)) },
        ));
        let res = self
            .http
            .post(format!(
                "{}/api/external-engine/work/{}",
                self.broker, job_id
            ))
            .bearer_auth(&self.token)
            .body(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        match res {
            Ok(_) => Ok(()),
            Err(err) if err.status().is_some() || err.is_connect() || err.is_timeout() => {
                Err(ApiError::HttpFailure(err))
            }
            Err(err) => Err(ApiError::PeerClosed(err)),
        }
    }
}

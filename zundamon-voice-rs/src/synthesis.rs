//! VOICEVOX synthesis client.
//!
//! Two-step HTTP contract:
//! 1. `POST /audio_query?text=..&speaker=..` → JSON query
//! 2. `POST /synthesis?speaker=..` with that query → WAV bytes
//!
//! Each call is preceded by a `GET /version` wake-up probe whose result is
//! ignored. Transport failures are retried a bounded number of times.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::VoicevoxConfig;
use crate::settings::Settings;
use crate::{Error, Result};

/// Raw engine calls. One implementation talks HTTP, tests swap in fakes.
#[async_trait]
pub trait SynthesisTransport: Send + Sync {
    /// Wake the engine. Failures are ignored by the caller.
    async fn probe(&self);
    async fn audio_query(&self, text: &str, speaker: u32) -> Result<Value>;
    async fn synthesis(&self, query: &Value, speaker: u32) -> Result<Vec<u8>>;
}

/// Anything that turns text into encoded audio.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

pub struct VoicevoxHttp {
    host: String,
    client: Client,
    probe_timeout: Duration,
}

impl VoicevoxHttp {
    pub fn new(config: &VoicevoxConfig) -> Result<Self> {
        let host = config.host.trim_end_matches('/').to_string();
        reqwest::Url::parse(&host)
            .map_err(|e| Error::LinkInvalidated(format!("invalid engine url {host}: {e}")))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::LinkInvalidated(e.to_string()))?;

        Ok(Self {
            host,
            client,
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
        })
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status.is_client_error() && status != StatusCode::REQUEST_TIMEOUT {
            Err(Error::Rejected {
                status: status.as_u16(),
                body,
            })
        } else {
            Err(Error::Transport(format!("engine returned {status}: {body}")))
        }
    }
}

#[async_trait]
impl SynthesisTransport for VoicevoxHttp {
    async fn probe(&self) {
        let url = format!("{}/version", self.host);
        if let Err(e) = self.client.get(&url).timeout(self.probe_timeout).send().await {
            debug!("Engine probe failed: {e}");
        }
    }

    async fn audio_query(&self, text: &str, speaker: u32) -> Result<Value> {
        let url = format!("{}/audio_query", self.host);
        let speaker = speaker.to_string();
        let resp = self
            .client
            .post(&url)
            .query(&[("text", text), ("speaker", speaker.as_str())])
            .send()
            .await?;
        Ok(Self::check(resp).await?.json::<Value>().await?)
    }

    async fn synthesis(&self, query: &Value, speaker: u32) -> Result<Vec<u8>> {
        let url = format!("{}/synthesis", self.host);
        let resp = self
            .client
            .post(&url)
            .query(&[("speaker", speaker)])
            .json(query)
            .send()
            .await?;
        Ok(Self::check(resp).await?.bytes().await?.to_vec())
    }
}

/// Retrying front end over a transport. The speaker id is read from the
/// live settings on every call.
pub struct SynthesisClient {
    transport: Arc<dyn SynthesisTransport>,
    settings: watch::Receiver<Settings>,
    max_retries: u32,
}

impl SynthesisClient {
    pub fn new(
        transport: Arc<dyn SynthesisTransport>,
        settings: watch::Receiver<Settings>,
        max_retries: u32,
    ) -> Self {
        Self {
            transport,
            settings,
            max_retries,
        }
    }

    async fn attempt(&self, text: &str, speaker: u32) -> Result<Vec<u8>> {
        let query = self.transport.audio_query(text, speaker).await?;
        self.transport.synthesis(&query, speaker).await
    }
}

#[async_trait]
impl Synthesizer for SynthesisClient {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let speaker = self.settings.borrow().speaker_id;
        let attempts = self.max_retries + 1;
        let t_start = Instant::now();

        self.transport.probe().await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(text, speaker).await {
                Ok(audio) => {
                    info!(
                        "Synthesized {} chars in {:.0}ms ({} bytes, attempt {attempt})",
                        text.chars().count(),
                        t_start.elapsed().as_secs_f64() * 1000.0,
                        audio.len()
                    );
                    return Ok(audio);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!("Synthesis attempt {attempt}/{attempts} failed: {e}");
                }
                Err(e) => {
                    warn!("Synthesis failed after {attempt} attempt(s): {e}");
                    return Err(e);
                }
            }
        }
    }
}

//! Catalog resolution: free text → first ranked track.
//!
//! `SpotifyCatalog` holds one bearer session obtained through a
//! client-credentials grant at startup.  When that grant fails the catalog is
//! marked unavailable for the life of the process; when a later token expires
//! it is renewed once, transparently, inside the resolve call that noticed.

use async_trait::async_trait;
use preview_proto::config::{CatalogConfig, CatalogCredentials};
use preview_proto::protocol::TrackDescriptor;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::ResolveError;

/// Renew tokens this long before the catalog says they expire.
const EXPIRY_SKEW: Duration = Duration::from_secs(30);

#[async_trait]
pub trait CatalogResolver: Send + Sync {
    /// Resolve `query` to exactly one track: the first ranked hit.
    async fn resolve(&self, query: &str) -> Result<TrackDescriptor, ResolveError>;

    /// False once the catalog is known to be unusable for every request.
    fn is_ready(&self) -> bool {
        true
    }
}

// ── wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    tracks: Option<TrackPage>,
}

#[derive(Debug, Deserialize)]
struct TrackPage {
    #[serde(default)]
    items: Vec<ApiTrack>,
}

#[derive(Debug, Deserialize)]
struct ApiTrack {
    name: String,
    #[serde(default)]
    artists: Vec<ApiArtist>,
    #[serde(default)]
    external_urls: ExternalUrls,
    #[serde(default)]
    album: Option<ApiAlbum>,
    #[serde(default)]
    preview_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiArtist {
    name: String,
}

#[derive(Debug, Deserialize, Default)]
struct ExternalUrls {
    #[serde(default)]
    spotify: String,
}

#[derive(Debug, Deserialize)]
struct ApiAlbum {
    #[serde(default)]
    images: Vec<ApiImage>,
}

#[derive(Debug, Deserialize)]
struct ApiImage {
    url: String,
}

impl From<ApiTrack> for TrackDescriptor {
    fn from(track: ApiTrack) -> Self {
        TrackDescriptor {
            title: track.name,
            artists: track.artists.into_iter().map(|a| a.name).collect(),
            catalog_url: track.external_urls.spotify,
            album_art_url: track
                .album
                .and_then(|a| a.images.into_iter().next())
                .map(|i| i.url),
            preview_url: track.preview_url.filter(|u| !u.trim().is_empty()),
        }
    }
}

// ── bearer session ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct BearerToken {
    value: String,
    expires_at: Instant,
}

impl BearerToken {
    fn is_expired(&self) -> bool {
        Instant::now() + EXPIRY_SKEW >= self.expires_at
    }
}

#[derive(Debug, Clone)]
enum BearerSession {
    Active(BearerToken),
    /// The startup grant failed; holds the reason.
    Unavailable(String),
}

enum SearchAttempt {
    Found(TrackDescriptor),
    Unauthorized,
}

// ── SpotifyCatalog ────────────────────────────────────────────────────────────

pub struct SpotifyCatalog {
    http: reqwest::Client,
    config: CatalogConfig,
    credentials: Option<CatalogCredentials>,
    session: Mutex<BearerSession>,
    ready: AtomicBool,
}

impl SpotifyCatalog {
    /// Build the client and run the client-credentials grant once.  A failed
    /// grant is logged and never retried: every later `resolve` fails with
    /// `CatalogUnavailable`.
    pub async fn connect(config: CatalogConfig, credentials: Option<CatalogCredentials>) -> Self {
        let http = match reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(config.resolve_timeout())
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!("Catalog: falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            }
        };
        Self::connect_with_client(http, config, credentials).await
    }

    pub async fn connect_with_client(
        http: reqwest::Client,
        config: CatalogConfig,
        credentials: Option<CatalogCredentials>,
    ) -> Self {
        let catalog = Self {
            http,
            config,
            credentials,
            session: Mutex::new(BearerSession::Unavailable("not connected".into())),
            ready: AtomicBool::new(false),
        };

        let session = match catalog.grant().await {
            Ok(token) => {
                info!("Catalog: bearer session established");
                catalog.ready.store(true, Ordering::Relaxed);
                BearerSession::Active(token)
            }
            Err(reason) => {
                error!("Catalog: did not receive access token: {}", reason);
                BearerSession::Unavailable(reason)
            }
        };
        *catalog.session.lock().await = session;
        catalog
    }

    /// POST the client-credentials grant.
    async fn grant(&self) -> Result<BearerToken, String> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or_else(|| "client id/secret not configured".to_string())?;

        let url = format!("{}/api/token", self.config.accounts_base.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .basic_auth(&creds.client_id, Some(&creds.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| format!("token request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("token endpoint returned {}", response.status()));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| format!("malformed token response: {}", e))?;

        Ok(BearerToken {
            value: body.access_token,
            expires_at: Instant::now() + Duration::from_secs(body.expires_in),
        })
    }

    /// Current token, renewed first when it is about to expire.
    async fn bearer(&self) -> Result<String, ResolveError> {
        let current = self.session.lock().await.clone();
        match current {
            BearerSession::Unavailable(reason) => Err(ResolveError::CatalogUnavailable(reason)),
            BearerSession::Active(token) if !token.is_expired() => Ok(token.value),
            BearerSession::Active(_) => self.renew().await,
        }
    }

    async fn renew(&self) -> Result<String, ResolveError> {
        debug!("Catalog: renewing bearer session");
        match self.grant().await {
            Ok(token) => {
                let value = token.value.clone();
                *self.session.lock().await = BearerSession::Active(token);
                info!("Catalog: bearer session renewed");
                Ok(value)
            }
            Err(reason) => {
                warn!("Catalog: renewal failed: {}", reason);
                Err(ResolveError::AuthExpired(reason))
            }
        }
    }

    async fn search(&self, token: &str, query: &str) -> Result<SearchAttempt, ResolveError> {
        let url = format!("{}/v1/search", self.config.api_base.trim_end_matches('/'));
        let mut params = vec![("q", query), ("type", "track"), ("limit", "1")];
        if let Some(market) = self.config.market.as_deref() {
            params.push(("market", market));
        }

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&params)
            .send()
            .await
            .map_err(|e| ResolveError::CatalogUnavailable(format!("search failed: {}", e)))?;

        match response.status() {
            StatusCode::UNAUTHORIZED => return Ok(SearchAttempt::Unauthorized),
            status if !status.is_success() => {
                return Err(ResolveError::CatalogUnavailable(format!(
                    "search returned {}",
                    status
                )))
            }
            _ => {}
        }

        let body: SearchResponse = response.json().await.map_err(|e| {
            ResolveError::CatalogUnavailable(format!("malformed search response: {}", e))
        })?;

        body.tracks
            .and_then(|page| page.items.into_iter().next())
            .map(|track| SearchAttempt::Found(track.into()))
            .ok_or(ResolveError::NotFound)
    }
}

#[async_trait]
impl CatalogResolver for SpotifyCatalog {
    async fn resolve(&self, query: &str) -> Result<TrackDescriptor, ResolveError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ResolveError::NotFound);
        }

        let token = self.bearer().await?;
        match self.search(&token, query).await? {
            SearchAttempt::Found(track) => Ok(track),
            SearchAttempt::Unauthorized => {
                let token = self.renew().await?;
                match self.search(&token, query).await? {
                    SearchAttempt::Found(track) => Ok(track),
                    SearchAttempt::Unauthorized => Err(ResolveError::AuthExpired(
                        "search rejected a freshly granted token".into(),
                    )),
                }
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OAuth credential refresh for providers authenticated with short-lived
//! tokens instead of static API keys.
//!
//! The coordinator checks the active token before each turn and refreshes it
//! when expired; on success the models are rebuilt so new requests pick up
//! the fresh credentials.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A stored OAuth credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl OAuthToken {
    /// Expired, with a one-minute skew so a token never dies mid-request.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now() + Duration::seconds(60)
    }

    /// Whether the access token is a JWT.  Providers that accept JWTs expect
    /// `Authorization: Bearer` with the API-key header deliberately emptied.
    pub fn is_jwt(&self) -> bool {
        self.access_token.starts_with("eyJ") && self.access_token.matches('.').count() == 2
    }
}

/// Refreshes an expired token against the provider's token endpoint.
#[async_trait]
pub trait OAuthRefresher: Send + Sync {
    async fn refresh(&self, token: &OAuthToken) -> anyhow::Result<OAuthToken>;
}

/// Standard refresh-token grant over HTTP.
pub struct HttpRefresher {
    pub token_url: String,
    pub client_id: String,
    client: reqwest::Client,
}

impl HttpRefresher {
    pub fn new(token_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            token_url: token_url.into(),
            client_id: client_id.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

#[async_trait]
impl OAuthRefresher for HttpRefresher {
    async fn refresh(&self, token: &OAuthToken) -> anyhow::Result<OAuthToken> {
        use anyhow::Context;
        let resp = self
            .client
            .post(&self.token_url)
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": token.refresh_token,
                "client_id": self.client_id,
            }))
            .send()
            .await
            .context("OAuth refresh request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("OAuth refresh rejected ({status}): {body}");
        }
        let parsed: RefreshResponse = resp.json().await.context("parsing OAuth refresh response")?;
        Ok(OAuthToken {
            access_token: parsed.access_token,
            refresh_token: parsed
                .refresh_token
                .unwrap_or_else(|| token.refresh_token.clone()),
            expires_at: Utc::now() + Duration::seconds(parsed.expires_in),
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

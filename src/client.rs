//! HTTP implementation of [`Upstream`] on `reqwest`.
//!
//! Authentication is resolved once at construction from environment
//! variables named in `[upstream]`: a personal access token
//! (`Authorization: ApiToken <token>`) wins over basic auth; with neither
//! configured requests go out anonymously.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use dhis2_bridge_core::models::EndpointFamily;
use dhis2_bridge_core::BridgeError;

use crate::config::UpstreamConfig;
use crate::traits::Upstream;

/// Maximum number of body bytes quoted in an error cause.
const ERROR_BODY_LIMIT: usize = 200;

#[derive(Clone)]
pub enum Credentials {
    Anonymous,
    Basic { username: String, password: String },
    Token(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Anonymous => f.write_str("Anonymous"),
            Credentials::Basic { username, .. } => write!(f, "Basic({}, ***)", username),
            Credentials::Token(_) => f.write_str("Token(***)"),
        }
    }
}

impl Credentials {
    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        if let Some(ref var) = config.token_env {
            return match std::env::var(var) {
                Ok(token) if !token.trim().is_empty() => Ok(Credentials::Token(token)),
                _ => bail!("upstream.token_env is set but environment variable {} is not", var),
            };
        }
        match (&config.username, &config.password_env) {
            (Some(username), Some(var)) => match std::env::var(var) {
                Ok(password) => Ok(Credentials::Basic {
                    username: username.clone(),
                    password,
                }),
                Err(_) => bail!(
                    "upstream.password_env is set but environment variable {} is not",
                    var
                ),
            },
            (Some(username), None) => Ok(Credentials::Basic {
                username: username.clone(),
                password: String::new(),
            }),
            _ => Ok(Credentials::Anonymous),
        }
    }
}

/// Production [`Upstream`] backed by a shared `reqwest::Client`.
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpUpstream {
    pub fn new(base_url: &str, credentials: Credentials, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("dhis2-bridge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        let credentials = Credentials::from_config(config)?;
        Self::new(config.base(), credentials, config.timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn summarize_params(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| {
            let count = v.split(';').count();
            if count > 3 {
                format!("{}=<{} items>", k, count)
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate(body: &str) -> &str {
    if body.len() <= ERROR_BODY_LIMIT {
        return body;
    }
    let mut end = ERROR_BODY_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn get_json(
        &self,
        family: EndpointFamily,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Value, BridgeError> {
        let url = format!("{}{}", self.base_url, path);
        let unavailable = |cause: String| BridgeError::UpstreamUnavailable {
            endpoint: family,
            summary: summarize_params(params),
            cause,
        };

        let mut request = self
            .client
            .get(&url)
            .query(params)
            .header("Accept", "application/json");
        request = match &self.credentials {
            Credentials::Anonymous => request,
            Credentials::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            Credentials::Token(token) => {
                request.header("Authorization", format!("ApiToken {}", token))
            }
        };

        tracing::debug!(endpoint = %family, %url, "upstream request");
        let response = request.send().await.map_err(|e| {
            let cause = if e.is_timeout() {
                format!("request timed out: {}", e)
            } else {
                format!("request failed: {}", e)
            };
            tracing::warn!(endpoint = %family, %url, %cause, "upstream request failed");
            unavailable(cause)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let cause = match status.as_u16() {
                401 | 403 => format!("authentication rejected (HTTP {})", status.as_u16()),
                code => format!("HTTP {}: {}", code, truncate(body.trim())),
            };
            tracing::warn!(endpoint = %family, %url, %cause, "upstream returned error status");
            return Err(unavailable(cause));
        }

        let text = response
            .text()
            .await
            .map_err(|e| unavailable(format!("failed to read response body: {}", e)))?;
        serde_json::from_str(&text).map_err(|e| BridgeError::UpstreamMalformed {
            endpoint: family,
            message: format!("response is not JSON: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let body = "é".repeat(150);
        let t = truncate(&body);
        assert!(t.len() <= ERROR_BODY_LIMIT);
        assert!(body.starts_with(t));
    }

    #[test]
    fn test_summary_collapses_long_lists() {
        let params = vec![
            ("dimension".to_string(), "dx:a;b;c;d;e".to_string()),
            ("ouMode".to_string(), "SELECTED".to_string()),
        ];
        assert_eq!(
            summarize_params(&params),
            "dimension=<5 items> ouMode=SELECTED"
        );
    }

    #[test]
    fn test_debug_hides_secrets() {
        let basic = Credentials::Basic {
            username: "admin".to_string(),
            password: "district".to_string(),
        };
        assert!(!format!("{:?}", basic).contains("district"));
        assert!(!format!("{:?}", Credentials::Token("d2pat_x".to_string())).contains("d2pat"));
    }
}

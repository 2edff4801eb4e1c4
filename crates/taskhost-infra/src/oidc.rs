//! OpenID Connect client-credentials token source.
//!
//! Discovers the provider's token endpoint from
//! `{authority}/.well-known/openid-configuration` on first use, caches it,
//! and posts a `client_credentials` grant for every fetch.

use chrono::Utc;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::debug;

use taskhost_core::credential::{TokenSet, TokenSource};
use taskhost_types::config::IdentityProviderConfig;
use taskhost_types::error::CredentialError;

const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    token_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Fetches tokens from an OIDC provider with the client-credentials grant.
pub struct OidcTokenSource {
    config: IdentityProviderConfig,
    http: reqwest::Client,
    token_endpoint: OnceCell<String>,
}

impl OidcTokenSource {
    pub fn new(config: IdentityProviderConfig) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("taskhost/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            config,
            http,
            token_endpoint: OnceCell::new(),
        }
    }

    async fn token_endpoint(&self) -> Result<&str, CredentialError> {
        let endpoint = self
            .token_endpoint
            .get_or_try_init(|| self.discover())
            .await?;
        Ok(endpoint.as_str())
    }

    async fn discover(&self) -> Result<String, CredentialError> {
        let url = format!(
            "{}{DISCOVERY_PATH}",
            self.config.authority_url.trim_end_matches('/')
        );
        debug!(url = %url, "discovering token endpoint");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CredentialError::Discovery(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CredentialError::Discovery(format!("{url}: HTTP {status}")));
        }

        let document: DiscoveryDocument = response
            .json()
            .await
            .map_err(|e| CredentialError::Discovery(format!("{url}: {e}")))?;

        debug!(token_endpoint = %document.token_endpoint, "token endpoint discovered");
        Ok(document.token_endpoint)
    }
}

impl TokenSource for OidcTokenSource {
    async fn fetch(&self) -> Result<TokenSet, CredentialError> {
        let endpoint = self.token_endpoint().await?;

        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret()),
            ("scope", self.config.scope.as_str()),
        ];

        let response = self
            .http
            .post(endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| CredentialError::Grant(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Grant(format!("HTTP {status}: {body}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::Grant(format!("invalid token response: {e}")))?;

        Ok(TokenSet::from_response(
            token.access_token,
            token.refresh_token,
            token.expires_in,
            Utc::now(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use secrecy::SecretString;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Provider serving the discovery document, expected to be read exactly once.
    async fn provider_with_discovery() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token_endpoint": format!("{}/connect/token", server.uri()),
            })))
            .expect(1)
            .mount(&server)
            .await;
        server
    }

    fn config(authority_url: String) -> IdentityProviderConfig {
        IdentityProviderConfig {
            authority_url,
            client_id: "etw".to_string(),
            client_secret: SecretString::from("secret".to_string()),
            scope: "engine_etw".to_string(),
        }
    }

    #[tokio::test]
    async fn fetch_discovers_once_and_grants() {
        let server = provider_with_discovery().await;
        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_id=etw"))
            .and(body_string_contains("client_secret=secret"))
            .and(body_string_contains("scope=engine_etw"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "a.b.c",
                "expires_in": 300,
                "token_type": "Bearer",
            })))
            .expect(2)
            .mount(&server)
            .await;

        let source = OidcTokenSource::new(config(format!("{}/", server.uri())));
        let first = source.fetch().await.unwrap();
        let second = source.fetch().await.unwrap();

        assert_eq!(first.access_token.expose_secret(), "a.b.c");
        assert!(first.expires_at.is_some());
        assert!(second.refresh_token.is_none());
        server.verify().await;
    }

    #[tokio::test]
    async fn rejected_grant_is_grant_error() {
        let server = provider_with_discovery().await;
        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": "invalid_client",
            })))
            .mount(&server)
            .await;

        let source = OidcTokenSource::new(config(server.uri()));
        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, CredentialError::Grant(ref msg) if msg.contains("401") && msg.contains("invalid_client")));
    }

    #[tokio::test]
    async fn missing_discovery_document_is_discovery_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let source = OidcTokenSource::new(config(server.uri()));
        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, CredentialError::Discovery(ref msg) if msg.contains("404")));
    }

    #[tokio::test]
    async fn unreachable_authority_is_discovery_error() {
        let server = MockServer::start().await;
        let uri = server.uri();
        drop(server);

        let source = OidcTokenSource::new(config(uri));
        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, CredentialError::Discovery(_)));
    }
}

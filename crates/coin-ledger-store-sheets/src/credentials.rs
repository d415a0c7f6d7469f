//! Credential resolution for the spreadsheet service.
//!
//! A hosted deployment provides credentials as a named secret in the process
//! environment; a local checkout keeps them in a JSON key file next to the
//! binary. The secret wins whenever it is present.
//!
//! Either source holds a ready bearer token (a bare string, or
//! `{"access_token": ...}`) or a service-account key. Service-account keys are
//! exchanged for short-lived tokens with a signed JWT grant, and the minted
//! token is reused until it nears expiry.

use std::fmt::{Debug, Formatter};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const DEFAULT_SECRET_NAME: &str = "COIN_LEDGER_SHEETS_TOKEN";
pub const DEFAULT_KEY_FILE: &str = "secrets.json";
pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    HostedSecret,
    KeyFile,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    AccessToken,
    ServiceAccount,
}

#[derive(Clone)]
pub struct SheetsCredentials {
    grant: Grant,
    source: CredentialSource,
}

#[derive(Clone)]
enum Grant {
    AccessToken(String),
    ServiceAccount(Arc<ServiceAccountGrant>),
}

struct ServiceAccountGrant {
    client_email: String,
    token_uri: String,
    key: EncodingKey,
    cached: Mutex<Option<MintedToken>>,
}

#[derive(Clone)]
struct MintedToken {
    access_token: String,
    expires_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
struct GrantClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CredentialDocument {
    ServiceAccount {
        client_email: String,
        private_key: String,
        #[serde(default = "default_token_uri")]
        token_uri: String,
    },
    AccessToken {
        access_token: String,
    },
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl SheetsCredentials {
    #[must_use]
    pub fn new(access_token: impl Into<String>, source: CredentialSource) -> Self {
        Self { grant: Grant::AccessToken(access_token.into()), source }
    }

    /// Credentials that mint tokens from a service-account key.
    ///
    /// # Errors
    /// Returns an error when `private_key_pem` is not an RSA private key.
    pub fn service_account(
        client_email: impl Into<String>,
        private_key_pem: &str,
        token_uri: impl Into<String>,
        source: CredentialSource,
    ) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .context("service-account private_key is not a valid RSA PEM key")?;
        let grant = ServiceAccountGrant {
            client_email: client_email.into(),
            token_uri: token_uri.into(),
            key,
            cached: Mutex::new(None),
        };
        Ok(Self { grant: Grant::ServiceAccount(Arc::new(grant)), source })
    }

    #[must_use]
    pub fn source(&self) -> CredentialSource {
        self.source
    }

    #[must_use]
    pub fn kind(&self) -> CredentialKind {
        match self.grant {
            Grant::AccessToken(_) => CredentialKind::AccessToken,
            Grant::ServiceAccount(_) => CredentialKind::ServiceAccount,
        }
    }

    /// `Authorization` header value, minting a token first when needed.
    pub(crate) fn bearer(&self, agent: &ureq::Agent) -> Result<String> {
        match &self.grant {
            Grant::AccessToken(token) => Ok(format!("Bearer {token}")),
            Grant::ServiceAccount(grant) => Ok(format!("Bearer {}", grant.access_token(agent)?)),
        }
    }
}

impl ServiceAccountGrant {
    fn access_token(&self, agent: &ureq::Agent) -> Result<String> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        let now = OffsetDateTime::now_utc();
        if let Some(token) = cached.as_ref() {
            if token.expires_at - time::Duration::seconds(REFRESH_MARGIN_SECS) > now {
                return Ok(token.access_token.clone());
            }
        }

        let minted = self.exchange(agent, now)?;
        let access_token = minted.access_token.clone();
        *cached = Some(minted);
        Ok(access_token)
    }

    fn exchange(&self, agent: &ureq::Agent, now: OffsetDateTime) -> Result<MintedToken> {
        let issued_at = now.unix_timestamp();
        let claims = GrantClaims {
            iss: &self.client_email,
            scope: SHEETS_SCOPE,
            aud: &self.token_uri,
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME_SECS,
        };
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .context("failed to sign service-account assertion")?;

        let response: TokenResponse = agent
            .post(&self.token_uri)
            .send_form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .map_err(crate::describe_http_error)
            .with_context(|| {
                format!("failed to exchange service-account grant for {}", self.client_email)
            })?
            .into_json()
            .context("failed to decode token endpoint response")?;

        if response.access_token.trim().is_empty() {
            return Err(anyhow!("token endpoint returned an empty access_token"));
        }
        let lifetime = response.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS);
        Ok(MintedToken {
            access_token: response.access_token,
            expires_at: now + time::Duration::seconds(lifetime),
        })
    }
}

impl Debug for SheetsCredentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("SheetsCredentials");
        match &self.grant {
            Grant::AccessToken(_) => debug.field("access_token", &"<redacted>"),
            Grant::ServiceAccount(grant) => debug
                .field("client_email", &grant.client_email)
                .field("token_uri", &grant.token_uri)
                .field("private_key", &"<redacted>"),
        };
        debug.field("source", &self.source).finish()
    }
}

/// Resolve credentials from the environment secret `secret_name`, falling
/// back to `key_file`.
///
/// # Errors
/// Returns an error when the secret is absent and the key file is missing or
/// unreadable, or when the chosen source holds an empty token or an unusable
/// service-account key.
pub fn resolve_credentials(secret_name: &str, key_file: &Path) -> Result<SheetsCredentials> {
    resolve_credentials_from(std::env::var(secret_name).ok(), key_file)
}

fn resolve_credentials_from(secret: Option<String>, key_file: &Path) -> Result<SheetsCredentials> {
    if let Some(secret) = secret.map(|value| value.trim().to_string()) {
        if secret.starts_with('{') {
            let document: CredentialDocument = serde_json::from_str(&secret)
                .context("credentials secret is neither a service-account key nor an access_token object")?;
            return from_document(document, CredentialSource::HostedSecret)
                .context("credentials secret is unusable");
        }
        if !secret.is_empty() {
            return Ok(SheetsCredentials::new(secret, CredentialSource::HostedSecret));
        }
    }

    let bytes = fs::read(key_file)
        .with_context(|| format!("failed to read credentials key file {}", key_file.display()))?;
    let document: CredentialDocument = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse credentials key file {}", key_file.display()))?;
    from_document(document, CredentialSource::KeyFile)
        .with_context(|| format!("credentials key file {} is unusable", key_file.display()))
}

fn from_document(document: CredentialDocument, source: CredentialSource) -> Result<SheetsCredentials> {
    match document {
        CredentialDocument::ServiceAccount { client_email, private_key, token_uri } => {
            SheetsCredentials::service_account(client_email, &private_key, token_uri, source)
        }
        CredentialDocument::AccessToken { access_token } => {
            let token = access_token.trim();
            if token.is_empty() {
                return Err(anyhow!("access_token is empty"));
            }
            Ok(SheetsCredentials::new(token, source))
        }
    }
}

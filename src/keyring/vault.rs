//! HashiCorp Vault KV version 2 keyring.
// 中文: 基于 Vault KV v2 密钥引擎的密钥环。

use std::fs;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{KeyError, Result};
use crate::keyring::{KeyInfo, KeyringProvider};
use crate::registry::{ProviderKind, VaultV2Options};

const TOKEN_HEADER: &str = "X-Vault-Token";

#[derive(Serialize)]
struct WriteRequest<'a> {
    data: KeyPayload<'a>,
}

#[derive(Serialize)]
struct KeyPayload<'a> {
    key: &'a str,
}

#[derive(Deserialize)]
struct ReadResponse {
    data: ReadData,
}

#[derive(Deserialize)]
struct ReadData {
    data: StoredKey,
}

#[derive(Deserialize)]
struct StoredKey {
    key: String,
}

/// Keyring backed by a Vault KV v2 mount.
///
/// A 404 is an ordinary "not found"; every other non-success status, and every
/// transport failure, is reported as `ResourceUnavailable` and never retried here.
pub struct VaultV2Keyring {
    provider_name: String,
    base_url: String,
    mount_path: String,
    token: SecretString,
    client: Client,
}

impl VaultV2Keyring {
    pub fn new(provider_name: impl Into<String>, options: &VaultV2Options) -> Result<Self> {
        let provider_name = provider_name.into();
        let mut builder = Client::builder();
        if let Some(ca_path) = &options.ca_path {
            let pem = fs::read(ca_path).map_err(|e| {
                KeyError::ResourceUnavailable(format!(
                    "failed to read CA file {}: {}",
                    ca_path.display(),
                    e
                ))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                KeyError::InvalidArgument(format!(
                    "invalid CA certificate {}: {}",
                    ca_path.display(),
                    e
                ))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build().map_err(|e| {
            KeyError::ResourceUnavailable(format!("failed to build HTTP client: {}", e))
        })?;

        Ok(Self {
            provider_name,
            base_url: options.url.trim_end_matches('/').to_string(),
            mount_path: options.mount_path.trim_matches('/').to_string(),
            token: SecretString::from(options.token.expose_secret().to_owned()),
            client,
        })
    }

    fn secret_url(&self, name: &str) -> String {
        format!("{}/v1/{}/data/{}", self.base_url, self.mount_path, name)
    }

    fn unavailable(&self, what: &str, detail: impl std::fmt::Display) -> KeyError {
        error!(provider = %self.provider_name, "{}: {}", what, detail);
        KeyError::ResourceUnavailable(format!(
            "vault provider \"{}\": {}: {}",
            self.provider_name, what, detail
        ))
    }
}

impl KeyringProvider for VaultV2Keyring {
    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::VaultV2
    }

    fn fetch(&self, name: &str) -> Result<Option<KeyInfo>> {
        let url = self.secret_url(name);
        debug!(%url, "fetching key from vault");
        let response = self
            .client
            .get(&url)
            .header(TOKEN_HEADER, self.token.expose_secret())
            .send()
            .map_err(|e| self.unavailable("HTTP request failed", e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: ReadResponse = response
                    .json()
                    .map_err(|e| self.unavailable("unexpected response body", e))?;
                let data = BASE64.decode(body.data.data.key.as_bytes())?;
                Ok(Some(KeyInfo::new(name, &data)?))
            }
            status => Err(self.unavailable("unexpected HTTP status", status)),
        }
    }

    fn store(&self, key: &KeyInfo) -> Result<()> {
        if self.fetch(key.name())?.is_some() {
            return Err(KeyError::InvalidOperation(format!(
                "key with name {} already exists in keyring",
                key.name()
            )));
        }

        let encoded = BASE64.encode(key.data());
        let body = WriteRequest {
            data: KeyPayload { key: &encoded },
        };
        let response = self
            .client
            .post(self.secret_url(key.name()))
            .header(TOKEN_HEADER, self.token.expose_secret())
            .json(&body)
            .send()
            .map_err(|e| self.unavailable("HTTP request failed", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.unavailable("unexpected HTTP status", status));
        }
        debug!(key = key.name(), provider = %self.provider_name, "stored key in vault");
        Ok(())
    }
}

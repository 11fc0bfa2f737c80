//! Blocking connections to the MASS REST API and their registry.

use super::config::ClientConfig;
use crate::errors::CollaboratorError;
use parking_lot::RwLock;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Alias of the connection used when none is named.
pub const DEFAULT_ALIAS: &str = "default";

/// One page of a paginated list response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items of this page.
    pub results: Vec<T>,
    /// Absolute URL of the next page.
    #[serde(default)]
    pub next: Option<String>,
}

/// Where a request path points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    /// Relative to the base URL.
    Path(&'a str),
    /// A full URL as returned by the service.
    Url(&'a str),
}

/// An authenticated connection.
#[derive(Debug, Clone)]
pub struct Connection {
    client: Client,
    base_url: String,
}

impl Connection {
    /// Builds the HTTP client for `config`.
    pub fn new(config: &ClientConfig) -> Result<Self, CollaboratorError> {
        config
            .validate()
            .map_err(|e| CollaboratorError::Rejected(e.to_string()))?;

        let mut auth = HeaderValue::from_str(&format!("APIKEY {}", config.api_key))
            .map_err(|e| CollaboratorError::Rejected(format!("invalid API key: {e}")))?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.normalized_base_url(),
        })
    }

    /// The API root with a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolves a target to a full URL.
    #[must_use]
    pub fn url(&self, target: Target<'_>) -> String {
        match target {
            Target::Path(path) => format!("{}{}", self.base_url, path.trim_start_matches('/')),
            Target::Url(url) => url.to_string(),
        }
    }

    /// Fetches and decodes one JSON document.
    pub fn get_json<T: DeserializeOwned>(&self, target: Target<'_>) -> Result<T, CollaboratorError> {
        let url = self.url(target);
        let response = self.execute(self.client.get(&url), &url)?;
        decode(response, &url)
    }

    /// Fetches every page of a list, following `next` links.
    pub fn get_all<T: DeserializeOwned>(
        &self,
        target: Target<'_>,
    ) -> Result<Vec<T>, CollaboratorError> {
        let mut items = Vec::new();
        let mut next = Some(self.url(target));
        while let Some(url) = next {
            let page: Page<T> = self.get_json(Target::Url(&url))?;
            items.extend(page.results);
            next = page.next;
        }
        Ok(items)
    }

    /// Posts a JSON body and decodes the JSON answer.
    pub fn post_json<T: DeserializeOwned>(
        &self,
        target: Target<'_>,
        body: &Value,
    ) -> Result<T, CollaboratorError> {
        let url = self.url(target);
        let response = self.execute(self.client.post(&url).json(body), &url)?;
        decode(response, &url)
    }

    /// Posts a multipart form with a `metadata` part, one JSON part per
    /// `json_files` entry and one binary part per `binary_files` entry.
    ///
    /// A `204 No Content` answer yields an empty object.
    pub fn post_multipart(
        &self,
        target: Target<'_>,
        metadata: &Value,
        json_files: &Map<String, Value>,
        binary_files: &BTreeMap<String, Vec<u8>>,
    ) -> Result<Value, CollaboratorError> {
        let url = self.url(target);
        let mut form = Form::new().part("metadata", json_part(metadata)?);
        for (name, value) in json_files {
            form = form.part(name.clone(), json_part(value)?.file_name(name.clone()));
        }
        for (name, content) in binary_files {
            let part = Part::bytes(content.clone())
                .file_name(name.clone())
                .mime_str("binary/octet-stream")?;
            form = form.part(name.clone(), part);
        }

        let response = self.execute(self.client.post(&url).multipart(form), &url)?;
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Object(Map::new()));
        }
        decode(response, &url)
    }

    fn execute(&self, request: RequestBuilder, url: &str) -> Result<Response, CollaboratorError> {
        let response = request.send()?;
        let status = response.status();
        debug!(url, status = status.as_u16(), "MASS request finished");
        if !status.is_success() {
            return Err(CollaboratorError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }
}

fn json_part(value: &Value) -> Result<Part, CollaboratorError> {
    let body = serde_json::to_string(value).map_err(|e| CollaboratorError::InvalidResponse {
        url: String::new(),
        reason: e.to_string(),
    })?;
    Ok(Part::text(body).mime_str("application/json")?)
}

fn decode<T: DeserializeOwned>(response: Response, url: &str) -> Result<T, CollaboratorError> {
    let body = response.bytes()?;
    serde_json::from_slice(&body).map_err(|e| CollaboratorError::InvalidResponse {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

/// Named connections shared by every collaborator of a process.
///
/// Built once by the caller and passed around by `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the connection for `alias`.
    pub fn register(
        &self,
        alias: impl Into<String>,
        config: &ClientConfig,
    ) -> Result<Arc<Connection>, CollaboratorError> {
        let connection = Arc::new(Connection::new(config)?);
        self.connections
            .write()
            .insert(alias.into(), connection.clone());
        Ok(connection)
    }

    /// Returns the connection registered under `alias`.
    pub fn get(&self, alias: &str) -> Result<Arc<Connection>, CollaboratorError> {
        self.connections
            .read()
            .get(alias)
            .cloned()
            .ok_or_else(|| CollaboratorError::UnknownConnection(alias.to_string()))
    }

    /// Returns the connection registered under [`DEFAULT_ALIAS`].
    pub fn default_connection(&self) -> Result<Arc<Connection>, CollaboratorError> {
        self.get(DEFAULT_ALIAS)
    }

    /// Registered aliases.
    #[must_use]
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.connections.read().keys().cloned().collect();
        aliases.sort();
        aliases
    }
}

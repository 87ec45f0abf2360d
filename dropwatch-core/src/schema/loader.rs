//! # Schema Loader
//!
//! One-shot retrieval of the protobuf.js JSON schema. The node serves it over plain HTTP at
//! `/messages` on the same host as the status socket, but the same JSON can also be read
//! from a local file when the node is not reachable or the schema is pinned.
use super::{SchemaError, SchemaRegistry};
use std::path::PathBuf;
use tracing::{debug, info};

/// Path the schema is served at when nothing else is configured.
pub const DEFAULT_SCHEMA_PATH: &str = "/messages";

/// Errors that can occur while retrieving the schema.
///
/// All of them are fatal: nothing can be decoded without a schema.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to request schema from '{url}': '{source}'")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Schema endpoint '{url}' answered with status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("Failed to read schema file '{}': '{source}'", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Where the schema JSON comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaSource {
    /// Fetched from the node, at this path on its host.
    Remote { path: String },
    /// Read from a local file.
    File(PathBuf),
}

impl Default for SchemaSource {
    fn default() -> Self {
        Self::Remote {
            path: DEFAULT_SCHEMA_PATH.to_string(),
        }
    }
}

/// Loads the schema registry from a [`SchemaSource`].
#[derive(Debug, Clone)]
pub struct SchemaLoader {
    client: reqwest::Client,
    host: String,
    source: SchemaSource,
}

impl SchemaLoader {
    /// Creates a loader for the node at `host` (e.g. `localhost:8080`).
    pub fn new(host: impl Into<String>, source: SchemaSource) -> Self {
        Self {
            client: reqwest::Client::new(),
            host: host.into(),
            source,
        }
    }

    /// The URL the schema is fetched from, if it is fetched at all.
    pub fn url(&self) -> Option<String> {
        match &self.source {
            SchemaSource::Remote { path } => Some(crate::endpoint("http", &self.host, path)),
            SchemaSource::File(_) => None,
        }
    }

    /// Retrieves and parses the schema.
    ///
    /// Remote sources issue exactly one `GET` request.
    ///
    /// # Returns
    ///
    /// * `Ok(SchemaRegistry)` - The populated registry.
    /// * `Err(LoadError)` - If the schema could not be retrieved or parsed.
    pub async fn load(&self) -> Result<SchemaRegistry, LoadError> {
        match &self.source {
            SchemaSource::Remote { path } => {
                self.fetch(crate::endpoint("http", &self.host, path)).await
            }
            SchemaSource::File(path) => {
                info!(path = %path.display(), "loading schema from file");
                SchemaRegistry::from_file(path).await
            }
        }
    }

    async fn fetch(&self, url: String) -> Result<SchemaRegistry, LoadError> {
        info!(%url, "fetching schema");

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(source) => return Err(LoadError::Request { url, source }),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::Status { url, status });
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(source) => return Err(LoadError::Request { url, source }),
        };

        debug!(%url, len = body.len(), "schema received");

        Ok(SchemaRegistry::from_json(&body)?)
    }
}

use config::{Config, ConfigBuilder, Environment, File, builder::DefaultState};
use serde::{Deserialize, Serialize};

use extract::{GraphSchema, LlmApi, LlmConfig, RetryConfig, SchemaError};
use index::{EmbeddingConfig, IndexConfig, Neo4jConfig};
use ingest::{ChunkerConfig, ChunkerError};
use pipeline::PipelineConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error(transparent)]
    Chunking(#[from] ChunkerError),
    #[error("invalid schema: {0}")]
    Schema(#[from] SchemaError),
    #[error("{0}.api_key is required for the openai api")]
    MissingApiKey(&'static str),
    #[error("store.username and store.password are required for the neo4j backend")]
    MissingCredentials,
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub log: LogConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub chunking: ChunkerConfig,
    pub index: IndexConfig,
    pub query: QueryConfig,
    pub retry: RetryConfig,
    pub schema: SchemaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            max_upload_mb: 25,
        }
    }
}

impl ServerConfig {
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb * 1024 * 1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Used when `RUST_LOG` is not set
    pub filter: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info,tower_http=debug".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Neo4j,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub uri: String,
    pub username: String,
    pub password: Option<String>,
    pub database: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Neo4j,
            uri: "bolt://localhost:7687".to_string(),
            username: "neo4j".to_string(),
            password: None,
            database: "neo4j".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn neo4j(&self) -> Result<Neo4jConfig, ConfigurationError> {
        match &self.password {
            Some(password) if !password.is_empty() && !self.username.is_empty() => Ok(Neo4jConfig {
                uri: self.uri.clone(),
                username: self.username.clone(),
                password: password.clone(),
                database: self.database.clone(),
            }),
            _ => Err(ConfigurationError::MissingCredentials),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub top_k: usize,
    pub hint_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        let defaults = PipelineConfig::default();
        Self {
            top_k: defaults.top_k,
            hint_limit: defaults.hint_limit,
        }
    }
}

/// Optional override of the built-in biomedical catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub node_types: Vec<String>,
    pub relationship_types: Vec<String>,
    pub node_properties: bool,
    pub relationship_properties: bool,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            node_types: Vec::new(),
            relationship_types: Vec::new(),
            node_properties: true,
            relationship_properties: true,
        }
    }
}

impl SchemaConfig {
    pub fn build(&self) -> Result<GraphSchema, SchemaError> {
        let schema = if self.node_types.is_empty() {
            GraphSchema::biomedical()
        } else {
            GraphSchema::new(self.node_types.iter().cloned(), self.relationship_types.iter().cloned())?
        };
        Ok(schema.with_property_capture(self.node_properties, self.relationship_properties))
    }
}

impl AppConfig {
    /// Defaults, then `biograph.toml`, then `.env` and `BIOGRAPH__*`
    /// environment variables (`BIOGRAPH__STORE__URI=bolt://...`).
    pub fn load() -> Result<Self, ConfigurationError> {
        dotenvy::dotenv().ok();

        let builder = Config::builder()
            .add_source(File::with_name("biograph").required(false))
            .add_source(
                Environment::with_prefix("BIOGRAPH")
                    .separator("__")
                    .try_parsing(true),
            );
        Self::from_builder(builder)
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigurationError> {
        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work before anything connects.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        ingest::Chunker::new(self.chunking)?;
        self.schema.build()?;

        if self.llm.api == LlmApi::OpenAi && self.llm.api_key.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigurationError::MissingApiKey("llm"));
        }
        if self.embedding.api == LlmApi::OpenAi && self.embedding.api_key.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigurationError::MissingApiKey("embedding"));
        }
        if self.store.backend == StoreBackend::Neo4j {
            self.store.neo4j()?;
        }
        if self.query.top_k == 0 {
            return Err(ConfigurationError::Zero { field: "query.top_k" });
        }
        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(ConfigurationError::Zero { field: "cache.max_entries" });
        }
        Ok(())
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            chunking: self.chunking,
            index: self.index.clone(),
            top_k: self.query.top_k,
            hint_limit: self.query.hint_limit,
        }
    }
}

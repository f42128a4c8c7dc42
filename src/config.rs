use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Name of the store file inside the data directory.
pub const DB_FILE: &str = "crystal.db";

/// The three supported embedding backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Remote batched API (1536 dimensions by default).
    OpenAi,
    /// Local HTTP instance, one request per input (768 dimensions by default).
    Ollama,
    /// Remote batched API (768 dimensions by default).
    Google,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
            Self::Google => "google",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            "google" => Ok(Self::Google),
            other => bail!("unknown embedding provider: {other}. Supported: openai, ollama, google"),
        }
    }
}

/// Embedding provider selection plus per-provider settings.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub provider: ProviderKind,
    pub openai_model: String,
    pub openai_api_key: Option<String>,
    pub ollama_host: String,
    pub ollama_model: String,
    pub google_model: String,
    pub google_api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            openai_model: "text-embedding-3-small".into(),
            openai_api_key: None,
            ollama_host: "http://localhost:11434".into(),
            ollama_model: "nomic-embed-text".into(),
            google_model: "text-embedding-004".into(),
            google_api_key: None,
        }
    }
}

/// Relay (dead drop) connectivity for clients, plus the serving surface.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base URL of the dead drop, e.g. `https://relay.example.net`.
    pub url: Option<String>,
    /// Bearer token presented by this machine.
    pub token: Option<String>,
    /// Path to the base64-encoded 32-byte master key.
    pub key_path: PathBuf,
    /// Bind address when running the dead drop server.
    pub bind: String,
    /// Bearer token → agent name map accepted by the dead drop server.
    pub agents: HashMap<String, String>,
}

/// Fully resolved runtime configuration.
///
/// Resolution order for every value: explicit override, process environment,
/// then the dotenv file inside the data directory. The data directory itself
/// prefers `~/.ldm/memory` when that directory already contains a store, and
/// falls back to the legacy `~/.memory-crystal` otherwise.
#[derive(Debug, Clone)]
pub struct CrystalConfig {
    pub data_dir: PathBuf,
    pub agent_id: String,
    pub embedding: EmbeddingConfig,
    pub relay: RelayConfig,
    /// When set, the capability facade talks to this remote HTTPS surface
    /// instead of the local store.
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
}

/// Explicit overrides, strongest in the resolution order.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub data_dir: Option<PathBuf>,
    pub agent_id: Option<String>,
    pub provider: Option<String>,
}

impl CrystalConfig {
    /// Resolve configuration from the environment and the data-dir dotenv file.
    pub fn load() -> Result<Self> {
        Self::load_with(ConfigOverrides::default())
    }

    /// Resolve configuration with explicit overrides applied first.
    pub fn load_with(overrides: ConfigOverrides) -> Result<Self> {
        let data_dir = resolve_data_dir(overrides.data_dir.as_deref());

        // The dotenv file never overrides variables already in the process
        // environment, which gives the env > dotenv precedence directly.
        let dotenv_path = data_dir.join(".env");
        if dotenv_path.exists() {
            dotenvy::from_path(&dotenv_path)
                .with_context(|| format!("failed to read {}", dotenv_path.display()))?;
            info!(path = %dotenv_path.display(), "loaded dotenv file");
        }

        let provider: ProviderKind = overrides
            .provider
            .or_else(|| env_var("CRYSTAL_EMBEDDING_PROVIDER"))
            .as_deref()
            .unwrap_or("openai")
            .parse()?;

        let embedding = EmbeddingConfig {
            provider,
            openai_model: env_var("CRYSTAL_OPENAI_MODEL")
                .unwrap_or_else(|| "text-embedding-3-small".into()),
            openai_api_key: env_var("OPENAI_API_KEY"),
            ollama_host: env_var("CRYSTAL_OLLAMA_HOST")
                .unwrap_or_else(|| "http://localhost:11434".into()),
            ollama_model: env_var("CRYSTAL_OLLAMA_MODEL")
                .unwrap_or_else(|| "nomic-embed-text".into()),
            google_model: env_var("CRYSTAL_GOOGLE_MODEL")
                .unwrap_or_else(|| "text-embedding-004".into()),
            google_api_key: env_var("GOOGLE_API_KEY"),
        };

        let relay = RelayConfig {
            url: env_var("CRYSTAL_RELAY_URL"),
            token: env_var("CRYSTAL_RELAY_TOKEN"),
            key_path: env_var("CRYSTAL_RELAY_KEY")
                .map(|p| expand_tilde(&p))
                .unwrap_or_else(|| data_dir.join("relay.key")),
            bind: env_var("CRYSTAL_RELAY_BIND").unwrap_or_else(|| "127.0.0.1:8787".into()),
            agents: parse_agent_tokens(env_var("CRYSTAL_RELAY_AGENTS").as_deref()),
        };

        Ok(Self {
            data_dir,
            agent_id: overrides
                .agent_id
                .or_else(|| env_var("CRYSTAL_AGENT_ID"))
                .unwrap_or_else(|| "main".into()),
            embedding,
            relay,
            remote_url: env_var("CRYSTAL_REMOTE_URL"),
            remote_token: env_var("CRYSTAL_REMOTE_TOKEN"),
        })
    }

    /// Path of the store file inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Parse `token:agent,token:agent` into a token → agent map.
fn parse_agent_tokens(raw: Option<&str>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Some(raw) = raw else { return map };
    for pair in raw.split(',') {
        if let Some((token, agent)) = pair.split_once(':') {
            let (token, agent) = (token.trim(), agent.trim());
            if !token.is_empty() && !agent.is_empty() {
                map.insert(token.to_string(), agent.to_string());
            }
        }
    }
    map
}

/// Resolve the data directory.
///
/// `~/.ldm/memory` wins when it already holds a store file; otherwise the
/// legacy `~/.memory-crystal` location is used so existing installs keep
/// working untouched.
fn resolve_data_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Some(dir) = env_var("CRYSTAL_DATA_DIR") {
        return expand_tilde(&dir);
    }

    let home = dirs::home_dir().expect("home directory must exist");
    let preferred = home.join(".ldm").join("memory");
    if preferred.join(DB_FILE).exists() {
        preferred
    } else {
        home.join(".memory-crystal")
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parses_known_names() {
        assert_eq!("openai".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!("ollama".parse::<ProviderKind>().unwrap(), ProviderKind::Ollama);
        assert_eq!("google".parse::<ProviderKind>().unwrap(), ProviderKind::Google);
    }

    #[test]
    fn provider_rejects_unknown_names() {
        let err = "cohere".parse::<ProviderKind>().unwrap_err();
        assert!(err.to_string().contains("unknown embedding provider"));
    }

    #[test]
    fn explicit_data_dir_wins() {
        let dir = resolve_data_dir(Some(Path::new("/tmp/crystal-test")));
        assert_eq!(dir, PathBuf::from("/tmp/crystal-test"));
    }

    #[test]
    fn agent_token_map_parses_pairs() {
        let map = parse_agent_tokens(Some("abc:laptop, def:desktop"));
        assert_eq!(map.get("abc").map(String::as_str), Some("laptop"));
        assert_eq!(map.get("def").map(String::as_str), Some("desktop"));
        assert!(parse_agent_tokens(None).is_empty());
        assert!(parse_agent_tokens(Some("garbage")).is_empty());
    }

    #[test]
    fn expand_tilde_passthrough_for_absolute() {
        assert_eq!(expand_tilde("/var/data"), PathBuf::from("/var/data"));
    }
}

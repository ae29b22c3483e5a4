//! Environment resolution for services.
//!
//! A service lists environment providers in order. Later providers override
//! earlier ones and the service's own overrides are applied last.

use crate::{
    Error, Result,
    capabilities::{CapabilityRegistry, EnvProvider},
    config::CapabilityRef,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// A service's provider list bound to registered implementations
pub struct EnvironmentResolver {
    service: String,
    providers: Vec<(CapabilityRef, Arc<dyn EnvProvider>)>,
    overrides: HashMap<String, String>,
}

impl EnvironmentResolver {
    /// Look up every provider, failing on unknown ids
    pub fn resolve(
        service: impl Into<String>,
        providers: &[CapabilityRef],
        overrides: &HashMap<String, String>,
        registry: &CapabilityRegistry,
    ) -> Result<Self> {
        let providers = providers
            .iter()
            .map(|p| Ok((p.clone(), registry.env_provider(&p.id)?)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            service: service.into(),
            providers,
            overrides: overrides.clone(),
        })
    }

    /// Merge all providers and overrides
    pub async fn load(&self) -> Result<HashMap<String, String>> {
        self.merge(false).await
    }

    /// Like [`load`](Self::load) but asks providers to refresh
    pub async fn refresh(&self) -> Result<HashMap<String, String>> {
        self.merge(true).await
    }

    async fn merge(&self, refresh: bool) -> Result<HashMap<String, String>> {
        let mut env = HashMap::new();
        for (reference, provider) in &self.providers {
            let vars = if refresh {
                provider.refresh(&reference.config).await
            } else {
                provider.load(&reference.config).await
            }
            .map_err(|e| match e {
                Error::Env(_) => e,
                other => Error::Env(format!(
                    "provider '{}' failed for service '{}': {}",
                    reference.id, self.service, other
                )),
            })?;
            debug!(service = %self.service, provider = %reference.id, count = vars.len(), "Loaded environment");
            env.extend(vars);
        }
        env.extend(self.overrides.clone());
        Ok(env)
    }
}

fn parse_config<T: for<'de> Deserialize<'de> + Default>(provider: &str, config: &Value) -> Result<T> {
    if config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.clone())
        .map_err(|e| Error::Env(format!("invalid {} provider config: {}", provider, e)))
}

/// Inline variables
///
/// Accepts either a flat map or `{ "vars": { ... } }`.
pub struct StaticEnvProvider;

#[derive(Deserialize)]
#[serde(untagged)]
enum StaticConfig {
    Wrapped { vars: HashMap<String, Value> },
    Flat(HashMap<String, Value>),
}

impl Default for StaticConfig {
    fn default() -> Self {
        StaticConfig::Flat(HashMap::new())
    }
}

#[async_trait]
impl EnvProvider for StaticEnvProvider {
    async fn load(&self, config: &Value) -> Result<HashMap<String, String>> {
        let vars = match parse_config::<StaticConfig>("static", config)? {
            StaticConfig::Wrapped { vars } | StaticConfig::Flat(vars) => vars,
        };
        Ok(vars
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, value)
            })
            .collect())
    }
}

/// Pass-through of selected host variables
pub struct HostEnvProvider;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HostConfig {
    vars: Vec<String>,
    prefix: Option<String>,
}

#[async_trait]
impl EnvProvider for HostEnvProvider {
    async fn load(&self, config: &Value) -> Result<HashMap<String, String>> {
        let config: HostConfig = parse_config("host", config)?;
        let mut env: HashMap<String, String> = config
            .vars
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
            .collect();
        if let Some(prefix) = &config.prefix {
            env.extend(std::env::vars().filter(|(k, _)| k.starts_with(prefix.as_str())));
        }
        Ok(env)
    }
}

/// `KEY=VALUE` file, re-read on every refresh
pub struct FileEnvProvider;

#[derive(Debug, Deserialize)]
struct FileConfig {
    path: PathBuf,
}

#[async_trait]
impl EnvProvider for FileEnvProvider {
    async fn load(&self, config: &Value) -> Result<HashMap<String, String>> {
        let config: FileConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::Env(format!("invalid file provider config: {}", e)))?;
        let contents = async_fs::read_to_string(&config.path)
            .await
            .map_err(|e| Error::Env(format!("failed to read {}: {}", config.path.display(), e)))?;
        parse_dotenv(&contents)
    }
}

fn parse_dotenv(contents: &str) -> Result<HashMap<String, String>> {
    let mut env = HashMap::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::Env(format!("line {}: expected KEY=VALUE", number + 1)));
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        env.insert(key.trim().to_string(), value.to_string());
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::builder()
            .env_provider("static", Arc::new(StaticEnvProvider))
            .env_provider("file", Arc::new(FileEnvProvider))
            .env_provider("host", Arc::new(HostEnvProvider))
            .build()
    }

    #[test]
    fn test_parse_dotenv() {
        let env = parse_dotenv("# comment\nA=1\nexport B = \"two\"\n\nC='x=y'\n").unwrap();
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "two");
        assert_eq!(env["C"], "x=y");
        assert!(parse_dotenv("oops").is_err());
    }

    #[smol_potat::test]
    async fn test_later_providers_and_overrides_win() {
        let providers = vec![
            CapabilityRef::new("static", json!({ "A": "first", "B": "first", "PORT": 8080 })),
            CapabilityRef::new("static", json!({ "vars": { "B": "second" } })),
        ];
        let overrides = HashMap::from([("A".to_string(), "override".to_string())]);
        let resolver = EnvironmentResolver::resolve("api", &providers, &overrides, &registry()).unwrap();

        let env = resolver.load().await.unwrap();
        assert_eq!(env["A"], "override");
        assert_eq!(env["B"], "second");
        assert_eq!(env["PORT"], "8080");
    }

    #[smol_potat::test]
    async fn test_file_provider_refresh_rereads() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "TOKEN=old").unwrap();
        file.flush().unwrap();

        let providers = vec![CapabilityRef::new("file", json!({ "path": file.path() }))];
        let resolver =
            EnvironmentResolver::resolve("api", &providers, &HashMap::new(), &registry()).unwrap();
        assert_eq!(resolver.load().await.unwrap()["TOKEN"], "old");

        std::fs::write(file.path(), "TOKEN=new\n").unwrap();
        assert_eq!(resolver.refresh().await.unwrap()["TOKEN"], "new");
    }

    #[smol_potat::test]
    async fn test_missing_file_is_env_error() {
        let providers = vec![CapabilityRef::new("file", json!({ "path": "/nonexistent/hive.env" }))];
        let resolver =
            EnvironmentResolver::resolve("api", &providers, &HashMap::new(), &registry()).unwrap();
        assert!(matches!(resolver.load().await, Err(Error::Env(_))));
    }

    #[test]
    fn test_unknown_provider_fails_fast() {
        let providers = vec![CapabilityRef::bare("vault")];
        let err = EnvironmentResolver::resolve("api", &providers, &HashMap::new(), &registry())
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnknownCapability { .. }));
    }

    #[smol_potat::test]
    async fn test_host_provider_selects_vars() {
        let path = std::env::var("PATH").unwrap_or_default();
        let env = HostEnvProvider
            .load(&json!({ "vars": ["PATH", "HIVE_SURELY_UNSET_VAR"] }))
            .await
            .unwrap();
        assert_eq!(env.get("PATH").cloned().unwrap_or_default(), path);
        assert!(!env.contains_key("HIVE_SURELY_UNSET_VAR"));
    }
}

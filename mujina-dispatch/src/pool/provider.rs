//! Sources of pool configurations.
//!
//! The manager polls every registered provider once when it starts (and once
//! more for providers registered while running). A provider that fails is
//! disabled and not polled again.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use super::PoolConfig;
use crate::error::{Error, Result};

pub trait PoolProvider: Send {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Current pool list.
    fn get(&mut self) -> Result<Vec<PoolConfig>>;
}

impl fmt::Debug for dyn PoolProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PoolProvider").field(&self.name()).finish()
    }
}

/// Pools listed in the daemon configuration file.
pub struct ConfigPoolProvider {
    pools: Vec<PoolConfig>,
}

impl ConfigPoolProvider {
    pub fn new(pools: Vec<PoolConfig>) -> Self {
        Self { pools }
    }
}

impl PoolProvider for ConfigPoolProvider {
    fn name(&self) -> &str {
        "config"
    }

    fn get(&mut self) -> Result<Vec<PoolConfig>> {
        Ok(self.pools.clone())
    }
}

/// Pools read from a JSON file holding an array of pool configurations.
pub struct JsonFilePoolProvider {
    path: PathBuf,
}

impl JsonFilePoolProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PoolProvider for JsonFilePoolProvider {
    fn name(&self) -> &str {
        "json-file"
    }

    fn get(&mut self) -> Result<Vec<PoolConfig>> {
        let text = fs::read_to_string(&self.path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Provider(format!("{}: {}", self.path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "mujina-dispatch-{}-{}.json",
            name,
            std::process::id()
        ));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_json_file_list() {
        let path = temp_file(
            "list",
            r#"[
                {"url": "dummy://a", "username": "w1", "priority": 1},
                {"url": "dummy://b", "username": "w2", "algorithm": "keccak"}
            ]"#,
        );
        let pools = JsonFilePoolProvider::new(&path).get().unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].priority, 1);
        assert_eq!(pools[1].algorithm, crate::work::Algorithm::Keccak);
    }

    #[test]
    fn test_json_file_rejects_non_list() {
        let path = temp_file("object", r#"{"url": "dummy://a"}"#);
        let result = JsonFilePoolProvider::new(&path).get();
        fs::remove_file(&path).ok();

        assert!(matches!(result, Err(Error::Provider(_))));
    }

    #[test]
    fn test_json_file_missing() {
        let result = JsonFilePoolProvider::new("/nonexistent/pools.json").get();
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_config_provider_returns_its_pools() {
        let pools: Vec<PoolConfig> =
            toml::from_str::<crate::config::Config>("[[pools]]\nurl = \"dummy://a\"\nusername = \"w\"\n")
                .unwrap()
                .pools;
        let mut provider = ConfigPoolProvider::new(pools.clone());
        assert_eq!(provider.get().unwrap(), pools);
    }
}

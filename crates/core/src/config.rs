use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::TaskError;

/// Flat `KEY=VALUE` configuration, as read from `~/.brenda.conf` or fed to a
/// daemonised node over stdin via the fleet startup script's here-document.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: HashMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the config file path: explicit flag, then `$BRENDA_CONFIG`,
    /// then `$HOME/.brenda.conf`.
    pub fn default_path(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        if let Some(path) = std::env::var_os("BRENDA_CONFIG") {
            let path = PathBuf::from(path);
            if path.as_os_str().is_empty() {
                anyhow::bail!("BRENDA_CONFIG is set but empty");
            }
            return Ok(path);
        }
        let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
        Ok(PathBuf::from(home).join(".brenda.conf"))
    }

    /// Load the config file. A missing file is an empty config so that a
    /// daemonised node can run purely from stdin-supplied keys.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let path = Self::default_path(explicit)?;
        if !path.exists() {
            debug!("config file {} not found, starting empty", path.display());
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|err| anyhow::anyhow!("reading config {}: {err}", path.display()))?;
        let mut conf = Self::new();
        conf.merge_str(&raw);
        debug!("loaded {} config keys from {}", conf.values.len(), path.display());
        Ok(conf)
    }

    /// Merge `KEY=VALUE` lines over the current values. Blank lines and `#`
    /// comments are ignored; later keys win.
    pub fn merge_str(&mut self, raw: &str) {
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => {
                    self.values.insert(key.trim().to_string(), value.trim().to_string());
                }
                None => warn!("ignoring malformed config line: {line:?}"),
            }
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Missing required keys are schema errors, and fatal.
    pub fn require(&self, key: &str) -> Result<&str, TaskError> {
        self.get(key)
            .ok_or_else(|| TaskError::fatal_msg(format!("config key {key:?} is missing")))
    }

    pub fn get_u32_or(&self, key: &str, default: u32) -> u32 {
        self.parsed_or(key, default)
    }

    pub fn get_u64_or(&self, key: &str, default: u64) -> u64 {
        self.parsed_or(key, default)
    }

    pub fn get_flag_or(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            None => default,
            Some("1") | Some("true") => true,
            Some("0") | Some("false") => false,
            Some(other) => {
                warn!("config key {key}={other:?} is not a flag, using {default}");
                default
            }
        }
    }

    fn parsed_or<T: std::str::FromStr + Copy>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            None => default,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("config key {key}={raw:?} is not a number, using default");
                default
            }),
        }
    }

    /// Flag-over-config precedence used by the CLIs.
    pub fn opt_or_key<'a>(&'a self, opt: Option<&'a str>, key: &str) -> Option<&'a str> {
        opt.or_else(|| self.get(key))
    }

    /// The node's scratch directory (`WORK_DIR`, default `.`), created on
    /// first use and returned as an absolute path.
    pub fn work_dir(&self) -> anyhow::Result<PathBuf> {
        let dir = PathBuf::from(self.get_or("WORK_DIR", "."));
        if !dir.is_dir() {
            std::fs::create_dir_all(&dir)
                .map_err(|err| anyhow::anyhow!("creating work dir {}: {err}", dir.display()))?;
        }
        dir.canonicalize()
            .map_err(|err| anyhow::anyhow!("resolving work dir {}: {err}", dir.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lines_and_comments() {
        let mut conf = Config::new();
        conf.merge_str("WORK_QUEUE=sqs://frames\n# a comment\n\nVISIBILITY_TIMEOUT=300\n");
        assert_eq!(conf.get("WORK_QUEUE"), Some("sqs://frames"));
        assert_eq!(conf.get_u32_or("VISIBILITY_TIMEOUT", 120), 300);
        assert_eq!(conf.get("MISSING"), None);
    }

    #[test]
    fn later_merge_wins() {
        let mut conf = Config::new();
        conf.merge_str("DONE=exit\n");
        conf.merge_str("DONE=poll\n");
        assert_eq!(conf.get("DONE"), Some("poll"));
    }

    #[test]
    fn value_may_contain_equals() {
        let mut conf = Config::new();
        conf.merge_str("JOB_URL=https://example.com/scene?rev=7\n");
        assert_eq!(conf.get("JOB_URL"), Some("https://example.com/scene?rev=7"));
    }

    #[test]
    fn require_is_fatal_when_missing() {
        let conf = Config::new();
        let err = conf.require("OUTPUT_URL").unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn flags_and_numbers_fall_back() {
        let mut conf = Config::new();
        conf.merge_str("SHUTDOWN=1\nERROR_PAUSE=abc\n");
        assert!(conf.get_flag_or("SHUTDOWN", false));
        assert!(!conf.get_flag_or("RUNNING_ON_EC2", false));
        assert_eq!(conf.get_u64_or("ERROR_PAUSE", 30), 30);
    }

    #[test]
    fn opt_takes_precedence() {
        let mut conf = Config::new();
        conf.set("INSTANCE_TYPE", "m5.large");
        assert_eq!(conf.opt_or_key(Some("c5.xlarge"), "INSTANCE_TYPE"), Some("c5.xlarge"));
        assert_eq!(conf.opt_or_key(None, "INSTANCE_TYPE"), Some("m5.large"));
    }
}

//! Named payload sets loaded once from a directory
//!
//! Every regular file in the payload directory is one set, named after the
//! file stem (`xss.txt` becomes `xss`). Entries are newline-delimited; lines
//! starting with `;` are comments and blank lines are ignored.

use crate::error::{HalberdError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Read access to payload sets by test name
pub trait PayloadSource: Send + Sync {
    fn load_payloads(&self, name: &str) -> Result<&[String]>;

    fn contains(&self, name: &str) -> bool {
        self.load_payloads(name).is_ok()
    }
}

/// Payload sets held in memory
#[derive(Debug, Default, Clone)]
pub struct PayloadStore {
    dir: PathBuf,
    payloads: HashMap<String, Vec<String>>,
}

impl PayloadStore {
    /// Reads every payload file in `dir`. A missing directory is an error.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(HalberdError::ConfigError(format!(
                "Payload directory '{}' does not exist",
                dir.display()
            )));
        }

        let mut payloads = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = std::fs::read_to_string(&path)?;
            let entries = parse_payloads(&content);
            debug!("Loaded {} payload(s) for '{name}'", entries.len());
            payloads.insert(name.to_string(), entries);
        }

        info!(
            "Loaded {} payload set(s) from {}",
            payloads.len(),
            dir.display()
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            payloads,
        })
    }

    /// Builds a store from in-memory sets
    pub fn from_sets<I, N, P>(sets: I) -> Self
    where
        I: IntoIterator<Item = (N, Vec<P>)>,
        N: Into<String>,
        P: Into<String>,
    {
        Self {
            dir: PathBuf::new(),
            payloads: sets
                .into_iter()
                .map(|(name, entries)| (name.into(), entries.into_iter().map(Into::into).collect()))
                .collect(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.payloads.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

impl PayloadSource for PayloadStore {
    fn load_payloads(&self, name: &str) -> Result<&[String]> {
        self.payloads
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| HalberdError::PayloadNotFound(name.to_string()))
    }
}

/// Splits a payload file into entries, keeping declared order
pub fn parse_payloads(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty() && !l.starts_with(';'))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_comments_and_keeps_order() {
        let parsed = parse_payloads("; header\n<script>\n\n;skip\n' OR 1=1\r\n  spaced  \n");
        assert_eq!(parsed, vec!["<script>", "' OR 1=1", "  spaced  "]);
    }

    #[test]
    fn test_load_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("xss.txt"), ";comment\nb\na\n").unwrap();
        std::fs::write(dir.path().join("sqli"), "'\n").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let store = PayloadStore::load(dir.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.load_payloads("xss").unwrap().to_vec(), vec!["b", "a"]);
        assert_eq!(store.names(), vec!["sqli", "xss"]);
        assert!(matches!(
            store.load_payloads("nested"),
            Err(HalberdError::PayloadNotFound(_))
        ));
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            PayloadStore::load(&missing),
            Err(HalberdError::ConfigError(_))
        ));
    }

    #[test]
    fn test_from_sets() {
        let store = PayloadStore::from_sets([("xss", vec!["<a>"])]);
        assert!(store.contains("xss"));
        assert!(!store.contains("sqli"));
    }
}

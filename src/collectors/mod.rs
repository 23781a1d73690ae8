pub mod cpu;
pub mod memory;
pub mod network;
pub mod snmp;
pub mod system;
pub mod tcp;

use crate::errors::CollectorError;
use crate::registry::MonotonicCounter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

#[async_trait]
pub trait Collector: Send + Sync {
    /// name of the collector as used in logs
    fn name(&self) -> &'static str;

    /// sample the source files and publish to the registry.
    async fn collect(&mut self) -> Result<(), CollectorError>;
}

/// Root-prefixed access to the kernel pseudo-filesystem. The prefix is
/// configurable so tests (and containerized deployments) can point the
/// collectors at a fake or bind-mounted tree.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read one source file. A missing or inaccessible file is a normal
    /// outcome (Ok(None)): the routine publishes nothing this cycle.
    pub async fn read(&self, rel: &str) -> Result<Option<String>, CollectorError> {
        let path = self.root.join(rel);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) => {
                tracing::debug!(path = %path.display(), "source unavailable, skipping");
                Ok(None)
            }
            Err(e) => Err(CollectorError::ProcReadError {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }
}

/// Parse free-form `key value` lines into a name -> integer bag.
/// Lines that do not fit the shape are skipped.
pub fn parse_kv_bag(content: &str) -> HashMap<String, i64> {
    let mut bag = HashMap::new();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        if let (Some(key), Some(value)) = (fields.next(), fields.next()) {
            if let Ok(value) = value.parse::<i64>() {
                bag.insert(key.to_string(), value);
            }
        }
    }
    bag
}

/// Publish a bag entry only when the key is present; a missing key leaves the
/// metric unset for this cycle instead of writing a misleading zero.
pub(crate) fn set_if_present(bag: &HashMap<String, i64>, key: &str, counter: &MonotonicCounter) {
    if let Some(value) = bag.get(key) {
        counter.set(*value);
    }
}

pub(crate) fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kv_bag() {
        let content = "\
Ip6InReceives   12345
Ip6InDiscards   0
garbage line without number x
Udp6InDatagrams 99";
        let bag = parse_kv_bag(content);
        assert_eq!(bag["Ip6InReceives"], 12345);
        assert_eq!(bag["Ip6InDiscards"], 0);
        assert_eq!(bag["Udp6InDatagrams"], 99);
        assert!(!bag.contains_key("garbage"));
    }

    #[test]
    fn test_set_if_present_skips_missing_keys() {
        let counter = MonotonicCounter::default();
        let mut bag = HashMap::new();
        bag.insert("pgpgin".to_string(), 7i64);

        set_if_present(&bag, "pswpin", &counter);
        assert_eq!(counter.value(), None);

        set_if_present(&bag, "pgpgin", &counter);
        assert_eq!(counter.value(), Some(7));
    }

    #[test]
    fn test_all_digits() {
        assert!(all_digits("12345"));
        assert!(!all_digits("12a45"));
        assert!(!all_digits(""));
        assert!(!all_digits("self"));
    }

    #[tokio::test]
    async fn test_missing_source_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let proc = ProcFs::new(dir.path());
        let result = proc.read("net/dev").await.unwrap();
        assert!(result.is_none());
    }
}

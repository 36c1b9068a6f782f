use crate::error::{CrawlError, CrawlResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

/// A browser cookie in W3C WebDriver shape.
///
/// Fields the crawler does not interpret are kept in `extra` and written back
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Cookie jar persisted as one JSON array between crawl runs.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Cookies from the previous run; `None` when there was no previous run.
    pub fn load(&self) -> CrawlResult<Option<Vec<Cookie>>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No session file at {:?}", self.path);
                return Ok(None);
            }
            Err(e) => return Err(self.file_error(e)),
        };
        let cookies: Vec<Cookie> = serde_json::from_str(&raw).map_err(|e| self.file_error(e))?;
        info!("Restored {} cookies from {:?}", cookies.len(), self.path);
        Ok(Some(cookies))
    }

    pub fn save(&self, cookies: &[Cookie]) -> CrawlResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.file_error(e))?;
        }
        let json = serde_json::to_string_pretty(cookies).map_err(|e| self.file_error(e))?;
        std::fs::write(&self.path, json).map_err(|e| self.file_error(e))?;
        info!("Saved {} cookies to {:?}", cookies.len(), self.path);
        Ok(())
    }

    fn file_error(&self, e: impl std::fmt::Display) -> CrawlError {
        CrawlError::SessionFile {
            path: self.path.clone(),
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(name: &str) -> Cookie {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "value": "v1",
            "domain": ".dexscreener.com",
            "path": "/",
            "secure": true,
            "httpOnly": false,
            "expiry": 1_900_000_000u64,
            "sameSite": "Lax"
        }))
        .unwrap()
    }

    #[test]
    fn test_load_without_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("cookies.json"));
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_saved_cookies_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("nested/cookies.json"));
        let jar = vec![cookie("__cf_bm"), cookie("_ga")];
        store.save(&jar).unwrap();
        assert_eq!(store.load().unwrap(), Some(jar));
    }

    #[test]
    fn test_unknown_fields_survive() {
        let raw = r#"[{"name":"a","value":"b","partitionKey":"x"}]"#;
        let jar: Vec<Cookie> = serde_json::from_str(raw).unwrap();
        assert_eq!(jar[0].extra.get("partitionKey").and_then(|v| v.as_str()), Some("x"));
        let back = serde_json::to_value(&jar).unwrap();
        assert_eq!(back[0]["partitionKey"], "x");
        assert!(back[0].get("domain").is_none());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = SessionStore::new(&path).load().unwrap_err();
        assert!(matches!(err, CrawlError::SessionFile { .. }));
    }
}

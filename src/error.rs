use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure kinds raised while driving the browser and extracting pages.
///
/// Startup failures, a lost browser session and shutdown are fatal to a crawl
/// invocation. Every other kind is absorbed at the row, record, window or
/// entity level.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("navigation to {url} did not complete within {waited:?}")]
    NavigationTimeout { url: String, waited: Duration },

    #[error("no element matches {locator}")]
    ElementNotFound { locator: String },

    #[error("element {locator} was not interactable within {waited:?}")]
    ElementNotInteractable { locator: String, waited: Duration },

    #[error("could not parse {field}: {reason}")]
    Parse { field: &'static str, reason: String },

    #[error("failed to persist {key}: {reason}")]
    Persistence { key: String, reason: String },

    #[error("browser session could not be started: {0}")]
    SessionStartup(String),

    #[error("browser session lost: {0}")]
    SessionLost(String),

    #[error("webdriver {command} failed ({error}): {message}")]
    WebDriver {
        command: String,
        error: String,
        message: String,
    },

    #[error("session file {path:?}: {reason}")]
    SessionFile { path: PathBuf, reason: String },

    #[error("invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },

    #[error("crawl interrupted by shutdown")]
    Interrupted,
}

impl CrawlError {
    pub fn parse(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Parse {
            field,
            reason: reason.into(),
        }
    }

    pub fn not_found(locator: impl ToString) -> Self {
        Self::ElementNotFound {
            locator: locator.to_string(),
        }
    }

    /// Errors that must abort the whole invocation rather than one entity.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SessionStartup(_) | Self::SessionLost(_) | Self::Interrupted)
    }
}

pub type CrawlResult<T> = Result<T, CrawlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_session_and_shutdown_errors_are_fatal() {
        assert!(CrawlError::SessionStartup("no chromedriver".into()).is_fatal());
        assert!(CrawlError::SessionLost("invalid session id".into()).is_fatal());
        assert!(CrawlError::Interrupted.is_fatal());
        assert!(!CrawlError::not_found(".custom-tv0t33").is_fatal());
        assert!(!CrawlError::parse("rank", "empty").is_fatal());
    }

    #[test]
    fn test_messages_name_the_locator() {
        let err = CrawlError::not_found("main");
        assert_eq!(err.to_string(), "no element matches main");
    }
}

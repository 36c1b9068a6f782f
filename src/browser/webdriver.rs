//! W3C WebDriver client for a chromedriver-compatible endpoint.

use super::wait::{poll_until, scroll_until_stable, PollPolicy};
use super::{Browser, Cookie, Locator, ScrollOutcome};
use crate::config::BrowserConfig;
use crate::error::{CrawlError, CrawlResult};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Key under which W3C returns element references.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const MASK_WEBDRIVER: &str = "if (navigator.webdriver !== undefined) { \
     Object.defineProperty(navigator, 'webdriver', {get: () => undefined}); }";

const CHROME_ARGS: [&str; 7] = [
    "--no-sandbox",
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--disable-extensions",
    "--no-first-run",
    "--start-maximized",
    "--disable-blink-features=AutomationControlled",
];

pub struct WebDriverBrowser {
    client: reqwest::Client,
    endpoint: String,
    session_id: Option<String>,
    poll: PollPolicy,
    page_load_timeout: Duration,
    current_url: String,
}

impl WebDriverBrowser {
    /// Start a browser session. Any failure here is fatal for the crawl.
    pub async fn launch(config: &BrowserConfig) -> CrawlResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CrawlError::SessionStartup(format!("http client build failed: {e}")))?;
        let endpoint = config.webdriver_url.trim_end_matches('/').to_string();

        let res = client
            .post(format!("{endpoint}/session"))
            .json(&chrome_capabilities(config))
            .send()
            .await
            .map_err(|e| CrawlError::SessionStartup(format!("{endpoint} unreachable: {e}")))?;
        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| CrawlError::SessionStartup(format!("session response read failed: {e}")))?;
        let value: Value = serde_json::from_str(&body).unwrap_or_default();
        if let Some((error, message)) = w3c_error(&value) {
            return Err(CrawlError::SessionStartup(format!("{error}: {message}")));
        }
        if !status.is_success() {
            return Err(CrawlError::SessionStartup(format!(
                "session create HTTP {}: {}",
                status.as_u16(),
                truncate_for_log(&body, 260)
            )));
        }
        let session_id = value
            .pointer("/value/sessionId")
            .or_else(|| value.pointer("/sessionId"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                CrawlError::SessionStartup(format!("session id missing: {}", truncate_for_log(&body, 220)))
            })?;

        let browser = Self {
            client,
            endpoint,
            session_id: Some(session_id),
            poll: PollPolicy::new(
                Duration::from_millis(config.poll_interval_ms),
                Duration::from_millis(config.poll_max_interval_ms),
            ),
            page_load_timeout: config.page_load_timeout(),
            current_url: String::new(),
        };

        let page_load_ms = u64::try_from(browser.page_load_timeout.as_millis()).unwrap_or(u64::MAX);
        if let Err(e) = browser
            .command(Method::POST, "/timeouts", Some(json!({ "pageLoad": page_load_ms })))
            .await
        {
            warn!("Could not set page load timeout: {e}");
        }
        browser.install_stealth().await;

        info!(
            "WebDriver session {} started ({})",
            browser.session_id.as_deref().unwrap_or_default(),
            if config.headless { "headless" } else { "headed" }
        );
        Ok(browser)
    }

    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> CrawlResult<Value> {
        let session = self
            .session_id
            .as_deref()
            .ok_or_else(|| CrawlError::SessionLost(format!("{path}: session already closed")))?;
        let url = format!("{}/session/{}{}", self.endpoint, session, path);

        let mut req = self.client.request(method, &url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        // A refused connection means chromedriver itself is gone.
        let transport = |e: reqwest::Error| {
            if e.is_connect() {
                return CrawlError::SessionLost(format!("{} unreachable: {e}", self.endpoint));
            }
            CrawlError::WebDriver {
                command: path.to_string(),
                error: "transport".to_string(),
                message: e.to_string(),
            }
        };
        let res = req.send().await.map_err(transport)?;
        let status = res.status();
        let text = res.text().await.map_err(transport)?;

        let value: Value = serde_json::from_str(&text).unwrap_or_default();
        if let Some((error, message)) = w3c_error(&value) {
            if error == "invalid session id" {
                return Err(CrawlError::SessionLost(format!("{path}: {message}")));
            }
            return Err(CrawlError::WebDriver {
                command: path.to_string(),
                error,
                message,
            });
        }
        if !status.is_success() {
            return Err(CrawlError::WebDriver {
                command: path.to_string(),
                error: format!("http {}", status.as_u16()),
                message: truncate_for_log(&text, 240),
            });
        }
        Ok(value.get("value").cloned().unwrap_or(Value::Null))
    }

    async fn execute(&self, script: &str, args: Vec<Value>) -> CrawlResult<Value> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": args })),
        )
        .await
    }

    /// First element matching `locator`, if any.
    async fn find(&self, locator: &Locator) -> CrawlResult<Option<String>> {
        let found = self
            .command(
                Method::POST,
                "/element",
                Some(json!({ "using": locator.using(), "value": locator.value })),
            )
            .await;
        match found {
            Ok(value) => value
                .get(ELEMENT_KEY)
                .and_then(Value::as_str)
                .map(|id| Some(id.to_string()))
                .ok_or_else(|| CrawlError::WebDriver {
                    command: "/element".to_string(),
                    error: "malformed response".to_string(),
                    message: format!("no element reference for {locator}"),
                }),
            Err(CrawlError::WebDriver { error, .. }) if error == "no such element" => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn is_interactable(&self, element: &str) -> CrawlResult<bool> {
        for probe in ["displayed", "enabled"] {
            let state = self
                .command(Method::GET, &format!("/element/{element}/{probe}"), None)
                .await;
            match state {
                Ok(Value::Bool(true)) => {}
                Ok(_) => return Ok(false),
                Err(CrawlError::WebDriver { error, .. }) if error == "stale element reference" => {
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    async fn inner_html(&self, element: &str) -> CrawlResult<String> {
        let html = self
            .execute("return arguments[0].innerHTML;", vec![element_arg(element)])
            .await?;
        html.as_str().map(str::to_string).ok_or_else(|| CrawlError::WebDriver {
            command: "/execute/sync".to_string(),
            error: "unexpected result".to_string(),
            message: "innerHTML was not a string".to_string(),
        })
    }

    /// Hide `navigator.webdriver` on every future document, and on this one.
    async fn install_stealth(&self) {
        let cdp = json!({
            "cmd": "Page.addScriptToEvaluateOnNewDocument",
            "params": { "source": MASK_WEBDRIVER },
        });
        if let Err(e) = self.command(Method::POST, "/goog/cdp/execute", Some(cdp)).await {
            debug!("CDP passthrough unavailable, masking per navigation only: {e}");
        }
        self.mask_automation().await;
    }

    async fn mask_automation(&self) {
        if let Err(e) = self.execute(MASK_WEBDRIVER, Vec::new()).await {
            debug!("webdriver flag mask failed: {e}");
        }
    }

    fn navigation_error(&self, url: &str, err: CrawlError) -> CrawlError {
        match err {
            CrawlError::WebDriver { ref error, .. } if error == "timeout" => CrawlError::NavigationTimeout {
                url: url.to_string(),
                waited: self.page_load_timeout,
            },
            other => other,
        }
    }
}

#[async_trait]
impl Browser for WebDriverBrowser {
    async fn open(&mut self, url: &str, cookies: Option<&[Cookie]>) -> CrawlResult<()> {
        self.navigate(url).await?;
        let Some(cookies) = cookies else {
            return Ok(());
        };

        self.command(Method::DELETE, "/cookie", None).await?;
        let mut installed = 0usize;
        for cookie in cookies {
            match self
                .command(Method::POST, "/cookie", Some(json!({ "cookie": cookie })))
                .await
            {
                Ok(_) => installed += 1,
                Err(e) => debug!("cookie {} rejected: {e}", cookie.name),
            }
        }
        self.command(Method::POST, "/refresh", Some(json!({})))
            .await
            .map_err(|e| self.navigation_error(url, e))?;
        self.mask_automation().await;
        info!("Installed {}/{} session cookies", installed, cookies.len());
        Ok(())
    }

    async fn navigate(&mut self, url: &str) -> CrawlResult<()> {
        debug!("GET {url}");
        self.current_url = url.to_string();
        self.command(Method::POST, "/url", Some(json!({ "url": url })))
            .await
            .map_err(|e| self.navigation_error(url, e))?;
        self.mask_automation().await;
        Ok(())
    }

    async fn wait_until_ready(&mut self, timeout: Duration) -> CrawlResult<()> {
        let this = &*self;
        let ready = poll_until(timeout, this.poll, move || async move {
            match this.execute("return document.readyState", Vec::new()).await {
                Ok(state) => Ok((state.as_str() == Some("complete")).then_some(())),
                Err(CrawlError::WebDriver { error, .. }) => {
                    debug!("readyState probe failed ({error}), retrying");
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        })
        .await?;
        ready.ok_or_else(|| CrawlError::NavigationTimeout {
            url: self.current_url.clone(),
            waited: timeout,
        })
    }

    async fn scroll_to_exhaustion(&mut self, max_iterations: u32, pause: Duration) -> CrawlResult<ScrollOutcome> {
        let this = &*self;
        let outcome = scroll_until_stable(
            max_iterations,
            pause,
            move || async move {
                this.execute("window.scrollTo(0, document.body.scrollHeight);", Vec::new())
                    .await
                    .map(drop)
            },
            move || async move {
                let height = this.execute("return document.body.scrollHeight", Vec::new()).await?;
                page_height(&height)
            },
        )
        .await?;
        debug!(
            "scrolled {} times to height {} (exhausted: {})",
            outcome.iterations, outcome.final_height, outcome.exhausted
        );
        Ok(outcome)
    }

    async fn click(&mut self, target: &Locator, timeout: Duration) -> CrawlResult<()> {
        let this = &*self;
        let element = poll_until(timeout, this.poll, move || async move {
            let Some(id) = this.find(target).await? else {
                return Ok(None);
            };
            Ok(this.is_interactable(&id).await?.then_some(id))
        })
        .await?
        .ok_or_else(|| CrawlError::ElementNotInteractable {
            locator: target.to_string(),
            waited: timeout,
        })?;

        let clicked = self
            .command(Method::POST, &format!("/element/{element}/click"), Some(json!({})))
            .await;
        match clicked {
            Ok(_) => Ok(()),
            Err(CrawlError::WebDriver { error, .. })
                if error == "element click intercepted" || error == "element not interactable" =>
            {
                debug!("native click on {target} blocked ({error}), clicking from script");
                self.execute("arguments[0].click();", vec![element_arg(&element)])
                    .await
                    .map(drop)
            }
            Err(e) => Err(e),
        }
    }

    async fn extract_markup(&mut self, scope: &Locator, timeout: Duration) -> CrawlResult<String> {
        let this = &*self;
        // One re-query if the element is swapped out between lookup and read.
        for _ in 0..2 {
            let element = poll_until(timeout, this.poll, move || async move { this.find(scope).await })
                .await?
                .ok_or_else(|| CrawlError::not_found(scope))?;
            match this.inner_html(&element).await {
                Err(CrawlError::WebDriver { error, .. }) if error == "stale element reference" => {
                    debug!("{scope} went stale, re-querying");
                }
                other => return other,
            }
        }
        Err(CrawlError::not_found(scope))
    }

    async fn cookies(&mut self) -> CrawlResult<Vec<Cookie>> {
        let value = self.command(Method::GET, "/cookie", None).await?;
        serde_json::from_value(value).map_err(|e| CrawlError::WebDriver {
            command: "/cookie".to_string(),
            error: "malformed response".to_string(),
            message: e.to_string(),
        })
    }

    async fn quit(&mut self) -> CrawlResult<()> {
        let Some(session_id) = self.session_id.take() else {
            return Ok(());
        };
        self.client
            .delete(format!("{}/session/{}", self.endpoint, session_id))
            .send()
            .await
            .map_err(|e| CrawlError::WebDriver {
                command: "delete session".to_string(),
                error: "transport".to_string(),
                message: e.to_string(),
            })?;
        info!("WebDriver session {session_id} closed");
        Ok(())
    }
}

impl Drop for WebDriverBrowser {
    // Reached only when `quit` was skipped, e.g. by a panic mid-crawl.
    fn drop(&mut self) {
        let Some(session_id) = self.session_id.take() else {
            return;
        };
        warn!("WebDriver session {session_id} dropped without quit, releasing");
        let url = format!("{}/session/{}", self.endpoint, session_id);
        let client = self.client.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = client.delete(url).send().await;
            });
        }
    }
}

// ── Wire helpers ──────────────────────────────────────────────────────────────

pub fn chrome_capabilities(config: &BrowserConfig) -> Value {
    let mut args: Vec<String> = CHROME_ARGS.iter().map(|a| a.to_string()).collect();
    args.push(format!("--window-size={}", config.window_size));
    if config.headless {
        args.push("--headless=new".to_string());
    }
    if let Some(ua) = &config.user_agent {
        args.push(format!("--user-agent={ua}"));
    }
    json!({
        "capabilities": {
            "alwaysMatch": {
                "browserName": "chrome",
                "pageLoadStrategy": "normal",
                "goog:chromeOptions": {
                    "args": args,
                    "excludeSwitches": ["enable-automation"],
                    "useAutomationExtension": false
                }
            }
        }
    })
}

/// `document.body.scrollHeight` as returned by `execute/sync`.
fn page_height(value: &Value) -> CrawlResult<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|h| *h >= 0.0).map(|h| h as u64))
        .ok_or_else(|| CrawlError::WebDriver {
            command: "/execute/sync".to_string(),
            error: "unexpected result".to_string(),
            message: format!("scrollHeight was {value}"),
        })
}

fn element_arg(element: &str) -> Value {
    let mut reference = serde_json::Map::new();
    reference.insert(ELEMENT_KEY.to_string(), Value::String(element.to_string()));
    Value::Object(reference)
}

/// `(error, message)` of a W3C error payload.
fn w3c_error(value: &Value) -> Option<(String, String)> {
    let error = value.pointer("/value/error").and_then(Value::as_str)?;
    let message = value
        .pointer("/value/message")
        .and_then(Value::as_str)
        .unwrap_or("unknown webdriver error");
    Some((error.to_string(), truncate_for_log(message, 240)))
}

fn truncate_for_log(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

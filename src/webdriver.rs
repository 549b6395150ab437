//! [`TableDriver`] backed by a W3C WebDriver endpoint (chromedriver or compatible).
//!
//! Only four protocol calls are used: new session, navigate, synchronous script execution and
//! delete session. All DOM access happens in small scripts that return plain JSON.

use crate::controls::HarvestEndpoints;
use crate::driver::{Control, DriverError, DriverFactory, PageItem, TableDriver, TableSnapshot};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::debug;
use url::Url;

const SNAPSHOT_SCRIPT: &str = r#"
const table = document.querySelector('table');
const index = document.querySelector("app-pagination-widget input[formcontrolname='index']");
const items = Array.from(
  document.querySelectorAll('app-pagination-widget ul.pagination li.page-item')
).map((li) => li.className || '');
const pageSize = document.querySelector("app-pagination-widget select[aria-label='Page size']");
return {
  table: table ? table.outerHTML : '',
  index: index ? String(index.value) : '',
  items: items,
  pageSize: !!pageSize,
};
"#;

const PAGE_SIZE_SCRIPT: &str = r#"
const select = document.querySelector("app-pagination-widget select[aria-label='Page size']");
if (!select) { return false; }
const wanted = String(arguments[0]);
if (!Array.from(select.options).some((option) => option.value === wanted)) { return false; }
select.value = wanted;
select.dispatchEvent(new Event('change', { bubbles: true }));
return true;
"#;

const PAGE_ITEM_SCRIPT: &str = r#"
const items = document.querySelectorAll('app-pagination-widget ul.pagination li.page-item');
const item = items[arguments[0]];
if (!item) { return false; }
const target = item.querySelector('a,button,span') || item;
target.scrollIntoView({ block: 'center' });
target.click();
return true;
"#;

#[derive(Deserialize)]
struct Envelope {
    value: Value,
}

#[derive(Deserialize)]
struct WireError {
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct NewSession {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SnapshotPayload {
    #[serde(default)]
    table: String,
    #[serde(default)]
    index: String,
    #[serde(default)]
    items: Vec<String>,
    #[serde(default)]
    page_size: bool,
}

/// Decodes the value returned by the snapshot script.
pub fn parse_snapshot(value: Value) -> Result<TableSnapshot, DriverError> {
    let payload: SnapshotPayload = serde_json::from_value(value)
        .map_err(|err| DriverError::Protocol(format!("bad snapshot payload: {err}")))?;
    Ok(TableSnapshot {
        table_html: payload.table,
        page_index: payload.index,
        page_items: payload
            .items
            .iter()
            .map(|classes| PageItem::from_classes(classes))
            .collect(),
        page_size_control: payload.page_size,
    })
}

/// Browser settings used for every new session.
#[derive(Debug, Clone, Default)]
pub struct BrowserOptions {
    /// Run without a window.
    pub headless: bool,
    /// Reused `--user-data-dir`.
    pub profile_dir: Option<PathBuf>,
}

impl BrowserOptions {
    /// New-session request body.
    pub fn capabilities(&self) -> Value {
        let mut args = vec![
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-extensions".to_string(),
            "--disable-gpu".to_string(),
            "--window-size=1200,800".to_string(),
        ];
        if self.headless {
            args.push("--headless=new".to_string());
        }
        if let Some(dir) = &self.profile_dir {
            args.push(format!("--user-data-dir={}", dir.display()));
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "pageLoadStrategy": "eager",
                    "goog:chromeOptions": {
                        "args": args,
                        "prefs": { "profile.managed_default_content_settings.images": 2 }
                    }
                }
            }
        })
    }
}

async fn call(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value, DriverError> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request.send().await?;
    let status = response.status();
    let envelope: Envelope = response.json().await?;
    if !status.is_success() {
        let detail = serde_json::from_value::<WireError>(envelope.value)
            .map(|err| format!("{}: {}", err.error, err.message))
            .unwrap_or_else(|_| status.to_string());
        return Err(DriverError::Protocol(detail));
    }
    Ok(envelope.value)
}

/// Opens browser sessions against one WebDriver endpoint.
#[derive(Clone)]
pub struct WebDriverFactory {
    client: Client,
    endpoint: String,
    options: BrowserOptions,
}

impl WebDriverFactory {
    /// Creates a factory for `endpoint`.
    pub fn new(client: Client, endpoint: &Url, options: BrowserOptions) -> Self {
        Self {
            client,
            endpoint: endpoint.as_str().trim_end_matches('/').to_string(),
            options,
        }
    }

    /// Reads endpoint and browser settings from the harvest configuration.
    pub fn from_endpoints(client: Client, endpoints: &HarvestEndpoints) -> Self {
        Self::new(
            client,
            &endpoints.webdriver,
            BrowserOptions {
                headless: endpoints.headless,
                profile_dir: endpoints.profile_dir.clone(),
            },
        )
    }
}

#[async_trait]
impl DriverFactory for WebDriverFactory {
    async fn connect(&self) -> Result<Box<dyn TableDriver>, DriverError> {
        let url = format!("{}/session", self.endpoint);
        let value = call(
            &self.client,
            Method::POST,
            &url,
            Some(self.options.capabilities()),
        )
        .await
        .map_err(|err| DriverError::Session(err.to_string()))?;
        let session: NewSession = serde_json::from_value(value)
            .map_err(|err| DriverError::Session(format!("no session id: {err}")))?;
        debug!(session = %session.session_id, "browser session opened");
        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            base: format!("{}/session/{}", self.endpoint, session.session_id),
            open: true,
        }))
    }
}

/// A live browser session.
pub struct WebDriverSession {
    client: Client,
    base: String,
    open: bool,
}

impl WebDriverSession {
    async fn execute(&self, script: &str, args: Value) -> Result<Value, DriverError> {
        if !self.open {
            return Err(DriverError::Session("session already closed".into()));
        }
        call(
            &self.client,
            Method::POST,
            &format!("{}/execute/sync", self.base),
            Some(json!({ "script": script, "args": args })),
        )
        .await
    }
}

#[async_trait]
impl TableDriver for WebDriverSession {
    async fn load(&mut self, url: &Url) -> Result<(), DriverError> {
        call(
            &self.client,
            Method::POST,
            &format!("{}/url", self.base),
            Some(json!({ "url": url.as_str() })),
        )
        .await?;
        Ok(())
    }

    async fn snapshot(&mut self) -> Result<TableSnapshot, DriverError> {
        let value = self.execute(SNAPSHOT_SCRIPT, json!([])).await?;
        parse_snapshot(value)
    }

    async fn invoke(&mut self, control: Control) -> Result<(), DriverError> {
        let (script, arg, name) = match control {
            Control::PageSize(size) => (PAGE_SIZE_SCRIPT, json!(size.to_string()), "page size option"),
            Control::PageItem(idx) => (PAGE_ITEM_SCRIPT, json!(idx), "page item"),
        };
        match self.execute(script, json!([arg])).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(DriverError::MissingControl(name)),
        }
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        call(&self.client, Method::DELETE, &self.base, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_payload_maps_onto_table_snapshot() {
        let snapshot = parse_snapshot(json!({
            "table": "<table><tbody><tr><td>1</td></tr></tbody></table>",
            "index": "3",
            "items": ["page-item", "page-item active", "page-item disabled"],
            "pageSize": true
        }))
        .unwrap();
        assert_eq!(snapshot.page_index, "3");
        assert!(snapshot.page_size_control);
        assert_eq!(
            snapshot.page_items,
            vec![
                PageItem::default(),
                PageItem {
                    active: true,
                    disabled: false
                },
                PageItem {
                    active: false,
                    disabled: true
                },
            ]
        );
    }

    #[test]
    fn missing_fields_default_to_an_empty_page() {
        let snapshot = parse_snapshot(json!({})).unwrap();
        assert_eq!(snapshot, TableSnapshot::default());
        assert!(matches!(
            parse_snapshot(json!("not an object")),
            Err(DriverError::Protocol(_))
        ));
    }

    #[test]
    fn capabilities_carry_browser_flags() {
        let caps = BrowserOptions {
            headless: true,
            profile_dir: Some(PathBuf::from("/tmp/profile")),
        }
        .capabilities();
        let matched = &caps["capabilities"]["alwaysMatch"];
        assert_eq!(matched["pageLoadStrategy"], "eager");
        let args: Vec<&str> = matched["goog:chromeOptions"]["args"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(args.contains(&"--headless=new"));
        assert!(args.contains(&"--user-data-dir=/tmp/profile"));
        assert_eq!(
            matched["goog:chromeOptions"]["prefs"]["profile.managed_default_content_settings.images"],
            2
        );

        let windowed = BrowserOptions::default().capabilities();
        assert!(!windowed.to_string().contains("headless"));
    }
}

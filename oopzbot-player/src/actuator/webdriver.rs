//! W3C WebDriver backend
//!
//! Drives a browser through its WebDriver server (chromedriver,
//! msedgedriver, ...). The player page exposes the RTC client as global
//! functions (`rtcJoin`, `rtcPlay`, ...); every transport operation is one
//! `execute/async` call of `window[method](...args)`.

use super::{ActuatorBackend, AgentState, RoomCredentials};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

/// Calls `window[method](...args)` and reports the (possibly async) outcome
const INVOKE_SCRIPT: &str = r#"
const done = arguments[arguments.length - 1];
const method = arguments[0];
const args = arguments[1] || [];
if (typeof window[method] !== 'function') {
  done({ ok: false, missing: true, error: 'missing function ' + method });
  return;
}
Promise.resolve()
  .then(() => window[method](...args))
  .then(
    (value) => done({ ok: true, value: value === undefined ? null : value }),
    (err) => done({ ok: false, error: String(err) })
  );
"#;

const READY_SCRIPT: &str = "return typeof window.rtcPlay === 'function';";

const DEFAULT_BROWSER_ARGS: &[&str] = &[
    "--headless=new",
    "--autoplay-policy=no-user-gesture-required",
    "--use-fake-ui-for-media-stream",
    "--no-sandbox",
];

pub struct WebDriverBackend {
    name: String,
    endpoint: String,
    browser: String,
    args: Vec<String>,
    page_url: String,
    script_timeout: Duration,
    http_client: reqwest::Client,
    session_id: Option<String>,
}

impl WebDriverBackend {
    pub fn new(config: &BackendConfig, page_url: &str, op_timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(op_timeout + Duration::from_secs(5))
            .build()?;

        Ok(Self {
            name: config.name.clone(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            browser: config.browser.clone(),
            args: config.args.clone(),
            page_url: page_url.to_string(),
            script_timeout: op_timeout,
            http_client,
            session_id: None,
        })
    }

    fn capabilities(&self) -> Value {
        let mut args: Vec<String> = DEFAULT_BROWSER_ARGS.iter().map(|a| a.to_string()).collect();
        args.extend(self.args.iter().cloned());

        let options_key = if self.browser.to_ascii_lowercase().contains("edge") {
            "ms:edgeOptions"
        } else {
            "goog:chromeOptions"
        };

        let mut always_match = json!({ "browserName": self.browser });
        always_match[options_key] = json!({ "args": args });
        json!({ "capabilities": { "alwaysMatch": always_match } })
    }

    fn session(&self) -> Result<&str> {
        self.session_id
            .as_deref()
            .ok_or_else(|| Error::ActuatorUnavailable(format!("{}: no browser session", self.name)))
    }

    /// POST a WebDriver command and return its `value`
    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let url = format!("{}{}", self.endpoint, path);
        let response = self.http_client.post(&url).json(&body).send().await?;
        let status = response.status();
        let payload: Value = response.json().await?;
        let value = payload.get("value").cloned().unwrap_or(Value::Null);

        if !status.is_success() {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| value.get("error").and_then(Value::as_str))
                .unwrap_or("unknown error");
            return Err(Error::ActuatorUnavailable(format!(
                "{}: webdriver {} ({})",
                self.name, message, status
            )));
        }
        Ok(value)
    }

    /// Invoke a page function through `execute/async`.
    ///
    /// The inner error is the page's own rejection; transport failures and
    /// a page without the function are agent failures.
    async fn invoke(&self, method: &str, args: Value) -> Result<std::result::Result<Value, String>> {
        let session = self.session()?;
        debug!(backend = %self.name, method, "Invoking page function");

        let outcome = self
            .post(
                &format!("/session/{}/execute/async", session),
                json!({ "script": INVOKE_SCRIPT, "args": [method, args] }),
            )
            .await?;

        if outcome.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(Ok(outcome.get("value").cloned().unwrap_or(Value::Null)));
        }
        let error = outcome
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("page call failed")
            .to_string();
        if outcome.get("missing").and_then(Value::as_bool) == Some(true) {
            return Err(Error::ActuatorUnavailable(format!("{}: {}", self.name, error)));
        }
        Ok(Err(error))
    }

    async fn call(&self, method: &str, args: Value) -> Result<Value> {
        self.invoke(method, args).await?.map_err(|error| {
            Error::ActuatorUnavailable(format!("{}: {}: {}", self.name, method, error))
        })
    }

    async fn wait_until_ready(&self) -> Result<()> {
        let session = self.session()?.to_string();
        // Bounded by the bridge's init timeout
        loop {
            let ready = self
                .post(
                    &format!("/session/{}/execute/sync", session),
                    json!({ "script": READY_SCRIPT, "args": [] }),
                )
                .await?;
            if ready.as_bool() == Some(true) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

#[async_trait]
impl ActuatorBackend for WebDriverBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self) -> Result<()> {
        if self.session_id.is_some() {
            self.shutdown().await;
        }

        let created = self.post("/session", self.capabilities()).await?;
        let session_id = created
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::ActuatorUnavailable(format!("{}: session response without id", self.name))
            })?
            .to_string();
        self.session_id = Some(session_id.clone());

        self.post(
            &format!("/session/{}/timeouts", session_id),
            json!({ "script": self.script_timeout.as_millis() as u64 }),
        )
        .await?;
        self.post(
            &format!("/session/{}/url", session_id),
            json!({ "url": self.page_url }),
        )
        .await?;
        self.wait_until_ready().await?;

        info!(backend = %self.name, browser = %self.browser, "Browser agent ready");
        Ok(())
    }

    async fn join(&mut self, room: &RoomCredentials) -> Result<()> {
        self.call(
            "rtcJoin",
            json!([room.app_id, room.channel, room.uid, room.token]),
        )
        .await?;
        Ok(())
    }

    async fn leave(&mut self) -> Result<()> {
        self.call("rtcLeave", json!([])).await?;
        Ok(())
    }

    async fn start(&mut self, stream_ref: &str, offset: f64) -> Result<()> {
        // The page rejects streams it cannot load (expired signed URLs)
        self.invoke("rtcPlay", json!([stream_ref, offset]))
            .await?
            .map(|_| ())
            .map_err(|reason| Error::StreamRejected {
                stream: stream_ref.to_string(),
                reason,
            })
    }

    async fn pause(&mut self) -> Result<()> {
        self.call("rtcPause", json!([])).await?;
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        self.call("rtcResume", json!([])).await?;
        Ok(())
    }

    async fn seek(&mut self, offset: f64) -> Result<()> {
        self.call("rtcSeek", json!([offset])).await?;
        Ok(())
    }

    async fn set_volume(&mut self, level: u8) -> Result<()> {
        self.call("rtcSetVolume", json!([level])).await?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.call("rtcStop", json!([])).await?;
        Ok(())
    }

    async fn heartbeat(&mut self) -> Result<AgentState> {
        let state = self.call("rtcState", json!([])).await?;
        Ok(serde_json::from_value(state).unwrap_or_default())
    }

    async fn shutdown(&mut self) {
        let Some(session_id) = self.session_id.take() else {
            return;
        };
        let url = format!("{}/session/{}", self.endpoint, session_id);
        if let Err(e) = self.http_client.delete(&url).send().await {
            debug!(backend = %self.name, error = %e, "Failed to close browser session");
        }
    }
}

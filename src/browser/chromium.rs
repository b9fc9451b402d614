// Chromium backend driven over the DevTools protocol

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::{BrowserError, BrowserSession, WaitCondition};
use crate::config::BrowserSettings;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The single browser process of a run. Each portal client gets its own tab.
pub struct ChromiumBrowser {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl ChromiumBrowser {
    pub async fn launch(settings: &BrowserSettings) -> Result<Self, BrowserError> {
        let mut builder = BrowserConfig::builder()
            .request_timeout(settings.timeouts().navigation)
            .launch_timeout(Duration::from_secs(20))
            .args(vec![
                "--disable-background-networking",
                "--disable-default-apps",
                "--disable-dev-shm-usage",
                "--disable-extensions",
                "--disable-popup-blocking",
                "--no-first-run",
                "--no-default-browser-check",
                "--password-store=basic",
            ]);

        if !settings.headless {
            builder = builder.with_head();
        }
        if settings.no_sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(executable) = &settings.executable {
            builder = builder.chrome_executable(executable.clone());
        }

        let config = builder.build().map_err(BrowserError::Launch)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP handler event error: {}", e);
                }
            }
        });

        info!(headless = settings.headless, "Chromium launched");
        Ok(Self { browser, handler })
    }

    pub async fn open_session(&self) -> Result<ChromiumSession, BrowserError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::Protocol(e.to_string()))?;
        Ok(ChromiumSession { page })
    }

    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Failed to close browser cleanly: {}", e);
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
    }
}

pub struct ChromiumSession {
    page: Page,
}

#[derive(Deserialize)]
struct Wrapped<T> {
    v: T,
}

/// JSON string literal for embedding a selector or value in a script
fn js_str(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

impl ChromiumSession {
    /// Evaluate `body` (a function body ending in `return ...`) and decode its result
    async fn eval<T: DeserializeOwned>(&self, body: &str) -> Result<T, BrowserError> {
        let script = format!(
            "JSON.stringify({{ v: (() => {{ {} }})() ?? null }})",
            body
        );
        let raw: String = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| BrowserError::Protocol(e.to_string()))?
            .into_value()
            .map_err(|e| BrowserError::Protocol(e.to_string()))?;
        let wrapped: Wrapped<T> =
            serde_json::from_str(&raw).map_err(|e| BrowserError::Protocol(e.to_string()))?;
        Ok(wrapped.v)
    }

    async fn condition_met(&mut self, condition: &WaitCondition) -> Result<bool, BrowserError> {
        match condition {
            WaitCondition::Visible(selector) => self.is_visible(selector).await,
            WaitCondition::Hidden(selector) => Ok(!self.is_visible(selector).await?),
            WaitCondition::UrlContains(fragment) => {
                Ok(self.current_url().await?.contains(fragment.as_str()))
            }
        }
    }

    async fn element(
        &self,
        selector: &str,
    ) -> Result<chromiumoxide::element::Element, BrowserError> {
        self.page
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::ElementNotFound {
                selector: selector.to_string(),
            })
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        debug!(url, "navigate");
        self.page
            .goto(url)
            .await
            .map_err(|e| BrowserError::Navigation {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn current_url(&mut self) -> Result<String, BrowserError> {
        let url = self
            .page
            .url()
            .await
            .map_err(|e| BrowserError::Protocol(e.to_string()))?;
        Ok(url.unwrap_or_default())
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), BrowserError> {
        let cleared: bool = self
            .eval(&format!(
                "const el = document.querySelector({}); if (!el) return false; \
                 el.focus(); el.value = ''; return true;",
                js_str(selector)
            ))
            .await?;
        if !cleared {
            return Err(BrowserError::ElementNotFound {
                selector: selector.to_string(),
            });
        }
        let element = self.element(selector).await?;
        element
            .type_str(value)
            .await
            .map_err(|e| BrowserError::Protocol(e.to_string()))?;
        let _: bool = self
            .eval(&format!(
                "const el = document.querySelector({}); if (!el) return false; \
                 el.dispatchEvent(new Event('change', {{ bubbles: true }})); return true;",
                js_str(selector)
            ))
            .await?;
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
        let element = self.element(selector).await?;
        element
            .click()
            .await
            .map_err(|e| BrowserError::Protocol(e.to_string()))?;
        Ok(())
    }

    async fn press_key(&mut self, selector: &str, key: &str) -> Result<(), BrowserError> {
        let element = self.element(selector).await?;
        element
            .press_key(key)
            .await
            .map_err(|e| BrowserError::Protocol(e.to_string()))?;
        Ok(())
    }

    async fn select_option(
        &mut self,
        selector: &str,
        needle: &str,
    ) -> Result<bool, BrowserError> {
        self.eval(&format!(
            "const el = document.querySelector({}); if (!el) return false; \
             const needle = {}.toLowerCase(); \
             const opt = Array.from(el.options || []).find(o => o.text.toLowerCase().includes(needle)); \
             if (!opt) return false; \
             el.value = opt.value; \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); \
             return true;",
            js_str(selector),
            js_str(needle)
        ))
        .await
    }

    async fn wait_for(
        &mut self,
        condition: &WaitCondition,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.condition_met(condition).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout {
                    condition: condition.to_string(),
                    waited: timeout,
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn is_visible(&mut self, selector: &str) -> Result<bool, BrowserError> {
        self.eval(&format!(
            "return Array.from(document.querySelectorAll({})).some(el => {{ \
               const style = window.getComputedStyle(el); \
               const rect = el.getBoundingClientRect(); \
               return style.visibility !== 'hidden' && style.display !== 'none' \
                 && (rect.width > 0 || rect.height > 0); \
             }});",
            js_str(selector)
        ))
        .await
    }

    async fn read_text(&mut self, selector: &str) -> Result<Option<String>, BrowserError> {
        self.eval(&format!(
            "const el = document.querySelector({}); return el ? el.innerText.trim() : null;",
            js_str(selector)
        ))
        .await
    }

    async fn read_value(&mut self, selector: &str) -> Result<Option<String>, BrowserError> {
        self.eval(&format!(
            "const el = document.querySelector({}); \
             if (!el) return null; \
             if (el.tagName === 'SELECT') {{ const o = el.options[el.selectedIndex]; return o ? o.text.trim() : ''; }} \
             return (el.value ?? '').trim();",
            js_str(selector)
        ))
        .await
    }

    async fn read_attribute(
        &mut self,
        selector: &str,
        attribute: &str,
    ) -> Result<Option<String>, BrowserError> {
        self.eval(&format!(
            "const el = document.querySelector({}); return el ? el.getAttribute({}) : null;",
            js_str(selector),
            js_str(attribute)
        ))
        .await
    }

    async fn read_rows(
        &mut self,
        row_selector: &str,
        cell_selectors: &[&str],
    ) -> Result<Vec<Vec<String>>, BrowserError> {
        let cells = serde_json::to_string(cell_selectors)
            .map_err(|e| BrowserError::Protocol(e.to_string()))?;
        self.eval(&format!(
            "const cells = {}; \
             return Array.from(document.querySelectorAll({})).map(row => \
               cells.map(sel => {{ const c = row.querySelector(sel); return c ? c.innerText.trim() : ''; }}));",
            cells,
            js_str(row_selector)
        ))
        .await
    }
}

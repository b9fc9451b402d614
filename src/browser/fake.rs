//! In-memory browser used to exercise portal clients without Chromium.
//!
//! A [`FakeDom`] is a flat map from selector to element plus a set of tables.
//! Site behaviour (what a click or a navigation does) lives in a [`SiteScript`].
//! Waits never sleep: a condition that does not already hold times out at once.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use super::{BrowserError, BrowserSession, WaitCondition};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeElement {
    pub text: String,
    pub value: String,
    pub visible: bool,
    pub attributes: HashMap<String, String>,
    pub options: Vec<String>,
}

impl FakeElement {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            visible: true,
            ..Default::default()
        }
    }

    pub fn input(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            visible: true,
            ..Default::default()
        }
    }

    pub fn select(options: &[&str], selected: &str) -> Self {
        Self {
            value: selected.to_string(),
            visible: true,
            options: options.iter().map(|o| o.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn hidden() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }
}

pub type FakeRow = HashMap<String, String>;

#[derive(Debug, Default)]
pub struct FakeDom {
    pub url: String,
    pub elements: HashMap<String, FakeElement>,
    pub tables: HashMap<String, Vec<FakeRow>>,
}

impl FakeDom {
    pub fn set(&mut self, selector: &str, element: FakeElement) {
        self.elements.insert(selector.to_string(), element);
    }

    pub fn remove(&mut self, selector: &str) -> Option<FakeElement> {
        self.elements.remove(selector)
    }

    pub fn value(&self, selector: &str) -> Option<&str> {
        self.elements.get(selector).map(|e| e.value.as_str())
    }

    pub fn set_rows(&mut self, row_selector: &str, rows: Vec<FakeRow>) {
        self.tables.insert(row_selector.to_string(), rows);
    }

    pub fn is_visible(&self, selector: &str) -> bool {
        selector.split(',').map(str::trim).any(|s| {
            self.elements.get(s).map(|e| e.visible).unwrap_or(false)
        })
    }

    fn clear_page(&mut self) {
        self.elements.clear();
        self.tables.clear();
    }
}

/// Build a table row from `(cell selector, text)` pairs
pub fn row(cells: &[(&str, &str)]) -> FakeRow {
    cells
        .iter()
        .map(|(selector, text)| (selector.to_string(), text.to_string()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserAction {
    Navigate(String),
    Fill { selector: String, value: String },
    Click(String),
    Key { selector: String, key: String },
    Select { selector: String, option: String },
}

/// Behaviour of the simulated site. Every hook defaults to doing nothing.
pub trait SiteScript: Send {
    fn on_navigate(&mut self, _dom: &mut FakeDom, _url: &str) -> Result<(), BrowserError> {
        Ok(())
    }

    fn on_fill(&mut self, _dom: &mut FakeDom, _selector: &str, _value: &str) {}

    fn on_click(&mut self, _dom: &mut FakeDom, _selector: &str) -> Result<(), BrowserError> {
        Ok(())
    }

    fn on_key(&mut self, _dom: &mut FakeDom, _selector: &str, _key: &str) {}

    /// One polling tick of a wait whose condition is not met yet. Lets a
    /// script model a page that keeps changing after an action.
    fn on_wait(&mut self, _dom: &mut FakeDom) {}
}

/// Polls a wait makes before it reports a timeout
pub const WAIT_TICKS: u32 = 5;

/// A site with no behaviour: the page is whatever the test puts in the DOM
pub struct StaticSite;

impl SiteScript for StaticSite {}

pub struct FakeBrowser<S> {
    dom: FakeDom,
    site: S,
    actions: Vec<BrowserAction>,
    failing_navigations: u32,
}

impl<S: SiteScript> FakeBrowser<S> {
    pub fn new(site: S) -> Self {
        Self {
            dom: FakeDom::default(),
            site,
            actions: Vec::new(),
            failing_navigations: 0,
        }
    }

    pub fn dom(&self) -> &FakeDom {
        &self.dom
    }

    pub fn dom_mut(&mut self) -> &mut FakeDom {
        &mut self.dom
    }

    pub fn site(&self) -> &S {
        &self.site
    }

    pub fn site_mut(&mut self) -> &mut S {
        &mut self.site
    }

    pub fn actions(&self) -> &[BrowserAction] {
        &self.actions
    }

    /// Make the next `count` navigations fail as if the network dropped
    pub fn fail_next_navigations(&mut self, count: u32) {
        self.failing_navigations = count;
    }

    fn existing(&mut self, selector: &str) -> Result<&mut FakeElement, BrowserError> {
        self.dom
            .elements
            .get_mut(selector)
            .ok_or_else(|| BrowserError::ElementNotFound {
                selector: selector.to_string(),
            })
    }

    fn condition_met(&self, condition: &WaitCondition) -> bool {
        match condition {
            WaitCondition::Visible(selector) => self.dom.is_visible(selector),
            WaitCondition::Hidden(selector) => !self.dom.is_visible(selector),
            WaitCondition::UrlContains(fragment) => self.dom.url.contains(fragment.as_str()),
        }
    }
}

#[async_trait]
impl<S: SiteScript> BrowserSession for FakeBrowser<S> {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        self.actions.push(BrowserAction::Navigate(url.to_string()));
        if self.failing_navigations > 0 {
            self.failing_navigations -= 1;
            return Err(BrowserError::Navigation {
                url: url.to_string(),
                message: "net::ERR_CONNECTION_RESET".to_string(),
            });
        }
        self.dom.clear_page();
        self.dom.url = url.to_string();
        self.site.on_navigate(&mut self.dom, url)
    }

    async fn current_url(&mut self) -> Result<String, BrowserError> {
        Ok(self.dom.url.clone())
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), BrowserError> {
        self.existing(selector)?.value = value.to_string();
        self.actions.push(BrowserAction::Fill {
            selector: selector.to_string(),
            value: value.to_string(),
        });
        self.site.on_fill(&mut self.dom, selector, value);
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
        self.existing(selector)?;
        self.actions.push(BrowserAction::Click(selector.to_string()));
        self.site.on_click(&mut self.dom, selector)
    }

    async fn press_key(&mut self, selector: &str, key: &str) -> Result<(), BrowserError> {
        self.existing(selector)?;
        self.actions.push(BrowserAction::Key {
            selector: selector.to_string(),
            key: key.to_string(),
        });
        self.site.on_key(&mut self.dom, selector, key);
        Ok(())
    }

    async fn select_option(
        &mut self,
        selector: &str,
        needle: &str,
    ) -> Result<bool, BrowserError> {
        let needle = needle.to_lowercase();
        let element = self.existing(selector)?;
        let Some(option) = element
            .options
            .iter()
            .find(|o| o.to_lowercase().contains(&needle))
            .cloned()
        else {
            return Ok(false);
        };
        element.value = option.clone();
        self.actions.push(BrowserAction::Select {
            selector: selector.to_string(),
            option,
        });
        Ok(true)
    }

    async fn wait_for(
        &mut self,
        condition: &WaitCondition,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        let mut ticks = 0;
        while !self.condition_met(condition) {
            if ticks == WAIT_TICKS {
                return Err(BrowserError::Timeout {
                    condition: condition.to_string(),
                    waited: timeout,
                });
            }
            self.site.on_wait(&mut self.dom);
            ticks += 1;
        }
        Ok(())
    }

    async fn is_visible(&mut self, selector: &str) -> Result<bool, BrowserError> {
        Ok(self.dom.is_visible(selector))
    }

    async fn read_text(&mut self, selector: &str) -> Result<Option<String>, BrowserError> {
        Ok(self.dom.elements.get(selector).map(|e| e.text.clone()))
    }

    async fn read_value(&mut self, selector: &str) -> Result<Option<String>, BrowserError> {
        Ok(self.dom.elements.get(selector).map(|e| e.value.clone()))
    }

    async fn read_attribute(
        &mut self,
        selector: &str,
        attribute: &str,
    ) -> Result<Option<String>, BrowserError> {
        Ok(self
            .dom
            .elements
            .get(selector)
            .and_then(|e| e.attributes.get(attribute).cloned()))
    }

    async fn read_rows(
        &mut self,
        row_selector: &str,
        cell_selectors: &[&str],
    ) -> Result<Vec<Vec<String>>, BrowserError> {
        let rows = self
            .dom
            .tables
            .get(row_selector)
            .map(|rows| {
                rows.iter()
                    .map(|row| {
                        cell_selectors
                            .iter()
                            .map(|cell| row.get(*cell).cloned().unwrap_or_default())
                            .collect()
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LoginSite;

    impl SiteScript for LoginSite {
        fn on_navigate(&mut self, dom: &mut FakeDom, _url: &str) -> Result<(), BrowserError> {
            dom.set("#user", FakeElement::input(""));
            Ok(())
        }

        fn on_key(&mut self, dom: &mut FakeDom, _selector: &str, key: &str) {
            if key == "Enter" {
                dom.url = "https://portal.test/home".to_string();
                dom.set("#welcome", FakeElement::text("Hola"));
            }
        }
    }

    #[tokio::test]
    async fn test_scripted_site_reacts_to_actions() {
        let mut browser = FakeBrowser::new(LoginSite);
        browser.navigate("https://portal.test/login").await.unwrap();
        browser.fill("#user", "operator").await.unwrap();
        browser.press_key("#user", "Enter").await.unwrap();

        browser
            .wait_for(&WaitCondition::url_contains("home"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            browser.read_text("#welcome").await.unwrap(),
            Some("Hola".to_string())
        );
        assert_eq!(browser.actions().len(), 3);
    }

    #[tokio::test]
    async fn test_navigation_clears_the_page() {
        let mut browser = FakeBrowser::new(StaticSite);
        browser.dom_mut().set("#stale", FakeElement::text("old"));
        browser.navigate("https://portal.test/").await.unwrap();
        assert_eq!(browser.read_text("#stale").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unmet_wait_times_out_immediately() {
        let mut browser = FakeBrowser::new(StaticSite);
        let err = browser
            .wait_for(&WaitCondition::visible("#token"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BrowserError::Timeout { .. }));
    }

    /// Shows `#ready` after a few polls
    struct SlowSite {
        polls_left: u32,
    }

    impl SiteScript for SlowSite {
        fn on_wait(&mut self, dom: &mut FakeDom) {
            self.polls_left = self.polls_left.saturating_sub(1);
            if self.polls_left == 0 {
                dom.set("#ready", FakeElement::text("listo"));
            }
        }
    }

    #[tokio::test]
    async fn test_wait_polls_a_changing_page() {
        let mut browser = FakeBrowser::new(SlowSite { polls_left: 2 });
        browser
            .wait_for(&WaitCondition::visible("#ready"), Duration::from_secs(1))
            .await
            .unwrap();

        let mut browser = FakeBrowser::new(SlowSite {
            polls_left: WAIT_TICKS + 1,
        });
        assert!(browser
            .wait_for(&WaitCondition::visible("#ready"), Duration::from_secs(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_selector_groups_match_any_member() {
        let mut browser = FakeBrowser::new(StaticSite);
        browser.dom_mut().set(".alert-success", FakeElement::text("ok"));
        assert!(browser
            .is_visible(".alert-danger, .alert-success")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_select_option_matches_substring() {
        let mut browser = FakeBrowser::new(StaticSite);
        browser.dom_mut().set(
            "#doc",
            FakeElement::select(&["Seleccione", "Pasaporte", "RUT"], "Seleccione"),
        );
        assert!(browser.select_option("#doc", "pasap").await.unwrap());
        assert_eq!(browser.dom().value("#doc"), Some("Pasaporte"));
        assert!(!browser.select_option("#doc", "licencia").await.unwrap());
    }

    #[tokio::test]
    async fn test_failing_navigation_is_reported() {
        let mut browser = FakeBrowser::new(StaticSite);
        browser.fail_next_navigations(1);
        assert!(browser.navigate("https://portal.test/").await.is_err());
        assert!(browser.navigate("https://portal.test/").await.is_ok());
    }
}

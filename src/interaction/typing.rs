//! Text entry and key presses

use serde_json::json;
use tracing::{debug, instrument};

use super::input::{self, KeySpec};
use super::service::{InteractionEngine, Located};
use crate::dom::ElementHandle;
use crate::{Error, Result};

const CLEAR_VALUE_FN: &str = r#"function() {
    if ('value' in this) {
        this.value = '';
        this.dispatchEvent(new Event('input', { bubbles: true }));
    } else if (this.isContentEditable) {
        this.textContent = '';
    }
}"#;

const SET_VALUE_FN: &str = r#"function(text, append) {
    this.focus();
    if ('value' in this) {
        this.value = append ? this.value + text : text;
    } else if (this.isContentEditable) {
        this.textContent = append ? this.textContent + text : text;
    }
    this.dispatchEvent(new Event('input', { bubbles: true }));
    this.dispatchEvent(new Event('change', { bubbles: true }));
}"#;

impl InteractionEngine {
    /// Type `text` into an element, optionally clearing it first.
    ///
    /// Keys are sent one by one; if the input pipeline fails mid-way the
    /// remaining text is written through the element's value.
    #[instrument(skip(self, text), fields(backend = handle.backend_node_id, len = text.len()))]
    pub async fn type_text(&self, handle: &ElementHandle, text: &str, clear: bool) -> Result<()> {
        let (root, node) = self.resolve(handle, false).await?;
        let located = self.check_state(root, node).await?;
        let target = located.node.target_id.to_string();

        self.focus(&located).await?;
        if clear {
            self.call_on(&target, &located.object_id, CLEAR_VALUE_FN, vec![])
                .await?;
        }

        let settings = self.settings();
        for (typed, ch) in text.chars().enumerate() {
            let key = if ch == '\n' {
                KeySpec::parse("Enter").unwrap_or_else(|| KeySpec::for_char(ch))
            } else {
                KeySpec::for_char(ch)
            };

            if let Err(e) = input::press(self.manager(), &located.root, &key).await {
                if !e.is_transient() {
                    return Err(e);
                }
                let rest: String = text.chars().skip(typed).collect();
                debug!("Key dispatch failed ({}), writing {} chars directly", e, rest.chars().count());
                self.call_on(
                    &target,
                    &located.object_id,
                    SET_VALUE_FN,
                    vec![json!(rest), json!(true)],
                )
                .await?;
                return Ok(());
            }

            let delay = input::keystroke_delay(settings.typing_delay_ms, settings.humanize);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    /// Press a named key (`Enter`, `Escape`, `ArrowDown`, …) or a single
    /// character on the focused page
    #[instrument(skip(self))]
    pub async fn press_key(&self, key: &str) -> Result<()> {
        let spec = KeySpec::parse(key).ok_or_else(|| Error::internal(format!("Unknown key: {}", key)))?;
        let root = self.manager().require_focus()?;
        input::press(self.manager(), &root, &spec).await
    }

    async fn focus(&self, located: &Located) -> Result<()> {
        let target = located.node.target_id.to_string();
        match self
            .manager()
            .send_to_target(
                &target,
                "DOM.focus",
                json!({ "backendNodeId": located.node.backend_node_id }),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_transient() => {
                debug!("DOM.focus failed ({}), focusing from script", e);
                self.call_on(&target, &located.object_id, "function() { this.focus(); }", vec![])
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e),
        }
    }
}

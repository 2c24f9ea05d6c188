//! Classification and dispatch of URLs clicked inside a displayed message.

use url::Url;

use crate::inapp::collaborators::ActionHandler;
use crate::inapp::message::Message;

const INTERNAL_SCHEME: &str = "iterable";
const ACTION_SCHEME: &str = "action";
const ITBL_SCHEME: &str = "itbl";
const HTTPS_SCHEME: &str = "https";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternalAction {
    Delete,
    Dismiss,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickedUrl {
    /// `iterable://<action>`, handled by the engine.
    Internal(InternalAction),
    /// `action:<name>` or `itbl://<name>`, forwarded to the host.
    Custom(String),
    /// Anything else.
    Regular(Url),
}

impl ClickedUrl {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(
                    target: "inapp_engine::actions::parse",
                    "Ignoring unparsable clicked url {}: {}",
                    raw,
                    e
                );
                return None;
            }
        };

        // Taken from the serialized url: parsing drops control characters,
        // tabs and newlines that `raw` may still contain.
        let rest = url
            .as_str()
            .split_once(':')
            .map(|(_, rest)| rest)
            .unwrap_or_default();

        let clicked = match url.scheme() {
            INTERNAL_SCHEME => {
                let name = rest.trim_start_matches('/').trim_end_matches('/');
                ClickedUrl::Internal(match name {
                    "delete" => InternalAction::Delete,
                    "dismiss" => InternalAction::Dismiss,
                    other => InternalAction::Unknown(other.to_string()),
                })
            }
            ACTION_SCHEME => ClickedUrl::Custom(rest.to_string()),
            ITBL_SCHEME => ClickedUrl::Custom(rest.trim_start_matches("//").to_string()),
            _ => ClickedUrl::Regular(url.clone()),
        };
        Some(clicked)
    }
}

/// What the engine must do after a click has been dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickEffect {
    None,
    /// Remove the message, as if the user hit its delete button.
    Delete,
}

pub async fn dispatch_click(
    handler: &dyn ActionHandler,
    message: &Message,
    raw_url: &str,
    allowed_protocols: &[String],
) -> ClickEffect {
    let Some(clicked) = ClickedUrl::parse(raw_url) else {
        return ClickEffect::None;
    };

    match clicked {
        ClickedUrl::Internal(InternalAction::Delete) => ClickEffect::Delete,
        ClickedUrl::Internal(InternalAction::Dismiss) => ClickEffect::None,
        ClickedUrl::Internal(InternalAction::Unknown(name)) => {
            tracing::warn!(
                target: "inapp_engine::actions::dispatch_click",
                "Unknown internal action {} in message {}",
                name,
                message.id
            );
            ClickEffect::None
        }
        ClickedUrl::Custom(action) => {
            handler.handle_custom_action(&action, message).await;
            ClickEffect::None
        }
        ClickedUrl::Regular(url) => {
            let scheme = url.scheme();
            if scheme == HTTPS_SCHEME || allowed_protocols.iter().any(|p| p.eq_ignore_ascii_case(scheme)) {
                handler.open_url(url.as_str(), message).await;
            } else {
                tracing::warn!(
                    target: "inapp_engine::actions::dispatch_click",
                    "Refusing to open {}: protocol {} is not allowed",
                    url,
                    scheme
                );
            }
            ClickEffect::None
        }
    }
}

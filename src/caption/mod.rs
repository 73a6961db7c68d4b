//! Caption extraction: message body → Clean Caption.
//!
//! 1. `markup::html_to_text()`: visible text of an HTML body
//! 2. `CaptionRules::clean()`: drop greeting line, cut signature

pub mod markup;
pub mod rules;

pub use markup::html_to_text;
pub use rules::CaptionRules;

use crate::mailbox::MessageBody;

/// Derive the caption shared by every attachment of a message.
pub fn clean_caption(rules: &CaptionRules, body: &MessageBody) -> String {
    let text = match body {
        MessageBody::Text(text) => text.trim().to_string(),
        MessageBody::Html(html) => html_to_text(html),
    };
    rules.clean(&text)
}

//! Canonical subject line derived from a parsed message.

use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};

use crate::codec::ParsedMessage;

pub const DEFAULT_SUBJECT_PREFIX: &str = "{{field:MsgNo}}_{{field:handling}}";
pub const DEFAULT_SUBJECT_SUFFIX: &str = "_{{field:subject}}";

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{\{field:([^}]*)\}\}").expect("placeholder pattern");
    static ref META_TAG: Regex = Regex::new(r#"(?is)<meta\s+[^>]*>"#).expect("meta pattern");
    static ref META_NAME: Regex =
        Regex::new(r#"(?i)\bname\s*=\s*["']([^"']*)["']"#).expect("meta name pattern");
    static ref META_CONTENT: Regex =
        Regex::new(r#"(?i)\bcontent\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("meta content pattern");
}

/// Prefix and suffix templates declared by a form's `<meta>` tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectTemplate {
    pub prefix: String,
    pub suffix: String,
}

impl Default for SubjectTemplate {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
            suffix: DEFAULT_SUBJECT_SUFFIX.to_string(),
        }
    }
}

impl SubjectTemplate {
    /// Extract `subject-prefix` / `subject-suffix` meta tags from template HTML.
    pub fn from_html(html: &str) -> Self {
        let mut template = Self::default();
        for tag in META_TAG.find_iter(html) {
            let tag = tag.as_str();
            let Some(name) = META_NAME.captures(tag).map(|c| c[1].to_ascii_lowercase()) else {
                continue;
            };
            let Some(content) = META_CONTENT
                .captures(tag)
                .and_then(|c| c.get(1).or_else(|| c.get(2)))
                .map(|m| decode_entities(m.as_str()))
            else {
                continue;
            };
            match name.as_str() {
                "subject-prefix" => template.prefix = content,
                "subject-suffix" => template.suffix = content,
                _ => {}
            }
        }
        template
    }

    /// Read the template for `form_type` from the forms directory.
    ///
    /// A missing or unreadable template falls back to the defaults so a
    /// submission is never blocked on the subject line.
    pub fn load(forms_dir: &Path, form_type: &str) -> Self {
        let path = forms_dir.join(form_type);
        match std::fs::read_to_string(&path) {
            Ok(html) => Self::from_html(&html),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Form template unreadable, using default subject");
                Self::default()
            }
        }
    }
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Handling order reduced to its first character, `R` when unset.
pub fn normalized_handling(parsed: &ParsedMessage) -> String {
    parsed
        .field("handling")
        .and_then(|h| h.trim().chars().next())
        .map(|c| c.to_string())
        .unwrap_or_else(|| "R".to_string())
}

/// Compute the subject line for a message.
///
/// Depends only on the template and the field values; the result contains
/// only printable ASCII (0x20-0x7E), everything else becomes `~`.
pub fn subject_from_message(parsed: &ParsedMessage, template: &SubjectTemplate) -> String {
    let handling = normalized_handling(parsed);
    let pattern = format!("{}{}", template.prefix, template.suffix);
    let subject = PLACEHOLDER.replace_all(&pattern, |caps: &regex::Captures| {
        let name = &caps[1];
        if name == "handling" {
            handling.clone()
        } else {
            parsed.field(name).unwrap_or_default().to_string()
        }
    });
    let subject: String = subject
        .chars()
        .map(|c| if (' '..='~').contains(&c) { c } else { '~' })
        .collect();
    debug!(%subject, form_type = %parsed.form_type, "Derived subject");
    subject
}

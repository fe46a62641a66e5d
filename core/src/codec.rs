//! Codec for the host's line-oriented message text.
//!
//! A message looks like:
//!
//! ```text
//! !PACF!
//! #T: form-ics213.html
//! #V: 3.1
//! MsgNo: [6DM-150P]
//! 5.handling: [IMMEDIATE]
//! 10.subject: [Exit [stage left`]]
//! !/ADDON!
//! ```
//!
//! Field values sit between `[` and `]`; a literal `]` or backtick inside a
//! value is preceded by a backtick. Values may span several lines.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{FormError, FormResult};

/// Line that ends the message; anything after it is ignored.
pub const END_MARKER: &str = "!/ADDON!";

lazy_static! {
    static ref FIELD_LINE: Regex =
        Regex::new(r"^([^\[:]+):[^\[]*\[(.*)$").expect("field line pattern");
    static ref HEADER_LINE: Regex =
        Regex::new(r"^#\s*(T|FORMFILENAME|V|VERSION)\s*:\s*(.*?)\s*$").expect("header pattern");
}

/// Decoded form of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedMessage {
    /// File name of the form template that rendered the message
    pub form_type: String,
    /// Protocol version declared by the form, if any
    pub version: Option<String>,
    /// Addon named on the first `!` header line
    pub addon_name: Option<String>,
    /// Unescaped values keyed by short field name
    pub fields: BTreeMap<String, String>,
}

impl ParsedMessage {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Parse message text into its form type and fields.
///
/// Fails with a codec error when no `#T:`/`#FORMFILENAME:` line is present,
/// since nothing can be rendered without knowing the form.
pub fn parse_message(text: &str) -> FormResult<ParsedMessage> {
    let mut form_type: Option<String> = None;
    let mut version: Option<String> = None;
    let mut addon_name: Option<String> = None;
    let mut fields = BTreeMap::new();
    let mut open: Option<(String, String)> = None;

    for raw_line in text.split('\n') {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);

        if let Some((name, mut value)) = open.take() {
            value.push('\n');
            value.push_str(line);
            if value_is_complete(&value) {
                fields.insert(short_name(&name), finish_value(&value));
            } else {
                open = Some((name, value));
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix('!') {
            if line == END_MARKER {
                break;
            }
            if addon_name.is_none() {
                addon_name = rest
                    .split('!')
                    .next()
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string);
            }
            continue;
        }

        if line.starts_with('#') {
            if let Some(caps) = HEADER_LINE.captures(line) {
                let value = caps[2].to_string();
                if &caps[1] == "T" || &caps[1] == "FORMFILENAME" {
                    form_type.get_or_insert(value);
                } else {
                    version.get_or_insert(value);
                }
            }
            continue;
        }

        if let Some(caps) = FIELD_LINE.captures(line) {
            let name = caps[1].trim().to_string();
            let value = caps[2].to_string();
            if value_is_complete(&value) {
                fields.insert(short_name(&name), finish_value(&value));
            } else {
                open = Some((name, value));
            }
        }
    }

    // A value left open by truncated input is kept rather than dropped.
    if let Some((name, value)) = open {
        fields.insert(short_name(&name), finish_value(&value));
    }

    let form_type = form_type.ok_or_else(|| {
        FormError::codec("no form type: the message has no #T: or #FORMFILENAME: line")
    })?;

    Ok(ParsedMessage {
        form_type,
        version,
        addon_name,
        fields,
    })
}

/// A value is complete once it ends with an unescaped `]`.
fn value_is_complete(value: &str) -> bool {
    let value = value.trim_end();
    value.ends_with(']') && (!value.ends_with("`]") || value.ends_with("``]"))
}

fn finish_value(value: &str) -> String {
    let mut value = value.trim_end();
    if let Some(stripped) = value.strip_suffix(']') {
        value = stripped;
    }
    if !value.ends_with("`]]") {
        if let Some(stripped) = value.strip_suffix("]]") {
            value = stripped;
        }
    }
    unescape_value(value)
}

/// Portion of a dotted field id after its last `.`.
pub fn short_name(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((_, suffix)) if !suffix.is_empty() => suffix.to_string(),
        _ => name.to_string(),
    }
}

/// Precede every `]` and backtick with a backtick.
pub fn escape_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == ']' || c == '`' {
            escaped.push('`');
        }
        escaped.push(c);
    }
    escaped
}

/// Inverse of [`escape_value`].
pub fn unescape_value(value: &str) -> String {
    let mut unescaped = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '`' {
            if let Some(&next) = chars.peek() {
                if next == ']' || next == '`' {
                    unescaped.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        unescaped.push(c);
    }
    unescaped
}

/// `name: [escaped value]`
pub fn encode_field(name: &str, value: &str) -> String {
    format!("{}: [{}]", name, escape_value(value))
}

/// Everything needed to write a complete message in the host's format.
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    pub addon_name: String,
    pub form_type: String,
    pub version: Option<String>,
    pub fields: Vec<(String, String)>,
}

impl MessageDraft {
    pub fn encode(&self) -> String {
        let mut lines = Vec::with_capacity(self.fields.len() + 4);
        lines.push(format!("!{}!", self.addon_name));
        lines.push(format!("#T: {}", self.form_type));
        if let Some(version) = &self.version {
            lines.push(format!("#V: {}", version));
        }
        for (name, value) in &self.fields {
            lines.push(encode_field(name, value));
        }
        lines.push(END_MARKER.to_string());
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}

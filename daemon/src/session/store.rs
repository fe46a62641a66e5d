use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use formbridge_core::errors::{FormError, FormResult};
use serde::{Deserialize, Serialize};

/// Session identifier, unique for the daemon's process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Placeholder that keeps a fresh daemon from idling out before the
    /// host opens its first real session.
    pub const KEEPALIVE: SessionId = SessionId(0);

    pub fn is_keepalive(self) -> bool {
        self == Self::KEEPALIVE
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = FormError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(SessionId)
            .map_err(|_| FormError::not_found(format!("'{}' is not a session id", s)))
    }
}

/// Keys of the derived session environment.
pub mod env_keys {
    pub const ADDON_NAME: &str = "addon_name";
    pub const MESSAGE_STATUS: &str = "message_status";
    pub const MESSAGE_FILE: &str = "message_file";
    pub const MESSAGE_INDEX: &str = "message_index";
    pub const FORM_TYPE: &str = "form_type";
    pub const MODE: &str = "mode";

    pub const READONLY: &str = "readonly";
    pub const EDITABLE: &str = "editable";
}

use env_keys::*;

/// Split host arguments into ordered `(key, value)` pairs.
///
/// `--key value` yields a pair; a `--key` directly followed by another
/// `--key` (or by nothing) gets an empty value.
pub fn parse_arguments(args: &[String]) -> FormResult<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        let key = arg.strip_prefix("--").ok_or_else(|| {
            FormError::configuration(format!("unexpected argument '{}', expected --name", arg))
        })?;
        if key.is_empty() {
            return Err(FormError::configuration("empty argument name '--'"));
        }
        let value = match iter.peek() {
            Some(next) if !next.starts_with("--") => iter.next().cloned().unwrap_or_default(),
            _ => String::new(),
        };
        pairs.push((key.to_string(), value));
    }
    Ok(pairs)
}

/// Flags derived from a session's arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    /// Copy every argument, then derive the normalized keys.
    pub fn from_arguments(arguments: &[(String, String)]) -> FormResult<Self> {
        let mut map: BTreeMap<String, String> = arguments.iter().cloned().collect();

        let addon = map.get(ADDON_NAME).map(|v| v.trim().to_string());
        match addon {
            Some(addon) if !addon.is_empty() => {
                map.insert(ADDON_NAME.to_string(), addon);
            }
            _ => {
                return Err(FormError::configuration(
                    "missing required environment field: addon_name",
                ))
            }
        }

        if let Some(state) = map.get("MSG_STATE").cloned() {
            map.insert(MESSAGE_STATUS.to_string(), state.trim().to_lowercase());
        }
        if let Some(file) = map.get("MSG_FILENAME").cloned() {
            map.insert(MESSAGE_FILE.to_string(), file);
        }
        if let Some(index) = map.get("MSG_INDEX").cloned() {
            map.insert(MESSAGE_INDEX.to_string(), index);
        }
        if !map.contains_key(FORM_TYPE) {
            if let Some(filename) = map.get("filename").cloned() {
                map.insert(FORM_TYPE.to_string(), filename);
            }
        }
        if !map.contains_key(MODE) {
            let read_only = matches!(
                map.get(MESSAGE_STATUS).map(String::as_str),
                Some("read") | Some("unread") | Some("sent")
            );
            let mode = if read_only { READONLY } else { EDITABLE };
            map.insert(MODE.to_string(), mode.to_string());
        }

        Ok(Self(map))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn addon_name(&self) -> &str {
        self.get(ADDON_NAME).unwrap_or_default()
    }

    pub fn is_read_only(&self) -> bool {
        self.get(MODE) == Some(READONLY)
    }

    pub fn set_read_only(&mut self) {
        self.set(MODE, READONLY);
    }

    pub fn message_status(&self) -> Option<&str> {
        self.get(MESSAGE_STATUS)
    }

    pub fn message_file(&self) -> Option<PathBuf> {
        self.get(MESSAGE_FILE).map(PathBuf::from)
    }

    pub fn message_index(&self) -> Option<&str> {
        self.get(MESSAGE_INDEX)
    }

    pub fn form_type(&self) -> Option<&str> {
        self.get(FORM_TYPE)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    DeliveryEndpoint,
    CliUtility,
}

impl Display for ResponseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseSource::DeliveryEndpoint => f.write_str("delivery endpoint"),
            ResponseSource::CliUtility => f.write_str("CLI utility"),
        }
    }
}

/// What the host said about the last submission attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResponse {
    pub source: ResponseSource,
    /// HTTP status, in-body return code, or utility exit code
    pub status: Option<i64>,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// One open form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormSession {
    pub id: SessionId,
    pub raw_arguments: Vec<(String, String)>,
    pub environment: Environment,
    pub message: Option<String>,
    /// Time since the last client request referencing this session
    pub idle: Duration,
    pub from_host_response: Option<HostResponse>,
    pub created_at: DateTime<Utc>,
}

impl FormSession {
    pub fn new(
        id: SessionId,
        raw_arguments: Vec<(String, String)>,
        environment: Environment,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            raw_arguments,
            environment,
            message: None,
            idle: Duration::ZERO,
            from_host_response: None,
            created_at,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.environment.is_read_only()
    }

    /// Reset the idle counter after client contact.
    pub fn touch(&mut self) {
        self.idle = Duration::ZERO;
    }
}

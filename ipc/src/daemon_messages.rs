use serde::{Deserialize, Serialize};

/// Header set on error responses so clients can tell error causes apart
/// without parsing the diagnostic page.
pub const ERROR_HEADER: &str = "x-formbridge-error";

/// `ERROR_HEADER` value when `/open` names an addon this daemon does not serve.
pub const UNKNOWN_ADDON: &str = "unknown-addon";

/// Session id that only keeps a freshly started daemon alive.
pub const KEEPALIVE_SESSION: &str = "0";

/// Body of `POST /open`: the host's arguments, in the order received.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub args: Vec<String>,
}

/// Route paths shared by the daemon router and its clients.
pub mod routes {
    pub const OPEN: &str = "/open";
    pub const STOP: &str = "/stop";
    pub const MANUAL: &str = "/manual";
    pub const MANUAL_CREATE: &str = "/manual/create";

    pub fn form(id: &str) -> String {
        format!("/form/{}", id)
    }

    pub fn message(id: &str) -> String {
        format!("/message/{}", id)
    }

    pub fn save(id: &str) -> String {
        format!("/save/{}", id)
    }

    pub fn email(id: &str) -> String {
        format!("/email/{}", id)
    }

    pub fn submit(id: &str) -> String {
        format!("/submit/{}", id)
    }

    pub fn close(id: &str) -> String {
        format!("/close/{}", id)
    }

    pub fn ping(id: &str) -> String {
        format!("/ping/{}", id)
    }
}

/// Base URL of a daemon listening on loopback.
pub fn daemon_url(port: u16) -> String {
    format!("http://127.0.0.1:{}", port)
}

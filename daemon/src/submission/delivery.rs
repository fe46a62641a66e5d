use std::str::FromStr;

use formbridge_core::errors::{ErrorKind, FormError, FormResult};
use formbridge_core::settings::DeliverySettings;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use tracing::{debug, warn};
use url::form_urlencoded::byte_serialize;

use crate::session::{HostResponse, ResponseSource};

/// Page returned by hosts that predate the delivery endpoint.
pub const LEGACY_SUCCESS_PHRASE: &str = "Your form submission was successful!";

/// Encoded end-of-message token; always the last parameter of a request.
pub const EOF_TOKEN: &str = "%23EOF";
const ESCAPED_EOF_TOKEN: &str = "%23%45OF";

lazy_static! {
    static ref RETURN_CODE: Regex =
        Regex::new(r"(?m)^\s*ReturnCode\s*[:=]\s*(-?\d+)").expect("return code pattern");
}

/// Form-encode the request parameters and append `eom=%23EOF`.
///
/// An end-of-message token inside the message would cut it short on the
/// host side, so any occurrence in the encoded `msg` value gets its `E`
/// percent-encoded.
pub fn encode_body(pairs: &[(&str, String)]) -> String {
    let mut parts: Vec<String> = pairs
        .iter()
        .map(|(name, value)| {
            let mut encoded: String = byte_serialize(value.as_bytes()).collect();
            if *name == "msg" {
                encoded = encoded.replace(EOF_TOKEN, ESCAPED_EOF_TOKEN);
            }
            format!("{}={}", name, encoded)
        })
        .collect();
    parts.push(format!("eom={}", EOF_TOKEN));
    parts.join("&")
}

/// How the host answered a delivery request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostVerdict {
    Accepted,
    Rejected,
    /// Host too old for the endpoint; retry through the CLI utility
    Legacy,
}

/// In-body `ReturnCode: N` marker, if present.
pub fn return_code(body: &str) -> Option<i64> {
    RETURN_CODE
        .captures(body)
        .and_then(|caps| i64::from_str(&caps[1]).ok())
}

pub fn interpret(response: &HostResponse) -> HostVerdict {
    if response.body.contains(LEGACY_SUCCESS_PHRASE) {
        return HostVerdict::Legacy;
    }
    let accepted = match return_code(&response.body) {
        Some(code) => code == 0,
        None => response
            .status
            .map(|status| (200..300).contains(&status))
            .unwrap_or(false),
    };
    if accepted {
        HostVerdict::Accepted
    } else {
        HostVerdict::Rejected
    }
}

/// HTTP client for the host's delivery endpoint.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: Client,
}

impl DeliveryClient {
    pub fn new() -> FormResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| FormError::internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Send an encoded body and capture the host's answer verbatim.
    pub async fn send(&self, settings: &DeliverySettings, body: String) -> FormResult<HostResponse> {
        let url = settings.url();
        let method = Method::from_bytes(settings.method.to_uppercase().as_bytes()).map_err(|_| {
            FormError::configuration(format!("invalid delivery method '{}'", settings.method))
        })?;
        debug!(%url, %method, bytes = body.len(), "Sending message to delivery endpoint");

        let response = self
            .client
            .request(method, &url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .timeout(settings.timeout())
            .send()
            .await
            .map_err(|e| transport_error(e, settings))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(e, settings))?;

        Ok(HostResponse {
            source: ResponseSource::DeliveryEndpoint,
            status: Some(i64::from(status)),
            headers,
            body,
        })
    }
}

fn transport_error(e: reqwest::Error, settings: &DeliverySettings) -> FormError {
    let url = settings.url();
    if e.is_timeout() {
        warn!(%url, error = %e, "Delivery endpoint timed out");
        FormError::new(
            ErrorKind::TransportTimeout,
            format!("host not responding within {} seconds", settings.timeout_secs),
        )
        .with_context("url", url)
    } else if e.is_connect() {
        warn!(%url, error = %e, "Delivery endpoint refused connection");
        FormError::new(ErrorKind::TransportRefused, "delivery endpoint is not running")
            .with_context("url", url)
    } else {
        warn!(%url, error = %e, "Delivery request failed");
        FormError::new(
            ErrorKind::TransportRefused,
            format!("delivery request failed: {}", e),
        )
        .with_context("url", url)
    }
}

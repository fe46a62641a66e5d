//! Delivery of finished messages to the host.
//!
//! A submission is first prepared from the session and the message text,
//! then posted to the host's delivery endpoint. Hosts too old to accept the
//! post answer with a fixed success page; for those the message is handed to
//! the host's command-line utility instead.

pub mod cli_fallback;
pub mod delivery;

use std::fmt;
use std::path::{Path, PathBuf};

use formbridge_core::codec::parse_message;
use formbridge_core::errors::FormResult;
use formbridge_core::settings::Settings;
use formbridge_core::subject::{normalized_handling, subject_from_message, SubjectTemplate};
use tracing::info;

use crate::session::{FormSession, HostResponse, SessionId};
use delivery::{DeliveryClient, HostVerdict};

/// Everything needed to hand one message to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub session: SessionId,
    pub addon_name: String,
    /// Update index when the message replaces an earlier one
    pub message_index: Option<String>,
    pub subject: String,
    pub urgent: bool,
    /// Message text with CRLF line breaks
    pub message: String,
}

impl Submission {
    /// Derive the subject and urgency from the message and normalize its
    /// line breaks.
    pub fn prepare(session: &FormSession, message: &str, forms_dir: &Path) -> FormResult<Self> {
        let parsed = parse_message(message)?;
        let template = SubjectTemplate::load(forms_dir, &parsed.form_type);
        let subject = subject_from_message(&parsed, &template);
        let urgent = normalized_handling(&parsed) == "I";

        Ok(Self {
            session: session.id,
            addon_name: session.environment.addon_name().to_string(),
            message_index: session.environment.message_index().map(str::to_string),
            subject,
            urgent,
            message: to_crlf(message),
        })
    }

    /// Request parameters in the order the host expects them.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("adn", self.addon_name.clone())];
        if let Some(index) = &self.message_index {
            pairs.push(("upd", index.clone()));
        }
        if !self.subject.is_empty() {
            pairs.push(("sub", self.subject.clone()));
        }
        pairs.push(("urg", if self.urgent { "TRUE" } else { "FALSE" }.to_string()));
        pairs.push(("msg", self.message.clone()));
        pairs
    }
}

fn to_crlf(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\n', "\r\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    Endpoint,
    CliFallback,
}

impl fmt::Display for DeliveryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryPath::Endpoint => f.write_str("delivery endpoint"),
            DeliveryPath::CliFallback => f.write_str("CLI fallback utility"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Delivered {
        path: DeliveryPath,
        response: HostResponse,
    },
    /// The host answered and refused the message
    Rejected { response: HostResponse },
}

/// Sends prepared submissions to the host.
#[derive(Debug, Clone)]
pub struct SubmissionAdapter {
    client: DeliveryClient,
    temp_dir: PathBuf,
}

impl SubmissionAdapter {
    pub fn new(temp_dir: impl Into<PathBuf>) -> FormResult<Self> {
        Ok(Self {
            client: DeliveryClient::new()?,
            temp_dir: temp_dir.into(),
        })
    }

    pub async fn submit(
        &self,
        submission: &Submission,
        settings: &Settings,
    ) -> FormResult<SubmissionOutcome> {
        let body = delivery::encode_body(&submission.pairs());
        let response = self.client.send(&settings.delivery, body).await?;

        match delivery::interpret(&response) {
            HostVerdict::Accepted => {
                info!(session = %submission.session, "Host accepted message");
                Ok(SubmissionOutcome::Delivered {
                    path: DeliveryPath::Endpoint,
                    response,
                })
            }
            HostVerdict::Rejected => {
                info!(session = %submission.session, status = ?response.status, "Host rejected message");
                Ok(SubmissionOutcome::Rejected { response })
            }
            HostVerdict::Legacy => {
                info!(session = %submission.session, "Legacy host, using CLI fallback utility");
                cli_fallback::run(&settings.cli_fallback, &self.temp_dir, submission).await
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::stub_endpoint;
    use super::*;
    use crate::session::Environment;
    use axum::http::StatusCode;
    use chrono::Utc;
    use formbridge_core::ErrorKind;
    use tokio::test;

    const MESSAGE: &str = "!PacFORMS!\n#T: form-ics213.html\nMsgNo: [6DM-150P]\n5.handling: [IMMEDIATE]\n10.subject: [Water main]\n!/ADDON!\n";

    fn session(extra: &[(&str, &str)]) -> FormSession {
        let mut args = vec![("addon_name".to_string(), "PacFORMS".to_string())];
        args.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        let env = Environment::from_arguments(&args).unwrap();
        FormSession::new(SessionId(7), args, env, Utc::now())
    }

    fn settings(port: u16) -> Settings {
        let mut settings = Settings::default();
        settings.delivery.port = port;
        settings
    }

    #[test]
    async fn test_prepare_derives_subject_and_urgency() {
        let forms = tempfile::tempdir().unwrap();
        let submission =
            Submission::prepare(&session(&[("MSG_INDEX", "3")]), MESSAGE, forms.path()).unwrap();
        assert_eq!(submission.subject, "6DM-150P_I_Water main");
        assert!(submission.urgent);
        assert!(submission.message.contains("#T: form-ics213.html\r\nMsgNo"));
        assert!(!submission.message.contains("\r\r"));

        let keys: Vec<&str> = submission.pairs().iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["adn", "upd", "sub", "urg", "msg"]);
    }

    #[test]
    async fn test_prepare_without_index_omits_upd() {
        let forms = tempfile::tempdir().unwrap();
        let submission = Submission::prepare(&session(&[]), MESSAGE, forms.path()).unwrap();
        let keys: Vec<&str> = submission.pairs().iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["adn", "sub", "urg", "msg"]);
    }

    #[test]
    async fn test_prepare_rejects_message_without_form_type() {
        let forms = tempfile::tempdir().unwrap();
        let err = Submission::prepare(&session(&[]), "hello\nworld\n", forms.path()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Codec);
    }

    #[test]
    async fn test_accepted_by_endpoint() {
        let (port, received) = stub_endpoint(StatusCode::OK, "ReturnCode: 0\n").await;
        let forms = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let submission = Submission::prepare(&session(&[]), MESSAGE, forms.path()).unwrap();
        let adapter = SubmissionAdapter::new(temp.path()).unwrap();

        let outcome = adapter.submit(&submission, &settings(port)).await.unwrap();
        match outcome {
            SubmissionOutcome::Delivered { path, .. } => assert_eq!(path, DeliveryPath::Endpoint),
            other => panic!("unexpected outcome: {:?}", other),
        }
        let bodies = received.lock().unwrap().clone();
        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].starts_with("adn=PacFORMS&sub="));
        assert!(bodies[0].ends_with("&eom=%23EOF"));
    }

    #[test]
    async fn test_rejected_by_return_code() {
        let (port, _) = stub_endpoint(StatusCode::OK, "ReturnCode: 3\nbad form\n").await;
        let forms = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let submission = Submission::prepare(&session(&[]), MESSAGE, forms.path()).unwrap();
        let adapter = SubmissionAdapter::new(temp.path()).unwrap();

        match adapter.submit(&submission, &settings(port)).await.unwrap() {
            SubmissionOutcome::Rejected { response } => {
                assert_eq!(response.status, Some(200));
                assert!(response.body.contains("bad form"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    async fn test_legacy_phrase_uses_cli_fallback() {
        let (port, _) = stub_endpoint(
            StatusCode::OK,
            "<html>Your form submission was successful!</html>",
        )
        .await;
        let forms = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let submission = Submission::prepare(&session(&[]), MESSAGE, forms.path()).unwrap();
        let adapter = SubmissionAdapter::new(temp.path()).unwrap();

        // No utility configured, so reaching the fallback is a configuration error.
        let err = adapter.submit(&submission, &settings(port)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert!(err.message.contains("CLI fallback"));
    }

    #[test]
    async fn test_refused_connection() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let forms = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let submission = Submission::prepare(&session(&[]), MESSAGE, forms.path()).unwrap();
        let adapter = SubmissionAdapter::new(temp.path()).unwrap();

        let err = adapter.submit(&submission, &settings(port)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransportRefused);
        assert!(err.is_transient());
    }
}

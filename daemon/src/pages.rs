use std::io;
use std::path::{Path, PathBuf};

use formbridge_core::errors::{FormError, FormResult};
use formbridge_ipc::daemon_messages::routes;
use lazy_static::lazy_static;
use minijinja::{context, Environment};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, warn};
use url::form_urlencoded::byte_serialize;

use crate::session::FormSession;
use crate::submission::DeliveryPath;

const DIAGNOSTIC: &str = "diagnostic.html";
const SUBMITTED: &str = "submitted.html";
const MANUAL: &str = "manual.html";

/// Suffix of the read-only variant shown to the receiving station.
const RECEIVER_SUFFIX: &str = ".receiver.html";

lazy_static! {
    static ref TEMPLATES: Environment<'static> = templates();
}

fn templates() -> Environment<'static> {
    let mut env = Environment::new();
    let sources = [
        (DIAGNOSTIC, include_str!("../templates/diagnostic.html")),
        (SUBMITTED, include_str!("../templates/submitted.html")),
        (MANUAL, include_str!("../templates/manual.html")),
    ];
    for (name, source) in sources {
        if let Err(e) = env.add_template(name, source) {
            warn!(template = name, error = %e, "Invalid page template");
        }
    }
    env
}

/// Error page; falls back to plain text if the template itself fails.
pub fn diagnostic_page(err: &FormError, session: Option<&FormSession>) -> String {
    let rendered = TEMPLATES.get_template(DIAGNOSTIC).and_then(|template| {
        template.render(context! {
            kind => err.kind.to_string(),
            message => &err.message,
            context => &err.context,
            session => session,
        })
    });
    match rendered {
        Ok(page) => page,
        Err(e) => {
            warn!(error = %e, "Failed to render diagnostic page");
            err.to_string()
        }
    }
}

fn template_error(e: minijinja::Error) -> FormError {
    FormError::internal(format!("Failed to render page: {}", e))
}

/// Data handed to a form template at render time.
#[derive(Debug, Serialize)]
struct PageData<'a> {
    session_id: String,
    read_only: bool,
    environment: &'a std::collections::BTreeMap<String, String>,
    message: Option<&'a str>,
    routes: PageRoutes,
}

#[derive(Debug, Serialize)]
struct PageRoutes {
    message: String,
    save: String,
    email: String,
    submit: String,
    close: String,
    ping: String,
}

#[derive(Debug, Serialize)]
struct FormLink {
    name: String,
    href: String,
}

/// HTML produced by the daemon: installed form templates and its own pages.
#[derive(Debug, Clone)]
pub struct Pages {
    forms_dir: PathBuf,
}

impl Pages {
    pub fn new(forms_dir: impl Into<PathBuf>) -> Self {
        Self {
            forms_dir: forms_dir.into(),
        }
    }

    pub fn forms_dir(&self) -> &Path {
        &self.forms_dir
    }

    pub fn submitted(
        &self,
        session: &FormSession,
        path: DeliveryPath,
        subject: &str,
        response_body: &str,
    ) -> FormResult<String> {
        let id = session.id.to_string();
        TEMPLATES
            .get_template(SUBMITTED)
            .and_then(|template| {
                template.render(context! {
                    session_id => &id,
                    path => path.to_string(),
                    subject => subject,
                    response_body => response_body,
                    close_url => routes::close(&id),
                })
            })
            .map_err(template_error)
    }

    /// Form templates offered for manual entry, sorted by name.
    pub async fn list_forms(&self) -> FormResult<Vec<String>> {
        let mut entries = match fs::read_dir(&self.forms_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut forms = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".html") && !name.ends_with(RECEIVER_SUFFIX) {
                    forms.push(name.to_string());
                }
            }
        }
        forms.sort();
        Ok(forms)
    }

    pub fn manual(&self, forms: &[String]) -> FormResult<String> {
        let links: Vec<FormLink> = forms
            .iter()
            .map(|name| FormLink {
                name: name.clone(),
                href: format!(
                    "{}?form={}",
                    routes::MANUAL_CREATE,
                    byte_serialize(name.as_bytes()).collect::<String>()
                ),
            })
            .collect();
        TEMPLATES
            .get_template(MANUAL)
            .and_then(|template| {
                template.render(context! {
                    forms => links,
                    forms_dir => self.forms_dir.display().to_string(),
                })
            })
            .map_err(template_error)
    }

    /// Path of an installed form template; rejects anything but a bare file name.
    pub fn form_path(&self, form_type: &str) -> FormResult<PathBuf> {
        let name = Path::new(form_type);
        if form_type.is_empty() || name.file_name().and_then(|n| n.to_str()) != Some(form_type) {
            return Err(FormError::configuration(format!(
                "invalid form type '{}'",
                form_type
            )));
        }
        Ok(self.forms_dir.join(name))
    }

    /// Template used to show `session`: the receiver variant for incoming
    /// messages when one is installed, the form itself otherwise.
    async fn template_for(&self, session: &FormSession, form_type: &str) -> FormResult<PathBuf> {
        let path = self.form_path(form_type)?;
        let incoming = matches!(
            session.environment.message_status(),
            Some("read") | Some("unread")
        );
        if incoming {
            let stem = form_type.strip_suffix(".html").unwrap_or(form_type);
            let receiver = self.forms_dir.join(format!("{}{}", stem, RECEIVER_SUFFIX));
            if fs::try_exists(&receiver).await.unwrap_or(false) {
                debug!(session = %session.id, path = %receiver.display(), "Using receiver variant");
                return Ok(receiver);
            }
        }
        Ok(path)
    }

    /// Render a form template with the session's data injected as JSON.
    pub async fn render_form(&self, session: &FormSession, form_type: &str) -> FormResult<String> {
        let path = self.template_for(session, form_type).await?;
        let html = fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                FormError::configuration(format!("form '{}' is not installed", form_type))
                    .with_context("path", path.display().to_string())
            } else {
                FormError::from(e)
            }
        })?;

        let id = session.id.to_string();
        let data = PageData {
            session_id: id.clone(),
            read_only: session.is_read_only(),
            environment: session.environment.as_map(),
            message: session.message.as_deref(),
            routes: PageRoutes {
                message: routes::message(&id),
                save: routes::save(&id),
                email: routes::email(&id),
                submit: routes::submit(&id),
                close: routes::close(&id),
                ping: routes::ping(&id),
            },
        };
        Ok(inject_session_data(&html, &serde_json::to_string(&data)?))
    }
}

/// Place a script defining `window.formbridge` before `</head>`, or at the
/// top of the document when there is no head.
pub fn inject_session_data(html: &str, json: &str) -> String {
    let script = format!(
        "<script>window.formbridge = {};</script>\n",
        json.replace("</", "<\\/")
    );
    match html.to_ascii_lowercase().find("</head>") {
        Some(at) => format!("{}{}{}", &html[..at], script, &html[at..]),
        None => format!("{}{}", script, html),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Environment, SessionId};
    use chrono::Utc;
    use tokio::test;

    fn session(status: &str) -> FormSession {
        let args = vec![
            ("addon_name".to_string(), "PacFORMS".to_string()),
            ("MSG_STATE".to_string(), status.to_string()),
        ];
        let env = Environment::from_arguments(&args).unwrap();
        FormSession::new(SessionId(5), args, env, Utc::now())
    }

    #[test]
    async fn test_diagnostic_escapes_content() {
        let err = FormError::codec("bad <field>").with_context("body", "<b>x</b>");
        let mut session = session("draft");
        session.message = Some("A: [<script>]".to_string());
        let page = diagnostic_page(&err, Some(&session));
        assert!(page.contains("Message Format Error"));
        assert!(page.contains("bad &lt;field&gt;"));
        assert!(page.contains("&lt;b&gt;x&lt;/b&gt;") || page.contains("&lt;b&gt;x&lt;&#x2f;b&gt;"));
        assert!(!page.contains("<script>]"));
        assert!(page.contains("PacFORMS"));
    }

    #[test]
    async fn test_inject_session_data() {
        let html = "<html><HEAD><title>t</title></HEAD><body></body></html>";
        let out = inject_session_data(html, r#"{"m":"</script>"}"#);
        assert!(out.contains(r#"window.formbridge = {"m":"<\/script>"};</script>"#));
        assert!(out.find("window.formbridge").unwrap() < out.find("</HEAD>").unwrap());

        let bare = inject_session_data("<p>x</p>", "{}");
        assert!(bare.starts_with("<script>"));
    }

    #[test]
    async fn test_form_path_rejects_traversal() {
        let pages = Pages::new("/forms");
        assert!(pages.form_path("../settings.toml").is_err());
        assert!(pages.form_path("").is_err());
        assert_eq!(
            pages.form_path("ics213.html").unwrap(),
            PathBuf::from("/forms/ics213.html")
        );
    }

    #[test]
    async fn test_render_form_prefers_receiver_variant() {
        let forms = tempfile::tempdir().unwrap();
        std::fs::write(forms.path().join("ics213.html"), "<head></head>sender").unwrap();
        std::fs::write(forms.path().join("ics213.receiver.html"), "<head></head>receiver").unwrap();
        let pages = Pages::new(forms.path());

        let out = pages.render_form(&session("unread"), "ics213.html").await.unwrap();
        assert!(out.ends_with("receiver"));
        assert!(out.contains(r#""read_only":true"#));

        let out = pages.render_form(&session("draft"), "ics213.html").await.unwrap();
        assert!(out.ends_with("sender"));
        assert!(out.contains(r#""save":"/save/5""#));
    }

    #[test]
    async fn test_missing_form_is_configuration_error() {
        let forms = tempfile::tempdir().unwrap();
        let pages = Pages::new(forms.path());
        let err = pages.render_form(&session("draft"), "nope.html").await.unwrap_err();
        assert_eq!(err.kind, formbridge_core::ErrorKind::Configuration);
    }

    #[test]
    async fn test_manual_lists_forms() {
        let forms = tempfile::tempdir().unwrap();
        std::fs::write(forms.path().join("b form.html"), "").unwrap();
        std::fs::write(forms.path().join("a.html"), "").unwrap();
        std::fs::write(forms.path().join("a.receiver.html"), "").unwrap();
        std::fs::write(forms.path().join("notes.txt"), "").unwrap();
        let pages = Pages::new(forms.path());

        let listed = pages.list_forms().await.unwrap();
        assert_eq!(listed, vec!["a.html".to_string(), "b form.html".to_string()]);
        let page = pages.manual(&listed).unwrap();
        assert!(page.contains("create?form=b+form.html"));
        assert!(!page.contains("notes.txt"));
    }
}

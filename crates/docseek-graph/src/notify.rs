use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, warn};

use crate::executor::ResilientExecutor;
use crate::graph_url;
use crate::http::{BearerAuth, GraphRequest};
use crate::models::FileResult;

/// Mails file links to a user through `/me/sendMail`.
pub struct Notifier {
    executor: Arc<ResilientExecutor>,
    base_url: String,
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn link(file: &FileResult) -> String {
    format!(
        "<p><a href=\"{}\">{}</a></p>",
        escape_html(&file.web_url),
        escape_html(&file.name)
    )
}

/// Subject and HTML body: a single link, or a digest for several files.
pub fn compose(files: &[FileResult]) -> Option<(String, String)> {
    match files {
        [] => None,
        [file] => Some((format!("Here is the file: {}", file.name), link(file))),
        _ => {
            let links: String = files.iter().map(link).collect();
            Some((
                "Your requested files".to_string(),
                format!("<p>Here are the files you requested:</p>{links}"),
            ))
        }
    }
}

impl Notifier {
    pub fn new(executor: Arc<ResilientExecutor>, base_url: &str) -> Self {
        Self {
            executor,
            base_url: base_url.to_string(),
        }
    }

    /// True only when Graph accepted the message (202).
    pub async fn notify(&self, auth: &BearerAuth, to_email: &str, files: &[FileResult]) -> bool {
        let Some((subject, html)) = compose(files) else {
            warn!("No files to send to {}", to_email);
            return false;
        };
        let url = match graph_url(&self.base_url, &["me", "sendMail"]) {
            Ok(url) => url,
            Err(err) => {
                error!("Email send failed: {}", err);
                return false;
            }
        };
        let message = json!({
            "message": {
                "subject": subject,
                "body": {"contentType": "HTML", "content": html},
                "toRecipients": [{"emailAddress": {"address": to_email}}]
            },
            "saveToSentItems": true
        });

        match self.executor.execute(GraphRequest::post_json(url, message), auth).await {
            Ok(response) if response.status == 202 => {
                info!("Email sent to {}", to_email);
                true
            }
            Ok(response) => {
                error!(
                    "Failed to send email to {}: {} - {}",
                    to_email, response.status, response.body
                );
                false
            }
            Err(err) => {
                error!("Email send failed: {}", err);
                false
            }
        }
    }
}

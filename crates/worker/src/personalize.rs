//! Template personalization and the unsubscribe footer.
//!
//! Placeholders use `{{name}}` syntax with optional inner whitespace.
//! Recognized keys are `first_name`, `last_name` and `email`; anything else
//! is left in place untouched.

use reqwest::Url;
use uuid::Uuid;

use cadence_common::types::{CampaignEmail, EmailSend};

/// Attribute marking the footer so it is never appended twice.
const FOOTER_MARKER: &str = "data-cadence-unsubscribe";

/// Recipient fields available to templates.
#[derive(Debug, Clone, Copy)]
pub struct Recipient<'a> {
    pub email: &'a str,
    pub first_name: Option<&'a str>,
    pub last_name: Option<&'a str>,
}

impl<'a> Recipient<'a> {
    pub fn from_send(send: &'a EmailSend) -> Self {
        Self {
            email: &send.recipient_email,
            first_name: send.recipient_first_name.as_deref(),
            last_name: send.recipient_last_name.as_deref(),
        }
    }

    fn lookup(&self, key: &str) -> Option<&'a str> {
        match key {
            "first_name" => Some(self.first_name.unwrap_or("")),
            "last_name" => Some(self.last_name.unwrap_or("")),
            "email" => Some(self.email),
            _ => None,
        }
    }
}

/// Subject and body after personalization, plus the link used in headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub unsubscribe_url: String,
}

/// Personalize a send against its template and append the footer.
pub fn render_email(send: &EmailSend, template: &CampaignEmail, app_url: &Url) -> RenderedEmail {
    let recipient = Recipient::from_send(send);
    let unsubscribe_url = unsubscribe_url(app_url, &send.recipient_email, send.campaign_id);

    let subject = render_placeholders(&send.subject, &recipient, false);
    let body = render_placeholders(&template.body_html, &recipient, true);
    // Decided on the raw template: recipient values may contain the marker.
    let html = if has_unsubscribe_footer(&template.body_html) {
        body
    } else {
        insert_footer(&body, &unsubscribe_url)
    };

    RenderedEmail {
        subject,
        html,
        unsubscribe_url,
    }
}

/// Replace recognized placeholders. Values are HTML-escaped when `html` is set.
pub fn render_placeholders(template: &str, recipient: &Recipient<'_>, html: bool) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];

        let Some(end) = after_open.find("}}") else {
            // Unterminated; keep the remainder verbatim.
            out.push_str(&rest[start..]);
            return out;
        };

        let key = after_open[..end].trim();
        match recipient.lookup(key) {
            Some(value) if html => out.push_str(&escape_html(value)),
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    out
}

/// Deterministic unsubscribe link for a (recipient, campaign) pair.
pub fn unsubscribe_url(app_url: &Url, recipient_email: &str, campaign_id: Uuid) -> String {
    let mut url = app_url.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().push("unsubscribe");
    }
    url.set_fragment(None);
    url.query_pairs_mut()
        .clear()
        .append_pair("email", recipient_email)
        .append_pair("campaign", &campaign_id.to_string());
    url.to_string()
}

/// Append the unsubscribe footer unless the body already carries one.
///
/// The footer goes right before `</body>` when the template is a full
/// document, otherwise at the very end.
pub fn append_unsubscribe_footer(html: &str, unsubscribe_url: &str) -> String {
    if has_unsubscribe_footer(html) {
        return html.to_string();
    }
    insert_footer(html, unsubscribe_url)
}

fn has_unsubscribe_footer(html: &str) -> bool {
    html.contains(FOOTER_MARKER)
}

fn insert_footer(html: &str, unsubscribe_url: &str) -> String {
    let footer = format!(
        concat!(
            "<div {} style=\"margin-top:32px;font-size:12px;color:#888888;text-align:center;\">",
            "<p>Don't want these emails? <a href=\"{}\">Unsubscribe</a></p>",
            "</div>"
        ),
        FOOTER_MARKER,
        escape_html(unsubscribe_url)
    );

    match html.to_ascii_lowercase().rfind("</body>") {
        Some(idx) => {
            let mut out = String::with_capacity(html.len() + footer.len());
            out.push_str(&html[..idx]);
            out.push_str(&footer);
            out.push_str(&html[idx..]);
            out
        }
        None => format!("{}{}", html, footer),
    }
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_send, make_template};

    fn app_url() -> Url {
        Url::parse("https://app.example.com").unwrap()
    }

    fn recipient() -> Recipient<'static> {
        Recipient {
            email: "ada@example.com",
            first_name: Some("Ada"),
            last_name: Some("Lovelace"),
        }
    }

    #[test]
    fn test_placeholders_replaced() {
        let out = render_placeholders(
            "Hi {{first_name}} {{ last_name }} <{{email}}>",
            &recipient(),
            false,
        );
        assert_eq!(out, "Hi Ada Lovelace <ada@example.com>");
    }

    #[test]
    fn test_missing_names_render_empty() {
        let r = Recipient {
            email: "x@example.com",
            first_name: None,
            last_name: None,
        };
        assert_eq!(render_placeholders("Hi {{first_name}}!", &r, false), "Hi !");
    }

    #[test]
    fn test_unknown_and_unterminated_placeholders_untouched() {
        let out = render_placeholders("{{company}} and {{first_name", &recipient(), false);
        assert_eq!(out, "{{company}} and {{first_name");
    }

    #[test]
    fn test_html_values_escaped() {
        let r = Recipient {
            email: "x@example.com",
            first_name: Some("<b>Eve</b>"),
            last_name: None,
        };
        assert_eq!(
            render_placeholders("<p>{{first_name}}</p>", &r, true),
            "<p>&lt;b&gt;Eve&lt;/b&gt;</p>"
        );
        assert_eq!(render_placeholders("{{first_name}}", &r, false), "<b>Eve</b>");
    }

    #[test]
    fn test_unsubscribe_url_is_deterministic() {
        let campaign = Uuid::new_v4();
        let a = unsubscribe_url(&app_url(), "ada+news@example.com", campaign);
        let b = unsubscribe_url(&app_url(), "ada+news@example.com", campaign);
        assert_eq!(a, b);
        assert_eq!(
            a,
            format!(
                "https://app.example.com/unsubscribe?email=ada%2Bnews%40example.com&campaign={}",
                campaign
            )
        );
    }

    #[test]
    fn test_unsubscribe_url_keeps_base_path() {
        let base = Url::parse("https://example.com/app/").unwrap();
        let campaign = Uuid::new_v4();
        let url = unsubscribe_url(&base, "a@example.com", campaign);
        assert!(url.starts_with("https://example.com/app/unsubscribe?email="));
    }

    #[test]
    fn test_unsubscribe_url_differs_per_recipient() {
        let campaign = Uuid::new_v4();
        assert_ne!(
            unsubscribe_url(&app_url(), "a@example.com", campaign),
            unsubscribe_url(&app_url(), "b@example.com", campaign)
        );
    }

    #[test]
    fn test_footer_appended_exactly_once() {
        let url = "https://app.example.com/unsubscribe?email=a&campaign=c";
        let once = append_unsubscribe_footer("<p>Hello</p>", url);
        let twice = append_unsubscribe_footer(&once, url);
        assert_eq!(once, twice);
        assert_eq!(once.matches(FOOTER_MARKER).count(), 1);
        assert!(once.contains("email=a&amp;campaign=c"));
    }

    #[test]
    fn test_footer_inserted_before_body_close() {
        let html = "<html><BODY><p>Hi</p></BODY></html>";
        let out = append_unsubscribe_footer(html, "https://x/unsubscribe");
        let footer_at = out.find(FOOTER_MARKER).unwrap();
        let body_close = out.find("</BODY>").unwrap();
        assert!(footer_at < body_close);
        assert!(out.ends_with("</BODY></html>"));
    }

    #[test]
    fn test_render_email() {
        let queue_id = Uuid::new_v4();
        let send = make_send(queue_id, 0);
        let template = make_template(send.campaign_id, 1);

        let rendered = render_email(&send, &template, &app_url());
        assert_eq!(rendered.subject, "Quick question, Ada");
        assert!(rendered.html.starts_with("<p>Hello Ada,</p>"));
        assert_eq!(rendered.html.matches(FOOTER_MARKER).count(), 1);
        assert_eq!(
            rendered.unsubscribe_url,
            unsubscribe_url(&app_url(), &send.recipient_email, send.campaign_id)
        );
        // Same input, same output.
        assert_eq!(rendered, render_email(&send, &template, &app_url()));
    }

    #[test]
    fn test_recipient_data_cannot_suppress_footer() {
        let mut send = make_send(Uuid::new_v4(), 0);
        send.recipient_first_name = Some(FOOTER_MARKER.to_string());
        let template = make_template(send.campaign_id, 1);

        let rendered = render_email(&send, &template, &app_url());
        assert!(rendered.html.starts_with("<p>Hello data-cadence-unsubscribe,</p>"));
        assert_eq!(rendered.html.matches("Unsubscribe</a>").count(), 1);
        assert!(rendered.html.contains(&escape_html(&rendered.unsubscribe_url)));
    }

    #[test]
    fn test_template_with_own_footer_left_alone() {
        let send = make_send(Uuid::new_v4(), 0);
        let mut template = make_template(send.campaign_id, 1);
        template.body_html = format!(
            "<p>Hi</p><div {}><a href=\"#\">Unsubscribe</a></div>",
            FOOTER_MARKER
        );

        let rendered = render_email(&send, &template, &app_url());
        assert_eq!(rendered.html, template.body_html);
    }
}

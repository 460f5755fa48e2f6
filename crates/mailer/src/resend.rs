//! Resend HTTP API client.
//!
//! `POST {api_url}/emails` with a bearer key. A 2xx response carries
//! `{"id": "..."}`; anything else is a rejected delivery.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::email::{DeliveryError, EmailProvider, OutgoingEmail};

/// Longest provider error body kept on a failed send record.
const MAX_ERROR_BODY_LEN: usize = 500;

/// Request body accepted by `POST /emails`.
#[derive(Debug, Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "no_headers")]
    headers: &'a BTreeMap<String, String>,
}

fn no_headers(headers: &&BTreeMap<String, String>) -> bool {
    headers.is_empty()
}

#[derive(Debug, Deserialize)]
struct SendEmailResponse {
    id: Option<String>,
}

/// Client for the Resend transactional email API.
#[derive(Debug, Clone)]
pub struct ResendClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl ResendClient {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/emails", self.api_url)
    }
}

#[async_trait]
impl EmailProvider for ResendClient {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, DeliveryError> {
        let body = SendEmailRequest {
            from: &email.from,
            to: [&email.to],
            subject: &email.subject,
            html: &email.html,
            headers: &email.headers,
        };

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let mut text = response.text().await.unwrap_or_default();
            if text.len() > MAX_ERROR_BODY_LEN {
                let mut cut = MAX_ERROR_BODY_LEN;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            tracing::debug!(status = status.as_u16(), to = %email.to, "Resend rejected email");
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: SendEmailResponse = response.json().await?;
        parsed
            .id
            .filter(|id| !id.is_empty())
            .ok_or(DeliveryError::MissingMessageId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::Json;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use serde_json::{Value, json};

    fn make_email() -> OutgoingEmail {
        let mut headers = BTreeMap::new();
        headers.insert("X-Send-Id".to_string(), "send-1".to_string());
        OutgoingEmail {
            from: "Team <team@example.com>".to_string(),
            to: "ada@example.com".to_string(),
            subject: "Hello".to_string(),
            html: "<p>Hi</p>".to_string(),
            headers,
        }
    }

    /// Serve `router` on an ephemeral port and return its base URL.
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_request_body_shape() {
        let email = make_email();
        let body = SendEmailRequest {
            from: &email.from,
            to: [&email.to],
            subject: &email.subject,
            html: &email.html,
            headers: &email.headers,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["to"], json!(["ada@example.com"]));
        assert_eq!(value["headers"]["X-Send-Id"], "send-1");
    }

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        let client =
            ResendClient::new("https://api.resend.com/", "key", Duration::from_secs(1)).unwrap();
        assert_eq!(client.endpoint(), "https://api.resend.com/emails");
    }

    #[tokio::test]
    async fn test_send_returns_message_id() {
        let router = Router::new().route(
            "/emails",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(
                    headers.get("authorization").unwrap().to_str().unwrap(),
                    "Bearer re_test"
                );
                assert_eq!(body["subject"], "Hello");
                Json(json!({ "id": "msg_123" }))
            }),
        );
        let base = serve(router).await;

        let client = ResendClient::new(base, "re_test", Duration::from_secs(5)).unwrap();
        let id = client.send(&make_email()).await.unwrap();
        assert_eq!(id, "msg_123");
    }

    #[tokio::test]
    async fn test_send_non_2xx_is_rejected() {
        let router = Router::new().route(
            "/emails",
            post(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({ "message": "rate limit exceeded" })),
                )
            }),
        );
        let base = serve(router).await;

        let client = ResendClient::new(base, "re_test", Duration::from_secs(5)).unwrap();
        let err = client.send(&make_email()).await.unwrap_err();
        match err {
            DeliveryError::Rejected { status, body } => {
                assert_eq!(status, 429);
                assert!(body.contains("rate limit"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_without_id_fails() {
        let router = Router::new().route("/emails", post(|| async { Json(json!({})) }));
        let base = serve(router).await;

        let client = ResendClient::new(base, "re_test", Duration::from_secs(5)).unwrap();
        let err = client.send(&make_email()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::MissingMessageId));
    }
}

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing;

use crate::config::ProviderConfig;
use crate::error::{Result, TrackerError};
use crate::provider::{
    AccessToken, Folder, Lookup, MailProvider, ProviderMessage, ProviderSubscription,
    SubscriptionRequest,
};

const MESSAGE_FIELDS: &str = "id,conversationId,internetMessageId,subject,bodyPreview,isRead,\
receivedDateTime,sentDateTime,from,toRecipients,internetMessageHeaders";
const PAGE_SIZE: &str = "50";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSubscriptionBody<'a> {
    change_type: &'a str,
    notification_url: &'a str,
    resource: &'a str,
    expiration_date_time: String,
    client_state: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RenewSubscriptionBody {
    expiration_date_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphSubscription {
    id: String,
    #[serde(default)]
    resource: String,
    expiration_date_time: DateTime<Utc>,
}

impl From<GraphSubscription> for ProviderSubscription {
    fn from(sub: GraphSubscription) -> Self {
        ProviderSubscription {
            id: sub.id,
            resource: sub.resource,
            expires_at: sub.expiration_date_time,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

fn graph_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Microsoft Graph implementation of [`MailProvider`].
pub struct GraphClient {
    client: Arc<reqwest::Client>,
    base_url: String,
    max_pages: usize,
}

impl GraphClient {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        tracing::info!("Initializing Graph client for {}", config.graph_base_url);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TrackerError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client: Arc::new(client),
            base_url: config.graph_base_url.trim_end_matches('/').to_string(),
            max_pages: config.max_pages.max(1),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Maps a non-success response onto the error taxonomy. 404 is returned
    /// as `Ok(None)` so callers can turn it into `Lookup::NotFound`.
    async fn check(&self, token: &AccessToken, response: Response) -> Result<Option<Response>> {
        let status = response.status();
        if status.is_success() {
            return Ok(Some(response));
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        match status {
            StatusCode::UNAUTHORIZED => Err(TrackerError::AuthRequired {
                user_id: token.user_id.clone(),
            }),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => Err(
                TrackerError::TransientNetwork(format!("Graph returned {}: {}", status, error_text)),
            ),
            s if s.is_server_error() => Err(TrackerError::TransientNetwork(format!(
                "Graph returned {}: {}",
                status, error_text
            ))),
            _ => Err(TrackerError::ProviderRejected(format!(
                "Graph returned {}: {}",
                status, error_text
            ))),
        }
    }

    async fn expect_found(&self, token: &AccessToken, response: Response, what: &str) -> Result<Response> {
        self.check(token, response)
            .await?
            .ok_or_else(|| TrackerError::NotFound(what.to_string()))
    }
}

#[async_trait]
impl MailProvider for GraphClient {
    async fn create_subscription(
        &self,
        token: &AccessToken,
        request: &SubscriptionRequest,
    ) -> Result<ProviderSubscription> {
        let body = CreateSubscriptionBody {
            change_type: &request.change_types,
            notification_url: &request.notification_url,
            resource: &request.resource,
            expiration_date_time: graph_timestamp(request.expires_at),
            client_state: &request.client_state,
        };

        let response = self
            .client
            .post(self.url("subscriptions"))
            .bearer_auth(&token.token)
            .json(&body)
            .send()
            .await?;
        let response = self.expect_found(token, response, "subscriptions endpoint").await?;
        let created: GraphSubscription = response.json().await?;

        tracing::debug!("Created Graph subscription {} for {}", created.id, token.user_id);
        Ok(created.into())
    }

    async fn renew_subscription(
        &self,
        token: &AccessToken,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Lookup<ProviderSubscription>> {
        let response = self
            .client
            .patch(self.url(&format!("subscriptions/{}", subscription_id)))
            .bearer_auth(&token.token)
            .json(&RenewSubscriptionBody {
                expiration_date_time: graph_timestamp(expires_at),
            })
            .send()
            .await?;

        match self.check(token, response).await? {
            Some(response) => {
                let renewed: GraphSubscription = response.json().await?;
                Ok(Lookup::Found(renewed.into()))
            }
            None => Ok(Lookup::NotFound),
        }
    }

    async fn list_subscriptions(&self, token: &AccessToken) -> Result<Vec<ProviderSubscription>> {
        let response = self
            .client
            .get(self.url("subscriptions"))
            .bearer_auth(&token.token)
            .send()
            .await?;
        let response = self.expect_found(token, response, "subscriptions endpoint").await?;
        let page: Page<GraphSubscription> = response.json().await?;
        Ok(page.value.into_iter().map(ProviderSubscription::from).collect())
    }

    async fn delete_subscription(
        &self,
        token: &AccessToken,
        subscription_id: &str,
    ) -> Result<Lookup<()>> {
        let response = self
            .client
            .delete(self.url(&format!("subscriptions/{}", subscription_id)))
            .bearer_auth(&token.token)
            .send()
            .await?;

        Ok(match self.check(token, response).await? {
            Some(_) => Lookup::Found(()),
            None => Lookup::NotFound,
        })
    }

    async fn get_message(
        &self,
        token: &AccessToken,
        resource: &str,
    ) -> Result<Lookup<ProviderMessage>> {
        let response = self
            .client
            .get(self.url(resource))
            .bearer_auth(&token.token)
            .query(&[("$select", MESSAGE_FIELDS)])
            .send()
            .await?;

        match self.check(token, response).await? {
            Some(response) => Ok(Lookup::Found(response.json().await?)),
            None => Ok(Lookup::NotFound),
        }
    }

    async fn list_messages(
        &self,
        token: &AccessToken,
        folder: Folder,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProviderMessage>> {
        let (path, time_field) = match folder {
            Folder::Inbox => ("me/mailFolders/inbox/messages", "receivedDateTime"),
            Folder::SentItems => ("me/mailFolders/sentitems/messages", "sentDateTime"),
        };
        let filter = format!("{} ge {}", time_field, graph_timestamp(since));
        let order = format!("{} desc", time_field);

        let first = self
            .client
            .get(self.url(path))
            .bearer_auth(&token.token)
            .query(&[
                ("$filter", filter.as_str()),
                ("$orderby", order.as_str()),
                ("$top", PAGE_SIZE),
                ("$select", MESSAGE_FIELDS),
            ])
            .send()
            .await?;

        let mut messages = Vec::new();
        let mut response = self.expect_found(token, first, path).await?;
        // Listings are bounded by `since`, so following every link ends at it.
        for page_number in 1..=self.max_pages {
            let page: Page<ProviderMessage> = response.json().await?;
            messages.extend(page.value);

            let next = match page.next_link {
                Some(next) if page_number < self.max_pages => next,
                Some(_) => {
                    tracing::error!(
                        "Stopping {} listing for {} after {} pages; older messages were not read (raise GRAPH_MAX_PAGES)",
                        path,
                        token.user_id,
                        self.max_pages
                    );
                    break;
                }
                None => break,
            };
            let raw = self.client.get(next).bearer_auth(&token.token).send().await?;
            response = self.expect_found(token, raw, path).await?;
        }

        tracing::debug!("Listed {} messages from {} for {}", messages.len(), path, token.user_id);
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_graph_message_with_reply_header() {
        let raw = r#"{
            "id": "AAMk-1",
            "conversationId": "conv-1",
            "internetMessageId": "<reply@mail.example.com>",
            "subject": "RE: Proposal",
            "bodyPreview": "Sounds good",
            "isRead": false,
            "receivedDateTime": "2026-03-02T10:15:00Z",
            "from": {"emailAddress": {"name": "Lead", "address": "Lead@Example.com"}},
            "toRecipients": [{"emailAddress": {"address": "me@example.com"}}],
            "internetMessageHeaders": [{"name": "In-Reply-To", "value": "<orig@mail.example.com>"}]
        }"#;

        let msg: ProviderMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.id.as_deref(), Some("AAMk-1"));
        assert_eq!(msg.sender(), Some("Lead@Example.com"));
        assert_eq!(msg.first_recipient(), Some("me@example.com"));
        assert_eq!(msg.header("in-reply-to"), Some("<orig@mail.example.com>"));
    }

    #[test]
    fn subscription_page_follows_graph_shape() {
        let raw = r#"{
            "value": [{"id": "sub-1", "resource": "me/messages", "expirationDateTime": "2026-03-05T00:00:00Z"}],
            "@odata.nextLink": null
        }"#;
        let page: Page<GraphSubscription> = serde_json::from_str(raw).unwrap();
        assert_eq!(page.value.len(), 1);
        assert!(page.next_link.is_none());
    }

    #[test]
    fn timestamps_use_utc_zulu_suffix() {
        let ts = DateTime::parse_from_rfc3339("2026-03-02T10:15:30.123Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(graph_timestamp(ts), "2026-03-02T10:15:30Z");
    }

    async fn paged_server() -> String {
        use axum::extract::Query;
        use std::collections::HashMap;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let link_base = base.clone();
        let app = axum::Router::new().route(
            "/me/mailFolders/inbox/messages",
            axum::routing::get(move |Query(query): Query<HashMap<String, String>>| {
                let link_base = link_base.clone();
                async move {
                    let page: u32 = query.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
                    let next = (page < 3).then(|| {
                        format!("{}/me/mailFolders/inbox/messages?page={}", link_base, page + 1)
                    });
                    axum::Json(serde_json::json!({
                        "value": [{"id": format!("m-{}", page), "receivedDateTime": "2026-03-02T10:15:00Z"}],
                        "@odata.nextLink": next,
                    }))
                }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base
    }

    fn client(base: &str, max_pages: usize) -> GraphClient {
        let mut config = crate::config::Config::default().provider;
        config.graph_base_url = base.to_string();
        config.max_pages = max_pages;
        GraphClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn listing_follows_next_links_up_to_the_page_cap() {
        let base = paged_server().await;
        let token = AccessToken {
            user_id: "user-1".into(),
            token: "token".into(),
        };
        let since = Utc::now() - chrono::Duration::days(30);

        let all = client(&base, 10).list_messages(&token, Folder::Inbox, since).await.unwrap();
        let ids: Vec<_> = all.iter().filter_map(|m| m.id.as_deref()).collect();
        assert_eq!(ids, vec!["m-1", "m-2", "m-3"]);

        let capped = client(&base, 2).list_messages(&token, Folder::Inbox, since).await.unwrap();
        assert_eq!(capped.len(), 2);
    }
}

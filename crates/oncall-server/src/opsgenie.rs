use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use oncall_contracts::ResolveError;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::resolver::{IdentityMapper, ScheduleClient};

/// OpsGenie REST client serving both schedule lookups and user lookups.
pub struct OpsgenieClient {
    base_url: Url,
    api_key: String,
    identity_attribute: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnCallData {
    #[serde(default)]
    on_call_recipients: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserData {
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    details: HashMap<String, Vec<String>>,
}

impl OpsgenieClient {
    pub fn new(api_url: &str, api_key: &str, identity_attribute: &str) -> Result<Self, String> {
        let base_url = Url::parse(api_url).map_err(|e| format!("invalid opsgenie.api_url: {e}"))?;
        if base_url.cannot_be_a_base() {
            return Err(format!("invalid opsgenie.api_url: {api_url}"));
        }
        let client = Client::builder().build().map_err(|e| e.to_string())?;
        Ok(Self {
            base_url,
            api_key: api_key.to_string(),
            identity_attribute: identity_attribute.to_string(),
            client,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, request: RequestBuilder, timeout: Duration) -> RequestBuilder {
        request
            .header("Authorization", format!("GenieKey {}", self.api_key))
            .timeout(timeout)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        subject: &str,
    ) -> Result<T, ResolveError> {
        let response = request
            .send()
            .await
            .map_err(|e| ResolveError::ServiceUnavailable(format!("{subject}: {e}")))?;
        let status = response.status();
        match status {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ResolveError::Unauthorized(format!("{subject}: http {status}")))
            }
            StatusCode::NOT_FOUND => return Err(ResolveError::NotFound(subject.to_string())),
            _ => {
                return Err(ResolveError::ServiceUnavailable(format!(
                    "{subject}: http {status}"
                )))
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ResolveError::ServiceUnavailable(format!("{subject}: {e}")))?;
        let envelope: Envelope<T> = serde_json::from_slice(&body)
            .map_err(|e| ResolveError::Decode(format!("{subject}: {e}")))?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl ScheduleClient for OpsgenieClient {
    async fn on_call(
        &self,
        schedule_name: &str,
        as_of: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Vec<String>, ResolveError> {
        let url = self.endpoint(&["v2", "schedules", schedule_name, "on-calls"]);
        let request = self.client.get(url).query(&[
            ("scheduleIdentifierType", "name".to_string()),
            ("flat", "true".to_string()),
            ("date", as_of.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ]);
        let data: OnCallData = self
            .fetch(
                self.authorized(request, timeout),
                &format!("schedule {schedule_name}"),
            )
            .await?;
        Ok(data.on_call_recipients)
    }
}

#[async_trait]
impl IdentityMapper for OpsgenieClient {
    async fn map_identity(
        &self,
        external_id: &str,
        timeout: Duration,
    ) -> Result<String, ResolveError> {
        let request = self
            .client
            .get(self.endpoint(&["v2", "users", external_id]));
        let user: UserData = self
            .fetch(
                self.authorized(request, timeout),
                &format!("user {external_id}"),
            )
            .await?;
        usable(
            user.details
                .get(&self.identity_attribute)
                .and_then(|values| values.first()),
        )
        .or_else(|| usable(user.full_name.as_ref()))
        .map(str::to_string)
        .ok_or_else(|| ResolveError::NotFound(format!("user {external_id} has no usable identity")))
    }
}

fn usable(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use oncall_contracts::{OnCallResult, ResolveError, TeamMentionConfig};
use oncall_kernel::{union_identities, with_escalation_fallback};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Who is on call for one schedule, as external identifiers.
#[async_trait]
pub trait ScheduleClient: Send + Sync {
    async fn on_call(
        &self,
        schedule_name: &str,
        as_of: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Vec<String>, ResolveError>;
}

/// Maps an external identifier (e.g. an email) to a local chat identity.
#[async_trait]
pub trait IdentityMapper: Send + Sync {
    async fn map_identity(&self, external_id: &str, timeout: Duration)
        -> Result<String, ResolveError>;
}

pub struct PassthroughIdentity;

#[async_trait]
impl IdentityMapper for PassthroughIdentity {
    async fn map_identity(
        &self,
        external_id: &str,
        _timeout: Duration,
    ) -> Result<String, ResolveError> {
        Ok(external_id.to_string())
    }
}

pub struct Resolver {
    schedules: Arc<dyn ScheduleClient>,
    identities: Arc<dyn IdentityMapper>,
    timeout: Duration,
    retry_max_attempts: usize,
    retry_backoff: Duration,
}

impl Resolver {
    pub fn new(
        schedules: Arc<dyn ScheduleClient>,
        identities: Arc<dyn IdentityMapper>,
        timeout: Duration,
    ) -> Self {
        Self {
            schedules,
            identities,
            timeout,
            retry_max_attempts: 1,
            retry_backoff: Duration::ZERO,
        }
    }

    pub fn with_retry(mut self, max_attempts: usize, backoff: Duration) -> Self {
        self.retry_max_attempts = max_attempts.max(1);
        self.retry_backoff = backoff;
        self
    }

    pub async fn resolve(&self, team: &TeamMentionConfig) -> Result<OnCallResult, ResolveError> {
        let as_of = Utc::now();
        let per_schedule = try_join_all(
            team.schedule_names
                .iter()
                .map(|name| self.schedule_on_call(name, as_of)),
        )
        .await?;
        let external = union_identities(per_schedule);

        let mapped = try_join_all(external.iter().map(|id| self.local_identity(id))).await?;
        let identities = with_escalation_fallback(
            union_identities([mapped.into_iter().flatten()]),
            &team.escalation_identity,
        );
        debug!(
            mention = %team.mention_token,
            on_call = identities.len(),
            "resolved on-call identities"
        );
        Ok(OnCallResult {
            identities,
            fetched_at: Utc::now(),
        })
    }

    async fn schedule_on_call(
        &self,
        name: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<String>, ResolveError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.schedules.on_call(name, as_of, self.timeout).await {
                Ok(ids) => return Ok(ids),
                Err(ResolveError::NotFound(detail)) => {
                    warn!(schedule = %name, %detail, "schedule not found; treating as nobody on call");
                    return Ok(Vec::new());
                }
                Err(err) if err.is_transient() && attempt < self.retry_max_attempts => {
                    warn!(schedule = %name, attempt, error = %err, "schedule lookup failed; retrying");
                    if self.retry_backoff > Duration::ZERO {
                        sleep(self.retry_backoff).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn local_identity(&self, external_id: &str) -> Result<Option<String>, ResolveError> {
        match self.identities.map_identity(external_id, self.timeout).await {
            Ok(local) => Ok(Some(local)),
            Err(err @ (ResolveError::NotFound(_) | ResolveError::Decode(_))) => {
                warn!(external_id, error = %err, "dropping unmappable on-call identity");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

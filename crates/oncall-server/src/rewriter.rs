use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::join_all;
use oncall_contracts::{OnCallResult, ResolveError, TeamMentionConfig};
use oncall_kernel::{format_mention_block, scan_mentions, splice_mentions};
use tracing::{info, warn};

use crate::cache::OnCallCache;
use crate::resolver::Resolver;

/// The configured team set. Readers take an `Arc` snapshot; replacement
/// swaps the whole set.
#[derive(Clone)]
pub struct TeamSet {
    current: Arc<ArcSwap<Vec<TeamMentionConfig>>>,
}

impl TeamSet {
    pub fn new(teams: Vec<TeamMentionConfig>) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(teams)),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<TeamMentionConfig>> {
        self.current.load_full()
    }

    pub fn replace(&self, teams: Vec<TeamMentionConfig>) {
        self.current.store(Arc::new(teams));
    }
}

#[derive(Clone)]
pub struct Rewriter {
    teams: TeamSet,
    cache: Arc<OnCallCache>,
    resolver: Arc<Resolver>,
    ttl: Duration,
}

impl Rewriter {
    pub fn new(
        teams: TeamSet,
        cache: Arc<OnCallCache>,
        resolver: Arc<Resolver>,
        ttl: Duration,
    ) -> Self {
        Self {
            teams,
            cache,
            resolver,
            ttl,
        }
    }

    pub fn teams(&self) -> &TeamSet {
        &self.teams
    }

    pub fn cache(&self) -> &OnCallCache {
        &self.cache
    }

    /// Replaces every configured `@token` with a block tagging whoever is on
    /// call. Tokens that cannot be resolved are left as written.
    pub async fn rewrite(&self, message: &str) -> String {
        let teams = self.teams.snapshot();
        let tokens: Vec<&str> = teams.iter().map(|t| t.mention_token.as_str()).collect();
        let matches = scan_mentions(message, &tokens);
        if matches.is_empty() {
            return message.to_string();
        }

        let mut wanted: Vec<usize> = matches.iter().map(|m| m.token).collect();
        wanted.sort_unstable();
        wanted.dedup();

        let resolved = join_all(wanted.iter().map(|&idx| self.lookup(&teams[idx]))).await;
        let mut blocks = HashMap::new();
        for (idx, outcome) in wanted.into_iter().zip(resolved) {
            let token = tokens[idx];
            match outcome {
                Ok(result) => {
                    blocks.insert(idx, format_mention_block(token, &result.identities));
                }
                Err(err) => {
                    warn!(mention = token, error = %err, "leaving mention unresolved");
                }
            }
        }
        splice_mentions(message, &matches, |idx| blocks.get(&idx).cloned())
    }

    /// Current on-call result for one configured mention, `None` if the
    /// mention is not configured.
    pub async fn on_call(&self, mention: &str) -> Option<Result<OnCallResult, ResolveError>> {
        let teams = self.teams.snapshot();
        let team = teams.iter().find(|t| t.mention_token == mention)?;
        Some(self.lookup(team).await)
    }

    /// Resolves every configured team once so the first messages hit a warm
    /// cache. Failures are logged only.
    pub async fn warm_up(&self) {
        let teams = self.teams.snapshot();
        let outcomes = join_all(teams.iter().map(|team| self.lookup(team))).await;
        for (team, outcome) in teams.iter().zip(outcomes) {
            match outcome {
                Ok(result) => info!(
                    mention = %team.mention_token,
                    on_call = ?result.identities,
                    "warmed on-call cache"
                ),
                Err(err) => warn!(
                    mention = %team.mention_token,
                    error = %err,
                    "warming on-call cache failed"
                ),
            }
        }
    }

    async fn lookup(&self, team: &TeamMentionConfig) -> Result<OnCallResult, ResolveError> {
        let resolver = self.resolver.clone();
        let owned = team.clone();
        self.cache
            .get(&team.mention_token, self.ttl, move || async move {
                resolver.resolve(&owned).await
            })
            .await
    }
}

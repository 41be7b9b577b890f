use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use oncall_contracts::STORE_KEY_PREFIX;

/// Unions the lists in order, keeping the first occurrence of every exact
/// (case-sensitive) identifier.
pub fn union_identities<I, L>(lists: I) -> Vec<String>
where
    I: IntoIterator<Item = L>,
    L: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for list in lists {
        for id in list {
            if seen.insert(id.clone()) {
                out.push(id);
            }
        }
    }
    out
}

/// Falls back to the escalation identity only when nobody at all is on call.
pub fn with_escalation_fallback(identities: Vec<String>, escalation: &str) -> Vec<String> {
    if identities.is_empty() {
        vec![escalation.to_string()]
    } else {
        identities
    }
}

pub fn expires_at(from: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| from.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn is_expired(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now >= expires_at
}

pub fn store_key(mention_token: &str) -> String {
    format!("{STORE_KEY_PREFIX}{mention_token}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MentionMatch {
    pub start: usize,
    pub end: usize,
    /// Index into the token slice passed to [`scan_mentions`].
    pub token: usize,
}

/// Finds every `@<token>` in one left-to-right pass. When several tokens
/// match at the same `@`, the longest wins; matches never overlap.
pub fn scan_mentions(message: &str, tokens: &[&str]) -> Vec<MentionMatch> {
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some(offset) = message[pos..].find('@') {
        let at = pos + offset;
        let rest = &message[at + 1..];
        let best = tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_empty() && rest.starts_with(**t))
            .fold(None::<(usize, usize)>, |best, (idx, t)| match best {
                Some((_, len)) if len >= t.len() => best,
                _ => Some((idx, t.len())),
            });
        match best {
            Some((token, len)) => {
                let end = at + 1 + len;
                out.push(MentionMatch {
                    start: at,
                    end,
                    token,
                });
                pos = end;
            }
            None => pos = at + 1,
        }
    }
    out
}

pub fn format_mention_block(mention_token: &str, identities: &[String]) -> String {
    let tagged: Vec<String> = identities.iter().map(|id| format!("@{id}")).collect();
    format!("[@{mention_token}]( * {} * )", tagged.join(" "))
}

/// Rebuilds the message, replacing each match whose token has a block.
/// Matches without a block are copied through untouched.
pub fn splice_mentions<F>(message: &str, matches: &[MentionMatch], mut block_for: F) -> String
where
    F: FnMut(usize) -> Option<String>,
{
    let mut out = String::with_capacity(message.len());
    let mut cursor = 0;
    for m in matches {
        out.push_str(&message[cursor..m.start]);
        match block_for(m.token) {
            Some(block) => out.push_str(&block),
            None => out.push_str(&message[m.start..m.end]),
        }
        cursor = m.end;
    }
    out.push_str(&message[cursor..]);
    out
}

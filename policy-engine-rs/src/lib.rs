// policy-engine-rs/src/lib.rs
//
// Access policy evaluation.
//
// Policies carry an effect, a priority and predicates over subject, action
// and resource, plus optional conditions (time-of-day window, source CIDR
// set, grantee expiry). Evaluation is closed-world: active policies are
// sorted by priority descending (DENY before ALLOW within a priority) and
// the first full match decides; no match denies.
//
// For record resources the engine overlays the on-ledger ACL: a local ALLOW
// is confirmed through CheckAccess, with a short-TTL decision cache that the
// event fan-out invalidates on grant/revoke.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Timelike, Utc};
use dashmap::DashMap;
use ipnet::IpNet;
use ledger_gateway::LedgerGateway;
use serde::{Deserialize, Serialize};
use shared_types::config::env_millis;
use tracing::{debug, warn};

/// Errors raised when policies are installed, never during evaluation.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("policy not found: {0}")]
    PolicyNotFound(String),
}

/// Decision effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Effect {
    Allow,
    Deny,
}

/// Predicate over one request attribute. String entries may end in `*` for
/// prefix matching; a bare `*` matches anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Match {
    One(String),
    AnyOf(Vec<String>),
}

impl Match {
    pub fn any() -> Self {
        Match::One("*".to_string())
    }

    fn entry_matches(pattern: &str, value: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        match pattern.strip_suffix('*') {
            Some(prefix) => value.starts_with(prefix),
            None => pattern == value,
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Match::One(pattern) => Self::entry_matches(pattern, value),
            Match::AnyOf(patterns) => patterns.iter().any(|p| Self::entry_matches(p, value)),
        }
    }
}

/// Hour-of-day window in UTC. `start == end` means always; a window with
/// `start > end` spans midnight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl TimeWindow {
    fn contains(&self, at: DateTime<Utc>) -> bool {
        let hour = at.hour() as u8;
        if self.start_hour == self.end_hour {
            true
        } else if self.start_hour < self.end_hour {
            (self.start_hour..self.end_hour).contains(&hour)
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Optional conditions that must all hold for a policy to match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    /// Empty set means any source address.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_cidrs: Vec<IpNet>,
    /// Require the request's grant (if any) to be unexpired.
    #[serde(default)]
    pub grantee_unexpired: bool,
}

impl ConditionSet {
    fn holds(&self, attrs: &RequestAttrs, now: DateTime<Utc>) -> bool {
        if let Some(window) = &self.time_window {
            if !window.contains(now) {
                return false;
            }
        }
        if !self.source_cidrs.is_empty() {
            match attrs.source_ip {
                Some(ip) => {
                    if !self.source_cidrs.iter().any(|net| net.contains(&ip)) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if self.grantee_unexpired {
            if let Some(expires) = attrs.grant_expires_at {
                if expires <= now {
                    return false;
                }
            }
        }
        true
    }
}

/// One access policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub priority: i32,
    pub effect: Effect,
    pub subjects: Match,
    pub actions: Match,
    pub resources: Match,
    #[serde(default)]
    pub condition: ConditionSet,
    pub is_active: bool,
}

/// The resource being decided on: a class and an identifier. Predicates
/// match against `class:id`.
#[derive(Debug, Clone)]
pub struct Resource {
    pub class: String,
    pub id: String,
}

impl Resource {
    pub fn record(id: impl Into<String>) -> Self {
        Self {
            class: "record".to_string(),
            id: id.into(),
        }
    }

    fn qualified(&self) -> String {
        format!("{}:{}", self.class, self.id)
    }
}

/// Request attributes consulted by condition predicates.
#[derive(Debug, Clone, Default)]
pub struct RequestAttrs {
    pub source_ip: Option<IpAddr>,
    pub grant_expires_at: Option<DateTime<Utc>>,
    /// Evaluation instant; `None` means wall clock.
    pub at: Option<DateTime<Utc>>,
}

/// Outcome of a decision, with the controlling rule named in `reason`.
#[derive(Debug, Clone)]
pub struct Decision {
    pub effect: Effect,
    pub reason: String,
    pub matched_policy_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        self.effect == Effect::Allow
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            effect: Effect::Deny,
            reason: reason.into(),
            matched_policy_id: None,
            expires_at: None,
        }
    }
}

struct CachedVerdict {
    allowed: bool,
    at: Instant,
}

pub struct PolicyEngine {
    policies: tokio::sync::RwLock<Vec<Policy>>,
    ledger: Option<Arc<LedgerGateway>>,
    /// (record_id, subject) -> last ledger verdict.
    decision_cache: DashMap<(String, String), CachedVerdict>,
    cache_ttl: Duration,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            policies: tokio::sync::RwLock::new(Vec::new()),
            ledger: None,
            decision_cache: DashMap::new(),
            cache_ttl: env_millis("POLICY_DECISION_CACHE_MS", 1000),
        }
    }

    /// Attach the ledger gateway enabling the record ACL overlay.
    pub fn with_ledger(mut self, ledger: Arc<LedgerGateway>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Baseline policy set: authenticated access to records is allowed
    /// locally and the ledger ACL is the deciding overlay.
    pub async fn install_default_policies(&self) {
        self.set_policies(vec![Policy {
            id: "default-record-access".to_string(),
            priority: 0,
            effect: Effect::Allow,
            subjects: Match::any(),
            actions: Match::AnyOf(vec!["read".into(), "write".into(), "admin".into()]),
            resources: Match::One("record:*".to_string()),
            condition: ConditionSet::default(),
            is_active: true,
        }])
        .await;
    }

    pub async fn set_policies(&self, policies: Vec<Policy>) {
        let mut guard = self.policies.write().await;
        *guard = policies;
        Self::sort(&mut guard);
    }

    pub async fn upsert_policy(&self, policy: Policy) -> Result<(), PolicyError> {
        if policy.id.is_empty() {
            return Err(PolicyError::InvalidPolicy("policy id is empty".into()));
        }
        let mut guard = self.policies.write().await;
        guard.retain(|p| p.id != policy.id);
        guard.push(policy);
        Self::sort(&mut guard);
        Ok(())
    }

    pub async fn remove_policy(&self, id: &str) -> Result<(), PolicyError> {
        let mut guard = self.policies.write().await;
        let before = guard.len();
        guard.retain(|p| p.id != id);
        if guard.len() == before {
            return Err(PolicyError::PolicyNotFound(id.to_string()));
        }
        Ok(())
    }

    fn sort(policies: &mut [Policy]) {
        // Priority descending; DENY ahead of ALLOW within a priority.
        policies.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| match (a.effect, b.effect) {
                    (Effect::Deny, Effect::Allow) => std::cmp::Ordering::Less,
                    (Effect::Allow, Effect::Deny) => std::cmp::Ordering::Greater,
                    _ => std::cmp::Ordering::Equal,
                })
        });
    }

    /// Evaluate `(subject, action, resource)` under the installed policies,
    /// then overlay the ledger ACL for record resources.
    pub async fn decide(
        &self,
        subject: &str,
        action: &str,
        resource: &Resource,
        attrs: &RequestAttrs,
    ) -> Decision {
        let local = self.decide_local(subject, action, resource, attrs).await;
        if !local.is_allow() || resource.class != "record" {
            return local;
        }
        match self.ledger_allows(&resource.id, subject).await {
            Some(true) | None => local,
            Some(false) => {
                debug!(subject, record = %resource.id, "local allow overridden by ledger");
                Decision::deny("ledger_deny")
            }
        }
    }

    async fn decide_local(
        &self,
        subject: &str,
        action: &str,
        resource: &Resource,
        attrs: &RequestAttrs,
    ) -> Decision {
        let now = attrs.at.unwrap_or_else(Utc::now);
        let qualified = resource.qualified();
        let policies = self.policies.read().await;
        for policy in policies.iter().filter(|p| p.is_active) {
            if policy.subjects.matches(subject)
                && policy.actions.matches(action)
                && policy.resources.matches(&qualified)
                && policy.condition.holds(attrs, now)
            {
                return Decision {
                    effect: policy.effect,
                    reason: policy.id.clone(),
                    matched_policy_id: Some(policy.id.clone()),
                    expires_at: attrs.grant_expires_at,
                };
            }
        }
        Decision::deny("no_match")
    }

    /// Consult the ledger ACL, caching the verdict for the decision window.
    /// `None` means no ledger is attached; errors fail closed as a deny.
    async fn ledger_allows(&self, record_id: &str, subject: &str) -> Option<bool> {
        let ledger = self.ledger.as_ref()?;
        let key = (record_id.to_string(), subject.to_string());
        if let Some(cached) = self.decision_cache.get(&key) {
            if cached.at.elapsed() < self.cache_ttl {
                return Some(cached.allowed);
            }
        }
        let allowed = match ledger
            .evaluate(
                "CheckAccess",
                &[record_id.to_string(), subject.to_string()],
            )
            .await
        {
            Ok(raw) => raw == b"true",
            Err(e) => {
                warn!(record = record_id, subject, error = %e, "CheckAccess failed; denying");
                false
            }
        };
        self.decision_cache.insert(
            key,
            CachedVerdict {
                allowed,
                at: Instant::now(),
            },
        );
        Some(allowed)
    }

    /// Drop cached verdicts for a record (optionally a single subject).
    /// Called by the event fan-out on grant/revoke.
    pub fn invalidate(&self, record_id: &str, subject: Option<&str>) {
        match subject {
            Some(subject) => {
                self.decision_cache
                    .remove(&(record_id.to_string(), subject.to_string()));
            }
            None => {
                self.decision_cache.retain(|(record, _), _| record != record_id);
            }
        }
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

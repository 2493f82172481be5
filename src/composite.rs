//! # Composite Rate Limits
//!
//! A composite limit runs several sub-limiters for one request and combines
//! their verdicts under a chosen logic:
//!
//! | Logic              | Passes when                                      |
//! |--------------------|--------------------------------------------------|
//! | `ALL_MUST_PASS`    | every sub-limiter allows                         |
//! | `ANY_CAN_PASS`     | at least one sub-limiter allows                  |
//! | `WEIGHTED_AVERAGE` | Σ wᵢ·allowedᵢ / Σ wᵢ > 0.5                       |
//! | `HIERARCHICAL_AND` | USER → TENANT → GLOBAL, stop at first denial     |
//! | `PRIORITY_BASED`   | highest priority first, stop at first denial     |
//!
//! Evaluation is two-phase so a denied composite has **no net effect** on
//! any sub-limiter: phase one is a non-mutating `check` of each consulted
//! sub-limiter, and only if the aggregate allows does phase two commit with
//! `apply`. A commit that loses a race (tokens taken between the phases) is
//! compensated by `credit`-ing the sub-limiters already committed. Logics
//! that may short-circuit never consult (and therefore never charge) the
//! sub-limiters after the stopping point.

use crate::error::{Error, Result};
use crate::limits::RateLimitConfig;
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const SCOPE_USER: &str = "USER";
pub const SCOPE_TENANT: &str = "TENANT";
pub const SCOPE_GLOBAL: &str = "GLOBAL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CombinationLogic {
    AllMustPass,
    AnyCanPass,
    WeightedAverage,
    HierarchicalAnd,
    PriorityBased,
}

/// One sub-limit of a composite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubLimit {
    pub name: String,
    pub limits: RateLimitConfig,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub priority: i32,
    /// Storage-key template; `{key}` expands to the incoming key. Defaults
    /// to `<name>:<key>` so sub-limiters never share bucket state.
    #[serde(default)]
    pub key_template: Option<String>,
}

fn default_scope() -> String {
    SCOPE_USER.to_string()
}

fn default_weight() -> f64 {
    1.0
}

impl SubLimit {
    fn storage_key(&self, key: &str) -> String {
        match &self.key_template {
            Some(template) => template.replace("{key}", key),
            None => format!("{}:{}", self.name, key),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeConfig {
    pub logic: CombinationLogic,
    pub limits: Vec<SubLimit>,
}

impl CompositeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.limits.is_empty() {
            return Err(Error::InvalidInput(
                "composite config needs at least one sub-limit".to_string(),
            ));
        }
        let mut names = std::collections::HashSet::new();
        for sub in &self.limits {
            if sub.name.is_empty() {
                return Err(Error::InvalidInput(
                    "sub-limit names must be non-empty".to_string(),
                ));
            }
            if !names.insert(sub.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate sub-limit name '{}'",
                    sub.name
                )));
            }
            if sub.weight < 0.0 || !sub.weight.is_finite() {
                return Err(Error::InvalidInput(format!(
                    "sub-limit '{}' has an invalid weight",
                    sub.name
                )));
            }
            sub.limits.validate()?;
        }
        if self.logic == CombinationLogic::WeightedAverage
            && self.limits.iter().map(|s| s.weight).sum::<f64>() <= 0.0
        {
            return Err(Error::InvalidInput(
                "weighted average needs a positive total weight".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-component verdict carried in the response.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentResult {
    pub name: String,
    pub allowed: bool,
    pub current_tokens: u64,
    pub capacity: u64,
    pub scope: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompositeOutcome {
    pub allowed: bool,
    pub retry_after_ms: u64,
    pub components: Vec<ComponentResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limiting_component: Option<String>,
}

struct Checked<'a> {
    sub: &'a SubLimit,
    storage_key: String,
    allowed: bool,
    remaining: u64,
    retry_after_ms: u64,
}

pub struct CompositeLimiter {
    store: Arc<Store>,
}

impl CompositeLimiter {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn try_consume(
        &self,
        key: &str,
        n: u64,
        config: &CompositeConfig,
        now_ns: u64,
    ) -> Result<CompositeOutcome> {
        config.validate()?;
        let order = evaluation_order(config)?;

        // phase one: non-mutating checks, honoring each logic's
        // short-circuit and stop rules
        let mut checked: Vec<Checked<'_>> = Vec::with_capacity(order.len());
        for sub in &order {
            let storage_key = sub.storage_key(key);
            let outcome = self.store.check(&storage_key, &sub.limits, n, now_ns).await?;
            // report availability before consumption: the dry run answers
            // with the post-consume remainder for allowed entries
            let available = if outcome.allowed {
                outcome.remaining + n
            } else {
                outcome.remaining
            };
            checked.push(Checked {
                sub,
                storage_key,
                allowed: outcome.allowed,
                remaining: available,
                retry_after_ms: outcome.retry_after_ms,
            });
            let stop = match config.logic {
                CombinationLogic::AllMustPass
                | CombinationLogic::HierarchicalAnd
                | CombinationLogic::PriorityBased => !outcome.allowed,
                CombinationLogic::AnyCanPass => outcome.allowed,
                CombinationLogic::WeightedAverage => false,
            };
            if stop {
                break;
            }
        }

        let aggregate_allows = match config.logic {
            CombinationLogic::AllMustPass
            | CombinationLogic::HierarchicalAnd
            | CombinationLogic::PriorityBased => checked.iter().all(|c| c.allowed),
            CombinationLogic::AnyCanPass => checked.iter().any(|c| c.allowed),
            CombinationLogic::WeightedAverage => {
                let total: f64 = checked.iter().map(|c| c.sub.weight).sum();
                let passed: f64 = checked
                    .iter()
                    .filter(|c| c.allowed)
                    .map(|c| c.sub.weight)
                    .sum();
                passed / total > 0.5
            }
        };

        if !aggregate_allows {
            let limiting = checked.iter().find(|c| !c.allowed);
            return Ok(CompositeOutcome {
                allowed: false,
                retry_after_ms: limiting.map(|c| c.retry_after_ms).unwrap_or(0),
                components: checked.iter().map(component_result).collect(),
                limiting_component: limiting.map(|c| c.sub.name.clone()),
            });
        }

        // phase two: commit the consuming set. For ANY_CAN_PASS and
        // WEIGHTED_AVERAGE only the sub-limiters that allowed consume; the
        // stop-at-denial logics reach here with every member allowed.
        let mut committed: Vec<&Checked<'_>> = Vec::with_capacity(checked.len());
        let mut results: Vec<ComponentResult> = Vec::with_capacity(checked.len());
        for entry in &checked {
            if !entry.allowed {
                results.push(component_result(entry));
                continue;
            }
            let outcome = self
                .store
                .apply(&entry.storage_key, &entry.sub.limits, n, now_ns)
                .await?;
            if !outcome.allowed {
                // lost the race between check and commit: undo and deny
                for done in &committed {
                    self.store
                        .credit(&done.storage_key, &done.sub.limits, n, now_ns)
                        .await?;
                }
                tracing::debug!(
                    key = %key,
                    component = %entry.sub.name,
                    "composite commit lost a race; compensated"
                );
                let mut results: Vec<ComponentResult> =
                    checked.iter().map(component_result).collect();
                if let Some(result) = results.iter_mut().find(|r| r.name == entry.sub.name) {
                    result.allowed = false;
                    result.current_tokens = outcome.remaining;
                }
                return Ok(CompositeOutcome {
                    allowed: false,
                    retry_after_ms: outcome.retry_after_ms,
                    components: results,
                    limiting_component: Some(entry.sub.name.clone()),
                });
            }
            committed.push(entry);
            results.push(ComponentResult {
                name: entry.sub.name.clone(),
                allowed: true,
                current_tokens: outcome.remaining,
                capacity: entry.sub.limits.capacity,
                scope: entry.sub.scope.clone(),
            });
        }

        Ok(CompositeOutcome {
            allowed: true,
            retry_after_ms: 0,
            components: results,
            limiting_component: None,
        })
    }
}

fn component_result(entry: &Checked<'_>) -> ComponentResult {
    ComponentResult {
        name: entry.sub.name.clone(),
        allowed: entry.allowed,
        current_tokens: entry.remaining,
        capacity: entry.sub.limits.capacity,
        scope: entry.sub.scope.clone(),
    }
}

fn scope_rank(scope: &str) -> Option<u8> {
    match scope {
        SCOPE_USER => Some(0),
        SCOPE_TENANT => Some(1),
        SCOPE_GLOBAL => Some(2),
        _ => None,
    }
}

/// The order sub-limiters are consulted in, per logic.
fn evaluation_order(config: &CompositeConfig) -> Result<Vec<&SubLimit>> {
    let mut order: Vec<&SubLimit> = config.limits.iter().collect();
    match config.logic {
        CombinationLogic::HierarchicalAnd => {
            for sub in &order {
                if scope_rank(&sub.scope).is_none() {
                    return Err(Error::Conflict {
                        component: sub.name.clone(),
                        message: format!("unknown scope '{}' in hierarchical logic", sub.scope),
                    });
                }
            }
            order.sort_by_key(|sub| scope_rank(&sub.scope).unwrap_or(u8::MAX));
        }
        CombinationLogic::PriorityBased => {
            order.sort_by(|a, b| b.priority.cmp(&a.priority));
        }
        _ => {}
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::Algorithm;
    use crate::store::MemoryStore;

    fn store() -> Arc<Store> {
        Arc::new(Store::Memory(MemoryStore::with_shards(4, u64::MAX)))
    }

    fn sub(name: &str, capacity: u64) -> SubLimit {
        SubLimit {
            name: name.to_string(),
            limits: RateLimitConfig::new(capacity, 1, Algorithm::TokenBucket),
            scope: SCOPE_USER.to_string(),
            weight: 1.0,
            priority: 0,
            key_template: None,
        }
    }

    #[tokio::test]
    async fn test_all_must_pass_charges_only_on_aggregate_allow() {
        let store = store();
        let limiter = CompositeLimiter::new(Arc::clone(&store));
        let config = CompositeConfig {
            logic: CombinationLogic::AllMustPass,
            limits: vec![sub("l1", 10), sub("l2", 2)],
        };

        let mut denials = 0;
        for _ in 0..5 {
            let outcome = limiter.try_consume("k", 1, &config, 0).await.unwrap();
            if !outcome.allowed {
                denials += 1;
                assert_eq!(outcome.limiting_component.as_deref(), Some("l2"));
            }
        }
        assert_eq!(denials, 3);

        // the wide limiter was charged only for the two allowed requests
        let outcome = store
            .check("l1:k", &sub("l1", 10).limits, 0, 0)
            .await
            .unwrap();
        assert_eq!(outcome.remaining, 8);
    }

    #[tokio::test]
    async fn test_denied_composite_has_no_net_effect() {
        let store = store();
        let limiter = CompositeLimiter::new(Arc::clone(&store));
        let config = CompositeConfig {
            logic: CombinationLogic::AllMustPass,
            limits: vec![sub("wide", 10), sub("narrow", 1)],
        };

        limiter.try_consume("k", 1, &config, 0).await.unwrap();
        let before = store
            .check("wide:k", &sub("wide", 10).limits, 0, 0)
            .await
            .unwrap()
            .remaining;

        let denied = limiter.try_consume("k", 1, &config, 0).await.unwrap();
        assert!(!denied.allowed);

        let after = store
            .check("wide:k", &sub("wide", 10).limits, 0, 0)
            .await
            .unwrap()
            .remaining;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_any_can_pass_stops_at_first_allow() {
        let store = store();
        let limiter = CompositeLimiter::new(Arc::clone(&store));
        let config = CompositeConfig {
            logic: CombinationLogic::AnyCanPass,
            limits: vec![sub("first", 1), sub("second", 5)],
        };

        // first request satisfied by "first"; "second" is never consulted
        let outcome = limiter.try_consume("k", 1, &config, 0).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.components.len(), 1);
        let second_state = store
            .check("second:k", &sub("second", 5).limits, 0, 0)
            .await
            .unwrap();
        assert_eq!(second_state.remaining, 5);

        // "first" exhausted: the second carries it
        let outcome = limiter.try_consume("k", 1, &config, 0).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.components.len(), 2);
    }

    #[tokio::test]
    async fn test_weighted_average_majority_wins() {
        let store = store();
        let limiter = CompositeLimiter::new(Arc::clone(&store));
        let mut heavy = sub("heavy", 5);
        heavy.weight = 3.0;
        let mut light = sub("light", 1);
        light.weight = 1.0;
        let config = CompositeConfig {
            logic: CombinationLogic::WeightedAverage,
            limits: vec![heavy, light],
        };

        // both pass first; then light is exhausted but heavy's weight
        // (3 of 4 = 0.75) still carries the aggregate
        assert!(limiter.try_consume("k", 1, &config, 0).await.unwrap().allowed);
        let outcome = limiter.try_consume("k", 1, &config, 0).await.unwrap();
        assert!(outcome.allowed);
        // the exhausted light component did not consume
        let light_state = store
            .check("light:k", &sub("light", 1).limits, 0, 0)
            .await
            .unwrap();
        assert_eq!(light_state.remaining, 0);
    }

    #[tokio::test]
    async fn test_weighted_average_fails_below_majority() {
        let store = store();
        let limiter = CompositeLimiter::new(Arc::clone(&store));
        let mut light = sub("light", 5);
        light.weight = 1.0;
        let mut heavy = sub("heavy", 1);
        heavy.weight = 3.0;
        let config = CompositeConfig {
            logic: CombinationLogic::WeightedAverage,
            limits: vec![light, heavy],
        };

        assert!(limiter.try_consume("k", 1, &config, 0).await.unwrap().allowed);
        // heavy exhausted: only 1 of 4 weight passes
        let outcome = limiter.try_consume("k", 1, &config, 0).await.unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.limiting_component.as_deref(), Some("heavy"));
    }

    #[tokio::test]
    async fn test_hierarchical_orders_user_tenant_global() {
        let store = store();
        let limiter = CompositeLimiter::new(Arc::clone(&store));
        let mut global = sub("global", 10);
        global.scope = SCOPE_GLOBAL.to_string();
        let mut user = sub("user", 1);
        user.scope = SCOPE_USER.to_string();
        let config = CompositeConfig {
            logic: CombinationLogic::HierarchicalAnd,
            // listed out of order on purpose
            limits: vec![global, user],
        };

        limiter.try_consume("k", 1, &config, 0).await.unwrap();
        let outcome = limiter.try_consume("k", 1, &config, 0).await.unwrap();
        assert!(!outcome.allowed);
        // user scope is evaluated first, so it is the limiting component
        assert_eq!(outcome.limiting_component.as_deref(), Some("user"));
        // and the global limiter was not consulted after the denial
        let global_state = store
            .check("global:k", &sub("global", 10).limits, 0, 0)
            .await
            .unwrap();
        assert_eq!(global_state.remaining, 9);
    }

    #[tokio::test]
    async fn test_hierarchical_rejects_unknown_scope() {
        let store = store();
        let limiter = CompositeLimiter::new(store);
        let mut odd = sub("odd", 5);
        odd.scope = "REGION".to_string();
        let config = CompositeConfig {
            logic: CombinationLogic::HierarchicalAnd,
            limits: vec![odd],
        };
        let err = limiter.try_consume("k", 1, &config, 0).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_priority_based_evaluates_highest_first() {
        let store = store();
        let limiter = CompositeLimiter::new(Arc::clone(&store));
        let mut critical = sub("critical", 1);
        critical.priority = 10;
        let mut background = sub("background", 10);
        background.priority = 1;
        let config = CompositeConfig {
            logic: CombinationLogic::PriorityBased,
            limits: vec![background, critical],
        };

        limiter.try_consume("k", 1, &config, 0).await.unwrap();
        let outcome = limiter.try_consume("k", 1, &config, 0).await.unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.limiting_component.as_deref(), Some("critical"));
    }

    #[tokio::test]
    async fn test_empty_config_rejected() {
        let store = store();
        let limiter = CompositeLimiter::new(store);
        let config = CompositeConfig {
            logic: CombinationLogic::AllMustPass,
            limits: vec![],
        };
        assert!(limiter.try_consume("k", 1, &config, 0).await.is_err());
    }
}

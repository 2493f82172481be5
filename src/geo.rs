//! Geographic rate limit rules.
//!
//! A geo rule overlays a limit on keys arriving from a given country,
//! region, or compliance zone. Location is furnished by the request context
//! (extracted upstream from CDN headers); this module only does exact
//! matching with a priority tie-break. A request without a location simply
//! skips the overlay.

use crate::error::{Error, Result};
use crate::limits::RateLimitConfig;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Where a request came from, as far as the service cares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub compliance_zone: Option<String>,
}

impl GeoLocation {
    pub fn is_empty(&self) -> bool {
        self.country_code.is_none() && self.region.is_none() && self.compliance_zone.is_none()
    }

    /// Builds a location from a CDN-style header bundle. Used by the geo
    /// test endpoint and by requests that do not carry explicit fields.
    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        let country_code = headers
            .get("cf-ipcountry")
            .or_else(|| headers.get("x-country-code"))
            .map(|c| c.to_uppercase());
        let region = headers
            .get("cf-region")
            .or_else(|| headers.get("x-region"))
            .cloned();
        let compliance_zone = country_code.as_deref().and_then(derive_compliance_zone);
        Self {
            country_code,
            region,
            compliance_zone,
        }
    }

    /// Cache fingerprint component; two requests with the same location
    /// resolve identically.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}",
            self.country_code.as_deref().unwrap_or(""),
            self.region.as_deref().unwrap_or(""),
            self.compliance_zone.as_deref().unwrap_or("")
        )
    }
}

/// Maps a country code to its legal-regime tag, when one applies.
pub fn derive_compliance_zone(country: &str) -> Option<String> {
    const EU: &[&str] = &[
        "AT", "BE", "BG", "HR", "CY", "CZ", "DK", "EE", "FI", "FR", "DE", "GR", "HU", "IE", "IT",
        "LV", "LT", "LU", "MT", "NL", "PL", "PT", "RO", "SK", "SI", "ES", "SE",
    ];
    if EU.contains(&country) {
        Some("GDPR".to_string())
    } else {
        None
    }
}

/// A location-scoped rate limit overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoRule {
    pub id: Uuid,
    pub key_pattern: String,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub compliance_zone: Option<String>,
    pub limits: RateLimitConfig,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

struct CompiledGeoRule {
    rule: GeoRule,
    matcher: GlobMatcher,
}

/// Owns the geo rules; the resolver consults it read-only.
pub struct GeoManager {
    rules: RwLock<Vec<CompiledGeoRule>>,
}

impl GeoManager {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
        }
    }

    /// Validates and stores a rule; replaces any rule with the same id.
    pub fn upsert(&self, rule: GeoRule) -> Result<Uuid> {
        if rule.country_code.is_none() && rule.region.is_none() && rule.compliance_zone.is_none() {
            return Err(Error::InvalidInput(
                "geo rule needs at least one of country_code, region, compliance_zone".to_string(),
            ));
        }
        if let (Some(from), Some(until)) = (rule.valid_from, rule.valid_until) {
            if from >= until {
                return Err(Error::InvalidInput(
                    "geo rule valid_from must precede valid_until".to_string(),
                ));
            }
        }
        rule.limits.validate()?;
        let matcher = Glob::new(&rule.key_pattern)
            .map_err(|e| Error::InvalidInput(format!("bad key pattern: {}", e)))?
            .compile_matcher();

        let id = rule.id;
        let mut rules = self.rules.write();
        rules.retain(|c| c.rule.id != id);
        rules.push(CompiledGeoRule { rule, matcher });
        tracing::info!(rule_id = %id, "geo rule stored");
        Ok(id)
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|c| c.rule.id != id);
        rules.len() != before
    }

    pub fn list(&self) -> Vec<GeoRule> {
        self.rules.read().iter().map(|c| c.rule.clone()).collect()
    }

    /// Highest-priority enabled rule matching key and location, if any.
    /// An absent location disables the overlay entirely.
    pub fn resolve(
        &self,
        key: &str,
        location: &GeoLocation,
        now: DateTime<Utc>,
    ) -> Option<(Uuid, RateLimitConfig)> {
        if location.is_empty() {
            return None;
        }
        let rules = self.rules.read();
        rules
            .iter()
            .filter(|c| c.rule.enabled)
            .filter(|c| c.rule.valid_from.map_or(true, |from| now >= from))
            .filter(|c| c.rule.valid_until.map_or(true, |until| now < until))
            .filter(|c| c.matcher.is_match(key))
            .filter(|c| criteria_match(&c.rule, location))
            .min_by(|a, b| {
                b.rule
                    .priority
                    .cmp(&a.rule.priority)
                    .then(a.rule.created_at.cmp(&b.rule.created_at))
            })
            .map(|c| (c.rule.id, c.rule.limits.clone()))
    }
}

impl Default for GeoManager {
    fn default() -> Self {
        Self::new()
    }
}

fn criteria_match(rule: &GeoRule, location: &GeoLocation) -> bool {
    if let Some(country) = &rule.country_code {
        if location.country_code.as_deref() != Some(country.as_str()) {
            return false;
        }
    }
    if let Some(region) = &rule.region {
        if location.region.as_deref() != Some(region.as_str()) {
            return false;
        }
    }
    if let Some(zone) = &rule.compliance_zone {
        if location.compliance_zone.as_deref() != Some(zone.as_str()) {
            return false;
        }
    }
    true
}

//! Declarative compliance rules
//!
//! Each [`ComplianceRule`] inspects a [`RuleContext`] snapshot of observed
//! behavior and yields a [`RuleResult`]. A [`ComplianceReport`] ranks the
//! results by the most severe failure.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ComplianceConfig;

/// Rate-limit horizon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Horizon {
    Minute,
    Hour,
    Day,
}

impl Horizon {
    pub const ALL: [Horizon; 3] = [Horizon::Minute, Horizon::Hour, Horizon::Day];

    pub fn duration(&self) -> Duration {
        match self {
            Horizon::Minute => Duration::from_secs(60),
            Horizon::Hour => Duration::from_secs(3_600),
            Horizon::Day => Duration::from_secs(86_400),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Horizon::Minute => "minute",
            Horizon::Hour => "hour",
            Horizon::Day => "day",
        }
    }
}

impl std::fmt::Display for Horizon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compliance level, ordered by severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    #[default]
    Compliant,
    Warning,
    Violation,
}

/// What a rule checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RuleKind {
    /// Sends within a horizon: warning at `warning_ratio * limit`, violation at `limit`
    RateThreshold {
        horizon: Horizon,
        limit: usize,
        warning_ratio: f64,
    },
    /// Sending on a connection younger than `min_uptime_ms`
    MinimumUptime { min_uptime_ms: u64 },
    /// Inter-send intervals too regular to be human
    ActivityPattern { min_cv: f64, min_samples: usize },
}

/// A named rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceRule {
    pub id: String,
    pub description: String,
    pub kind: RuleKind,
}

/// Per-horizon send count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HorizonCount {
    pub horizon: Horizon,
    pub count: usize,
}

/// Observed behavior evaluated by the rules
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleContext {
    pub counts: Vec<HorizonCount>,
    pub connected: bool,
    pub uptime: Option<Duration>,
    /// Recent inter-send intervals
    pub intervals: Vec<Duration>,
}

impl RuleContext {
    fn count(&self, horizon: Horizon) -> usize {
        self.counts
            .iter()
            .find(|c| c.horizon == horizon)
            .map(|c| c.count)
            .unwrap_or(0)
    }
}

/// Outcome of one rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule_id: String,
    pub passed: bool,
    pub severity: ComplianceStatus,
    pub message: String,
    pub recommendation: Option<String>,
}

impl RuleResult {
    fn pass(rule: &ComplianceRule, message: String) -> Self {
        Self {
            rule_id: rule.id.clone(),
            passed: true,
            severity: ComplianceStatus::Compliant,
            message,
            recommendation: None,
        }
    }

    fn fail(
        rule: &ComplianceRule,
        severity: ComplianceStatus,
        message: String,
        recommendation: &str,
    ) -> Self {
        Self {
            rule_id: rule.id.clone(),
            passed: false,
            severity,
            message,
            recommendation: Some(recommendation.to_string()),
        }
    }
}

impl ComplianceRule {
    /// Evaluate against observed behavior
    pub fn evaluate(&self, ctx: &RuleContext) -> RuleResult {
        match &self.kind {
            RuleKind::RateThreshold {
                horizon,
                limit,
                warning_ratio,
            } => {
                let count = ctx.count(*horizon);
                let warn_at = (*limit as f64 * warning_ratio).ceil() as usize;
                let message = format!("{} sends in the last {} (limit {})", count, horizon, limit);
                if count >= *limit {
                    RuleResult::fail(
                        self,
                        ComplianceStatus::Violation,
                        message,
                        "Pause sending until the rate window clears",
                    )
                } else if count >= warn_at {
                    RuleResult::fail(
                        self,
                        ComplianceStatus::Warning,
                        message,
                        "Reduce sending rate",
                    )
                } else {
                    RuleResult::pass(self, message)
                }
            }
            RuleKind::MinimumUptime { min_uptime_ms } => {
                let min_uptime = Duration::from_millis(*min_uptime_ms);
                let uptime = ctx.uptime.unwrap_or_default();
                let sending = ctx.count(Horizon::Minute) > 0;
                if sending && (!ctx.connected || uptime < min_uptime) {
                    RuleResult::fail(
                        self,
                        ComplianceStatus::Warning,
                        format!(
                            "Sending on a connection up for {}s (minimum {}s)",
                            uptime.as_secs(),
                            min_uptime.as_secs()
                        ),
                        "Let the connection stabilize before sending",
                    )
                } else {
                    RuleResult::pass(self, format!("Connection up for {}s", uptime.as_secs()))
                }
            }
            RuleKind::ActivityPattern {
                min_cv,
                min_samples,
            } => {
                if ctx.intervals.len() < *min_samples {
                    return RuleResult::pass(
                        self,
                        format!(
                            "{} interval samples, {} required",
                            ctx.intervals.len(),
                            min_samples
                        ),
                    );
                }
                let cv = coefficient_of_variation(&ctx.intervals);
                let message = format!("Send interval variation {:.3}", cv);
                if cv < *min_cv {
                    RuleResult::fail(
                        self,
                        ComplianceStatus::Warning,
                        message,
                        "Randomize timing between sends",
                    )
                } else {
                    RuleResult::pass(self, message)
                }
            }
        }
    }
}

/// Standard deviation over mean; zero for empty or zero-mean samples
pub fn coefficient_of_variation(samples: &[Duration]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let values: Vec<f64> = samples.iter().map(|d| d.as_secs_f64()).collect();
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if mean <= f64::EPSILON {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() / mean
}

/// The default rule set derived from configuration
pub fn default_rules(config: &ComplianceConfig) -> Vec<ComplianceRule> {
    let limits = [
        (Horizon::Minute, config.minute_limit),
        (Horizon::Hour, config.hour_limit),
        (Horizon::Day, config.day_limit),
    ];

    let mut rules: Vec<ComplianceRule> = limits
        .into_iter()
        .map(|(horizon, limit)| ComplianceRule {
            id: format!("rate_{}", horizon),
            description: format!("Sends per {} stay below {}", horizon, limit),
            kind: RuleKind::RateThreshold {
                horizon,
                limit,
                warning_ratio: config.warning_ratio,
            },
        })
        .collect();

    rules.push(ComplianceRule {
        id: "minimum_uptime".to_string(),
        description: "Connection is stable before sending".to_string(),
        kind: RuleKind::MinimumUptime {
            min_uptime_ms: config.min_uptime_ms,
        },
    });
    rules.push(ComplianceRule {
        id: "activity_pattern".to_string(),
        description: "Send timing is not machine-regular".to_string(),
        kind: RuleKind::ActivityPattern {
            min_cv: config.min_interval_cv,
            min_samples: config.min_pattern_samples,
        },
    });

    rules
}

/// Result of a compliance check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub status: ComplianceStatus,
    pub results: Vec<RuleResult>,
    /// Deduplicated, in rule order
    pub recommendations: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ComplianceReport {
    pub fn from_results(results: Vec<RuleResult>) -> Self {
        let status = results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.severity)
            .max()
            .unwrap_or(ComplianceStatus::Compliant);

        let mut recommendations: Vec<String> = Vec::new();
        for rec in results.iter().filter_map(|r| r.recommendation.as_ref()) {
            if !recommendations.contains(rec) {
                recommendations.push(rec.clone());
            }
        }

        Self {
            status,
            results,
            recommendations,
            timestamp: Utc::now(),
        }
    }

    pub fn is_compliant(&self) -> bool {
        self.status == ComplianceStatus::Compliant
    }

    pub fn failed(&self) -> impl Iterator<Item = &RuleResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

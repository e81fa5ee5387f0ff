//! Protocol compliance
//!
//! Rate windows, declarative rules and the [`ComplianceGuard`] that applies
//! them to outbound sends.

pub mod guard;
pub mod rules;
pub mod window;

pub use guard::{ComplianceGuard, HorizonStatus, RateLimitStatus, SendDecision};
pub use rules::{ComplianceReport, ComplianceRule, ComplianceStatus, Horizon, RuleKind, RuleResult};
pub use window::RateWindow;

//! Admission pipeline configuration (§6 configuration surface). Rule
//! tables are loaded once and treated as immutable for the process
//! lifetime (§9 "configurable rule tables").

use bouncer_classify::{ClassifierConfig, ComplianceRuleSet, RiskRuleSet};
use bouncer_ratelimit::RateLimitConfig;
use chrono::Duration;

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub classifier: ClassifierConfig,
    pub compliance: ComplianceRuleSet,
    pub risk: RiskRuleSet,
    pub rate_limit: RateLimitConfig,
    pub approval_expiry: Duration,
    pub result_truncate_chars: usize,
    pub page_size_chars: usize,
    /// How long an overflow page stays retrievable via `GetPage` (§4.12).
    pub page_ttl: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            classifier: ClassifierConfig::default(),
            compliance: ComplianceRuleSet::default(),
            risk: RiskRuleSet::default(),
            rate_limit: RateLimitConfig {
                window: Duration::seconds(60),
                limit: 30,
            },
            approval_expiry: Duration::seconds(300),
            result_truncate_chars: 1000,
            page_size_chars: 3500,
            page_ttl: Duration::minutes(15),
        }
    }
}

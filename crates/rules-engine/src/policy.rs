use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use glob::glob;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_core::EventType;

use crate::{
    rule::{Metadata, Rule},
    ruleset::{RuleError, RuleSet},
};

const RULE_EXTENSION: &str = "yaml";

/// Rule as written in a policy file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRule {
    pub id: String,
    pub r#type: String,
    pub expression: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub severity: Option<String>,
}

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("policies directory {0} not found")]
    MissingDirectory(PathBuf),
    #[error("error listing policies: {0}")]
    RuleListing(#[from] glob::PatternError),
    #[error("error reading policy: {name}")]
    RuleLoading {
        name: String,
        #[source]
        error: std::io::Error,
    },
    #[error("error parsing policy file: {filename}")]
    RuleParsing {
        filename: String,
        #[source]
        error: serde_yaml::Error,
    },
    #[error("rule '{id}' in {filename}: event type '{event_type}' not found")]
    EventTypeNotFound {
        filename: String,
        id: String,
        event_type: String,
    },
    #[error("invalid rule in {filename}")]
    Rule {
        filename: String,
        #[source]
        error: RuleError,
    },
}

/// Source of rules for a [`RuleSet`].
pub trait PolicyLoader: Send + Sync {
    fn load_policies(&self, rule_set: &mut RuleSet) -> Result<(), PolicyError>;
}

/// Loads every `*.yaml` file found recursively in a directory.
#[derive(Debug, Clone)]
pub struct DirectoryPolicyLoader {
    policies_dir: PathBuf,
}

impl DirectoryPolicyLoader {
    pub fn new(policies_dir: impl Into<PathBuf>) -> Self {
        Self {
            policies_dir: policies_dir.into(),
        }
    }

    pub fn policies_dir(&self) -> &Path {
        &self.policies_dir
    }
}

impl PolicyLoader for DirectoryPolicyLoader {
    fn load_policies(&self, rule_set: &mut RuleSet) -> Result<(), PolicyError> {
        if !self.policies_dir.is_dir() {
            return Err(PolicyError::MissingDirectory(self.policies_dir.clone()));
        }

        let expr = format!("{}/**/*.{}", self.policies_dir.display(), RULE_EXTENSION);
        for path in glob(&expr)?.flatten() {
            let filename = path.display().to_string();
            log::debug!("loading policy {filename}");

            let body = fs::read_to_string(&path).map_err(|error| PolicyError::RuleLoading {
                name: filename.clone(),
                error,
            })?;

            for rule in parse_policy(&filename, &body)? {
                rule_set
                    .add_rule(rule)
                    .map_err(|error| PolicyError::Rule {
                        filename: filename.clone(),
                        error,
                    })?;
            }
        }

        Ok(())
    }
}

/// Parse the body of a policy file into rules.
pub fn parse_policy(filename: &str, body: &str) -> Result<Vec<Rule>, PolicyError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }

    let user_rules =
        serde_yaml::from_str::<Vec<UserRule>>(body).map_err(|error| PolicyError::RuleParsing {
            filename: filename.to_string(),
            error,
        })?;

    user_rules
        .into_iter()
        .map(|user_rule| {
            let event_type = EventType::from_str(&user_rule.r#type).map_err(|_| {
                PolicyError::EventTypeNotFound {
                    filename: filename.to_string(),
                    id: user_rule.id.clone(),
                    event_type: user_rule.r#type.clone(),
                }
            })?;

            Ok(
                Rule::new(user_rule.id, event_type, user_rule.expression).with_metadata(Metadata {
                    category: user_rule.category,
                    description: user_rule.description,
                    severity: user_rule.severity,
                }),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::env;

    use super::*;
    use crate::{RuleSetOpts, rule::CompileError};

    const POLICY: &str = r#"
- id: exec_from_tmp
  type: Exec
  expression: payload.filename STARTS_WITH "/tmp"
  description: Process executed from /tmp
  severity: high

- id: open_shadow
  type: FileOpened
  expression: payload.filename == "/etc/shadow" AND payload.flags != O_RDONLY
"#;

    fn temp_dir() -> PathBuf {
        let dir = env::temp_dir().join(format!("warden-policy-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn parse_user_rules() {
        let rules = parse_policy("policy.yaml", POLICY).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, "exec_from_tmp");
        assert_eq!(rules[0].event_type, EventType::Exec);
        assert_eq!(rules[0].metadata.severity.as_deref(), Some("high"));
        assert_eq!(rules[1].event_type, EventType::FileOpened);
        assert!(rules[1].metadata.description.is_none());
    }

    #[test]
    fn unknown_event_type() {
        let body = "- id: x\n  type: Mount\n  expression: header.pid == 1\n";
        assert!(matches!(
            parse_policy("policy.yaml", body),
            Err(err @ PolicyError::EventTypeNotFound { .. })
                if err.to_string() == "rule 'x' in policy.yaml: event type 'Mount' not found"
        ));
    }

    #[test]
    fn malformed_yaml() {
        assert!(matches!(
            parse_policy("policy.yaml", "- id: [unclosed"),
            Err(PolicyError::RuleParsing { .. })
        ));
    }

    #[test]
    fn load_directory_recursively() {
        let dir = temp_dir();
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("base.yaml"), POLICY).unwrap();
        fs::write(
            dir.join("nested/connect.yaml"),
            "- id: reverse_shell\n  type: Connect\n  expression: payload.port == 4444\n",
        )
        .unwrap();
        fs::write(dir.join("empty.yaml"), "").unwrap();
        fs::write(dir.join("notes.txt"), "not a policy").unwrap();

        let mut rule_set = RuleSet::new(RuleSetOpts::default());
        DirectoryPolicyLoader::new(&dir)
            .load_policies(&mut rule_set)
            .unwrap();

        let mut ids = rule_set.list_rule_ids();
        ids.sort();
        assert_eq!(ids, vec!["exec_from_tmp", "open_shadow", "reverse_shell"]);

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn duplicate_ids_across_files() {
        let dir = temp_dir();
        fs::write(dir.join("a.yaml"), POLICY).unwrap();
        fs::write(dir.join("b.yaml"), POLICY).unwrap();

        let mut rule_set = RuleSet::new(RuleSetOpts::default());
        let err = DirectoryPolicyLoader::new(&dir)
            .load_policies(&mut rule_set)
            .unwrap_err();
        assert!(matches!(
            err,
            PolicyError::Rule {
                error: RuleError::Duplicate { .. },
                ..
            }
        ));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn compile_error_reports_file() {
        let dir = temp_dir();
        fs::write(
            dir.join("bad.yaml"),
            "- id: bad\n  type: Exec\n  expression: payload.flags == 1\n",
        )
        .unwrap();

        let mut rule_set = RuleSet::new(RuleSetOpts::default());
        let err = DirectoryPolicyLoader::new(&dir)
            .load_policies(&mut rule_set)
            .unwrap_err();
        match err {
            PolicyError::Rule {
                filename,
                error: RuleError::Compile { id, error },
            } => {
                assert!(filename.ends_with("bad.yaml"));
                assert_eq!(id, "bad");
                assert!(matches!(error, CompileError::UnknownField { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_directory() {
        let mut rule_set = RuleSet::new(RuleSetOpts::default());
        let err = DirectoryPolicyLoader::new("/nonexistent/warden/policies")
            .load_policies(&mut rule_set)
            .unwrap_err();
        assert!(matches!(err, PolicyError::MissingDirectory(_)));
    }
}

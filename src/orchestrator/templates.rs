//! Convoy templates: built-in pipelines plus those declared in config.

use serde::{Deserialize, Serialize};

use crate::config::CloisterConfig;
use crate::{AppError, Result};

/// One role in a template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TemplateRole {
    /// Role name, unique within the template.
    pub role: String,
    /// Sub-agent definition the role runs as.
    pub subagent_kind: String,
}

/// A named, ordered set of roles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConvoyTemplate {
    /// Template name.
    pub name: String,
    /// Human description.
    pub description: String,
    /// Roles, spawned in this order.
    pub roles: Vec<TemplateRole>,
}

fn role(role: &str, subagent_kind: &str) -> TemplateRole {
    TemplateRole {
        role: role.to_owned(),
        subagent_kind: subagent_kind.to_owned(),
    }
}

/// Templates that ship with the supervisor.
#[must_use]
pub fn builtin_templates() -> Vec<ConvoyTemplate> {
    vec![
        ConvoyTemplate {
            name: "code-review".into(),
            description: "Parallel correctness, security and performance review with a synthesis pass"
                .into(),
            roles: vec![
                role("correctness", "code-review-correctness"),
                role("security", "code-review-security"),
                role("performance", "code-review-performance"),
                role("synthesis", "code-review-synthesis"),
            ],
        },
        ConvoyTemplate {
            name: "merge-pipeline".into(),
            description: "Test, review, then merge a change".into(),
            roles: vec![
                role("test", "test-agent"),
                role("review", "review-agent"),
                role("merge", "merge-agent"),
            ],
        },
        ConvoyTemplate {
            name: "planning".into(),
            description: "Research the codebase, then write an implementation plan".into(),
            roles: vec![
                role("explore", "planning-explorer"),
                role("plan", "planning-author"),
            ],
        },
    ]
}

/// All templates available under `config`; config entries replace
/// built-ins of the same name. Sorted by name.
#[must_use]
pub fn available_templates(config: &CloisterConfig) -> Vec<ConvoyTemplate> {
    let mut templates: Vec<ConvoyTemplate> = builtin_templates()
        .into_iter()
        .filter(|t| !config.convoy_templates.contains_key(&t.name))
        .collect();

    templates.extend(config.convoy_templates.iter().map(|(name, declared)| {
        ConvoyTemplate {
            name: name.clone(),
            description: declared.description.clone().unwrap_or_default(),
            roles: declared
                .roles
                .iter()
                .map(|r| role(&r.role, &r.subagent_kind))
                .collect(),
        }
    }));

    templates.sort_by(|a, b| a.name.cmp(&b.name));
    templates
}

/// Look up a template by name.
///
/// # Errors
///
/// Returns `AppError::TemplateNotFound` for an unknown name.
pub fn resolve(config: &CloisterConfig, name: &str) -> Result<ConvoyTemplate> {
    available_templates(config)
        .into_iter()
        .find(|t| t.name == name)
        .ok_or_else(|| AppError::TemplateNotFound(name.to_owned()))
}

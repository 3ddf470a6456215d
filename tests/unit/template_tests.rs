use cloister::config::CloisterConfig;
use cloister::orchestrator::templates::{available_templates, builtin_templates, resolve};
use cloister::AppError;

fn config(extra: &str) -> CloisterConfig {
    CloisterConfig::from_toml_str(&format!("state_dir = '/tmp/c'\n{extra}")).expect("valid")
}

#[test]
fn builtins_ship_three_pipelines() {
    let names: Vec<String> = builtin_templates().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["code-review", "merge-pipeline", "planning"]);
}

#[test]
fn code_review_roles_in_order() {
    let template = resolve(&config(""), "code-review").expect("builtin");
    let roles: Vec<&str> = template.roles.iter().map(|r| r.role.as_str()).collect();
    assert_eq!(roles, vec!["correctness", "security", "performance", "synthesis"]);
}

#[test]
fn unknown_template_is_rejected() {
    let err = resolve(&config(""), "nope").expect_err("unknown");
    assert!(matches!(err, AppError::TemplateNotFound(ref name) if name == "nope"));
}

#[test]
fn config_templates_extend_and_override() {
    let cfg = config(
        r#"
[convoy_templates.planning]
description = "Single planner"
roles = [{ role = "plan", subagent_kind = "solo-planner" }]

[convoy_templates.audit]
roles = [{ role = "deps", subagent_kind = "dep-auditor" }]
"#,
    );

    let all = available_templates(&cfg);
    let names: Vec<&str> = all.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["audit", "code-review", "merge-pipeline", "planning"]);

    let planning = resolve(&cfg, "planning").expect("overridden");
    assert_eq!(planning.description, "Single planner");
    assert_eq!(planning.roles.len(), 1);
    assert_eq!(planning.roles[0].subagent_kind, "solo-planner");

    let audit = resolve(&cfg, "audit").expect("declared");
    assert_eq!(audit.description, "");
}

//! Built-in workflow templates.
//!
//! Each template expands a list of target databases into a validated
//! [`Workflow`]. Steps that change state (migrations, restores, applied
//! optimizations, data copied into another environment) are gated behind
//! confirmation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::operation::{Backoff, Operation, RetryPolicy};
use crate::workflow::{Workflow, WorkflowError, WorkflowStep};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown workflow template: {0}")]
    UnknownTemplate(String),
    #[error("template {template} needs at least one target database")]
    NoTargets { template: &'static str },
    #[error("template {template} requires option {option}")]
    MissingOption {
        template: &'static str,
        option: &'static str,
    },
    #[error("template {template}: {reason}")]
    InvalidOption {
        template: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    DatabaseMigration,
    PerformanceOptimization,
    BackupAndRestore,
    HealthCheckSuite,
    ComplianceAudit,
    DisasterRecovery,
    MultiEnvironmentSync,
}

impl TemplateKind {
    pub const ALL: [Self; 7] = [
        Self::DatabaseMigration,
        Self::PerformanceOptimization,
        Self::BackupAndRestore,
        Self::HealthCheckSuite,
        Self::ComplianceAudit,
        Self::DisasterRecovery,
        Self::MultiEnvironmentSync,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DatabaseMigration => "database_migration",
            Self::PerformanceOptimization => "performance_optimization",
            Self::BackupAndRestore => "backup_and_restore",
            Self::HealthCheckSuite => "health_check_suite",
            Self::ComplianceAudit => "compliance_audit",
            Self::DisasterRecovery => "disaster_recovery",
            Self::MultiEnvironmentSync => "multi_environment_sync",
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateKind {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| TemplateError::UnknownTemplate(s.to_string()))
    }
}

fn default_backup_type() -> String {
    "full".to_string()
}

fn default_frameworks() -> Vec<String> {
    vec!["gdpr".to_string(), "sox".to_string()]
}

fn default_source_env() -> String {
    "production".to_string()
}

fn default_target_env() -> String {
    "staging".to_string()
}

/// Knobs shared by the templates. Most only apply to one of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateOptions {
    /// `backup_and_restore`: run the restore branch instead of a backup.
    #[serde(default)]
    pub restore: bool,
    #[serde(default = "default_backup_type")]
    pub backup_type: String,
    /// Required when `restore` is set.
    #[serde(default)]
    pub restore_file: Option<String>,
    /// `compliance_audit`: frameworks to check against.
    #[serde(default = "default_frameworks")]
    pub frameworks: Vec<String>,
    /// `multi_environment_sync`: environment copied from.
    #[serde(default = "default_source_env")]
    pub source_env: String,
    /// `multi_environment_sync`: environment copied into.
    #[serde(default = "default_target_env")]
    pub target_env: String,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self {
            restore: false,
            backup_type: default_backup_type(),
            restore_file: None,
            frameworks: default_frameworks(),
            source_env: default_source_env(),
            target_env: default_target_env(),
        }
    }
}

/// Expands `kind` for `databases` into a workflow owned by `session_id`.
///
/// # Errors
///
/// Returns [`TemplateError::NoTargets`] for an empty target list,
/// [`TemplateError::MissingOption`] when a restore has no source file or an
/// audit has no framework, and [`TemplateError::InvalidOption`] when a sync
/// would copy an environment onto itself.
pub fn instantiate(
    kind: TemplateKind,
    session_id: &str,
    databases: &[String],
    options: &TemplateOptions,
) -> Result<Workflow, TemplateError> {
    if databases.is_empty() {
        return Err(TemplateError::NoTargets {
            template: kind.as_str(),
        });
    }
    let targets = Value::from(databases.to_vec());
    let steps = match kind {
        TemplateKind::DatabaseMigration => database_migration(&targets),
        TemplateKind::PerformanceOptimization => performance_optimization(&targets),
        TemplateKind::BackupAndRestore if options.restore => restore(&targets, options)?,
        TemplateKind::BackupAndRestore => backup(&targets, options),
        TemplateKind::HealthCheckSuite => health_check_suite(&targets),
        TemplateKind::ComplianceAudit => compliance_audit(&targets, options)?,
        TemplateKind::DisasterRecovery => disaster_recovery(&targets),
        TemplateKind::MultiEnvironmentSync => environment_sync(&targets, options)?,
    };

    let mut builder = Workflow::builder().session(session_id);
    for step in steps {
        builder = builder.step(step);
    }
    Ok(builder.build()?)
}

fn read_only(name: &str, capability: &str, targets: &Value) -> Operation {
    Operation::new(name, capability)
        .with_param("databases", targets.clone())
        .idempotent(true)
}

fn mutating(name: &str, capability: &str, targets: &Value) -> Operation {
    Operation::new(name, capability).with_param("databases", targets.clone())
}

fn retried() -> RetryPolicy {
    RetryPolicy::new(2, Backoff::default())
}

fn health_check_suite(targets: &Value) -> Vec<WorkflowStep> {
    vec![
        WorkflowStep::new("connectivity", read_only("check_connectivity", "validation", targets))
            .with_retry(retried()),
        WorkflowStep::new("performance", read_only("get_performance", "performance", targets))
            .after(["connectivity"]),
        WorkflowStep::new("resources", read_only("get_resource_usage", "analytics", targets))
            .after(["connectivity"]),
        WorkflowStep::new("security", read_only("security_scan", "security", targets))
            .after(["connectivity"]),
        WorkflowStep::new("report", read_only("health_summary", "analytics", targets))
            .after(["performance", "resources", "security"]),
    ]
}

fn backup(targets: &Value, options: &TemplateOptions) -> Vec<WorkflowStep> {
    vec![
        WorkflowStep::new("validate", read_only("check_availability", "validation", targets)),
        WorkflowStep::new(
            "backup",
            Operation::new("create_backup", "backup")
                .with_param("databases", targets.clone())
                .with_param("backup_type", options.backup_type.clone()),
        )
        .after(["validate"]),
        WorkflowStep::new("verify", read_only("verify_backup", "validation", targets))
            .after(["backup"]),
    ]
}

fn restore(targets: &Value, options: &TemplateOptions) -> Result<Vec<WorkflowStep>, TemplateError> {
    let Some(file) = options.restore_file.clone() else {
        return Err(TemplateError::MissingOption {
            template: TemplateKind::BackupAndRestore.as_str(),
            option: "restore_file",
        });
    };
    Ok(vec![
        WorkflowStep::new(
            "validate",
            read_only("check_backup_file", "validation", targets).with_param("restore_file", file.clone()),
        ),
        WorkflowStep::new(
            "safety_backup",
            Operation::new("create_backup", "backup")
                .with_param("databases", targets.clone())
                .with_param("backup_type", "safety"),
        )
        .after(["validate"]),
        WorkflowStep::new(
            "restore",
            Operation::new("restore_backup", "restore")
                .with_param("databases", targets.clone())
                .with_param("restore_file", file),
        )
        .after(["safety_backup"])
        .requires_confirmation(true),
        WorkflowStep::new("verify", read_only("verify_restore", "validation", targets))
            .after(["restore"]),
    ])
}

fn database_migration(targets: &Value) -> Vec<WorkflowStep> {
    vec![
        WorkflowStep::new(
            "pre_validate",
            read_only("check_migration_readiness", "validation", targets)
                .with_param("check_connectivity", true)
                .with_param("check_permissions", true),
        )
        .with_retry(retried()),
        WorkflowStep::new(
            "backup",
            mutating("create_backup", "backup", targets).with_param("backup_type", "full"),
        )
        .after(["pre_validate"]),
        WorkflowStep::new("schema", mutating("schema_migration", "operations", targets))
            .after(["backup"])
            .requires_confirmation(true),
        WorkflowStep::new("data", mutating("data_migration", "operations", targets))
            .after(["schema"]),
        WorkflowStep::new(
            "post_validate",
            read_only("verify_migration", "validation", targets).with_param("verify_data_integrity", true),
        )
        .after(["data"]),
    ]
}

fn compliance_audit(
    targets: &Value,
    options: &TemplateOptions,
) -> Result<Vec<WorkflowStep>, TemplateError> {
    if options.frameworks.is_empty() {
        return Err(TemplateError::MissingOption {
            template: TemplateKind::ComplianceAudit.as_str(),
            option: "frameworks",
        });
    }
    let frameworks = Value::from(options.frameworks.clone());
    let check = |check_type: &str| {
        read_only("compliance_check", "compliance", targets)
            .with_param("check_type", check_type)
            .with_param("frameworks", frameworks.clone())
    };
    Ok(vec![
        WorkflowStep::new("setup", check("setup")),
        WorkflowStep::new("privacy", check("privacy")).after(["setup"]),
        WorkflowStep::new("access_control", check("access_control")).after(["setup"]),
        WorkflowStep::new("encryption", check("encryption")).after(["setup"]),
        WorkflowStep::new(
            "report",
            read_only("compliance_report", "analytics", targets).with_param("frameworks", frameworks.clone()),
        )
        .after(["privacy", "access_control", "encryption"]),
    ])
}

fn disaster_recovery(targets: &Value) -> Vec<WorkflowStep> {
    vec![
        WorkflowStep::new("assess", read_only("assess_recovery", "analytics", targets)),
        WorkflowStep::new("validate_backups", read_only("check_backups", "validation", targets))
            .after(["assess"])
            .with_retry(retried()),
        WorkflowStep::new("prepare", mutating("setup_recovery_env", "operations", targets))
            .after(["validate_backups"]),
        WorkflowStep::new(
            "recover",
            mutating("restore_backup", "restore", targets).with_param("recovery_type", "disaster"),
        )
        .after(["prepare"])
        .requires_confirmation(true),
        WorkflowStep::new("verify", read_only("verify_restore", "validation", targets))
            .after(["recover"]),
    ]
}

fn environment_sync(
    targets: &Value,
    options: &TemplateOptions,
) -> Result<Vec<WorkflowStep>, TemplateError> {
    let (source, target) = (options.source_env.as_str(), options.target_env.as_str());
    if source == target {
        return Err(TemplateError::InvalidOption {
            template: TemplateKind::MultiEnvironmentSync.as_str(),
            reason: format!("source and target environment are both '{source}'"),
        });
    }
    let sync = |name: &str| {
        mutating(name, "operations", targets)
            .with_param("source_env", source)
            .with_param("target_env", target)
    };
    Ok(vec![
        WorkflowStep::new("validate_envs", sync("check_environments").idempotent(true)),
        WorkflowStep::new(
            "anonymize",
            mutating("anonymize_data", "operations", targets).with_param("target_env", target),
        )
        .after(["validate_envs"]),
        WorkflowStep::new("schema", sync("schema_sync")).after(["anonymize"]),
        WorkflowStep::new("data", sync("data_sync"))
            .after(["schema"])
            .requires_confirmation(true),
        WorkflowStep::new(
            "verify",
            read_only("verify_sync", "validation", targets).with_param("target_env", target),
        )
        .after(["data"]),
    ])
}

fn performance_optimization(targets: &Value) -> Vec<WorkflowStep> {
    vec![
        WorkflowStep::new("analyze", read_only("get_performance", "performance", targets))
            .with_retry(retried()),
        WorkflowStep::new("bottlenecks", read_only("identify_bottlenecks", "analytics", targets))
            .after(["analyze"]),
        WorkflowStep::new(
            "optimize",
            Operation::new("apply_optimizations", "operations")
                .with_param("databases", targets.clone()),
        )
        .after(["bottlenecks"])
        .requires_confirmation(true),
        WorkflowStep::new("benchmark", read_only("run_benchmark", "performance", targets))
            .after(["optimize"]),
    ]
}

//! Declarative plan files and the registry that turns them into plans.
//!
//! A plan file names each action by `kind`; the remaining keys of the
//! action table are that kind's parameters:
//!
//! ```toml
//! id = "lt-1-to-contoso"
//! device = { name = "LT-1" }
//!
//! [[phase]]
//! name = "leave"
//!
//! [[phase.step]]
//! id = "unenroll"
//! idempotent = true
//! action = { kind = "command", program = "mdm-tool", args = ["unenroll"] }
//! compensate = { kind = "command", program = "mdm-tool", args = ["enroll"] }
//! ```

use super::{
    CaptureMode, CommandAction, CommandPredicate, FactEquals, FactPresent, FailAction,
    SetFactsAction, StepAction, VerificationPredicate,
};
use crate::models::{
    DeviceIdentity, FactTable, MigrationPlan, Phase, PlanError, ResumeCondition, Step,
    StepDefaults,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// One action or verification reference in a plan file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub kind: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl ActionSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Map::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Deserialize the parameters into a kind-specific struct.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, String> {
        serde_json::from_value(Value::Object(self.params.clone())).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub action: ActionSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensate: Option<ActionSpec>,
    #[serde(default)]
    pub idempotent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// First retry delay; the config's cap still applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<ResumeCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub name: String,
    #[serde(default)]
    pub advisory_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<ActionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_timeout_secs: Option<u64>,
    #[serde(default, rename = "step")]
    pub steps: Vec<StepDefinition>,
}

/// A plan as written on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub id: String,
    #[serde(default)]
    pub device: DeviceIdentity,
    /// RFC 3339 string; defaults to load time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "phase")]
    pub phases: Vec<PhaseDefinition>,
}

impl PlanDefinition {
    /// Load a plan file. `.json` files are parsed as JSON, anything else as
    /// TOML.
    pub fn from_file(path: &Path) -> Result<Self, PlanError> {
        let content = std::fs::read_to_string(path).map_err(|e| PlanError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        } else {
            toml::from_str(&content).map_err(|e| e.to_string())
        };
        parsed.map_err(|reason| PlanError::Parse {
            path: path.to_owned(),
            reason,
        })
    }
}

pub type ActionFactory =
    Arc<dyn Fn(&ActionSpec) -> Result<Arc<dyn StepAction>, String> + Send + Sync>;

pub type PredicateFactory =
    Arc<dyn Fn(&ActionSpec) -> Result<Arc<dyn VerificationPredicate>, String> + Send + Sync>;

/// Registry of action and verification kinds.
///
/// Built-in kinds are registered by [`ActionRegistry::with_builtins`];
/// embedders add their own through [`ActionRegistry::register_action`] and
/// [`ActionRegistry::register_predicate`].
///
/// # Example
///
/// ```ignore
/// use handover::{ActionRegistry, PlanDefinition, StepDefaults};
///
/// let mut registry = ActionRegistry::with_builtins();
/// registry.register_action("escrow_key", |spec| Ok(Arc::new(EscrowKey::from_spec(spec)?)));
///
/// let definition = PlanDefinition::from_file(Path::new("plan.toml"))?;
/// let plan = registry.build_plan(&definition, &StepDefaults::default())?;
/// ```
pub struct ActionRegistry {
    actions: HashMap<String, ActionFactory>,
    predicates: HashMap<String, PredicateFactory>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ActionRegistry {
    /// Registry with no kinds at all.
    pub fn empty() -> Self {
        Self {
            actions: HashMap::new(),
            predicates: HashMap::new(),
        }
    }

    /// Registry with `command`, `set_facts` and `fail` actions and
    /// `fact_equals`, `fact_present` and `command` verifications.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register_action("command", command_action);
        registry.register_action("set_facts", set_facts_action);
        registry.register_action("fail", fail_action);
        registry.register_predicate("fact_equals", fact_equals_predicate);
        registry.register_predicate("fact_present", fact_present_predicate);
        registry.register_predicate("command", command_predicate);
        registry
    }

    pub fn register_action<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&ActionSpec) -> Result<Arc<dyn StepAction>, String> + Send + Sync + 'static,
    {
        self.actions.insert(kind.into(), Arc::new(factory));
    }

    pub fn register_predicate<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&ActionSpec) -> Result<Arc<dyn VerificationPredicate>, String>
            + Send
            + Sync
            + 'static,
    {
        self.predicates.insert(kind.into(), Arc::new(factory));
    }

    /// Sorted action kind names.
    pub fn action_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Sorted verification kind names.
    pub fn predicate_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.predicates.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn build_action(
        &self,
        owner: &str,
        spec: &ActionSpec,
    ) -> Result<Arc<dyn StepAction>, PlanError> {
        let factory = self
            .actions
            .get(&spec.kind)
            .ok_or_else(|| PlanError::UnknownActionKind(spec.kind.clone()))?;
        factory(spec).map_err(|reason| PlanError::InvalidAction {
            owner: owner.to_string(),
            reason,
        })
    }

    pub fn build_predicate(
        &self,
        owner: &str,
        spec: &ActionSpec,
    ) -> Result<Arc<dyn VerificationPredicate>, PlanError> {
        let factory = self
            .predicates
            .get(&spec.kind)
            .ok_or_else(|| PlanError::UnknownVerificationKind(spec.kind.clone()))?;
        factory(spec).map_err(|reason| PlanError::InvalidAction {
            owner: owner.to_string(),
            reason,
        })
    }

    /// Resolve every action in `definition` and validate the result.
    ///
    /// Step settings left unset in the file fall back to `defaults`.
    pub fn build_plan(
        &self,
        definition: &PlanDefinition,
        defaults: &StepDefaults,
    ) -> Result<MigrationPlan, PlanError> {
        let mut plan = MigrationPlan::new(definition.id.clone(), definition.device.clone());
        if let Some(created_at) = definition.created_at {
            plan.created_at = created_at;
        }

        for phase_def in &definition.phases {
            let mut phase = Phase::new(phase_def.name.clone())
                .advisory(phase_def.advisory_only)
                .verification_timeout(
                    phase_def
                        .verify_timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| defaults.verify_timeout()),
                );
            if let Some(spec) = &phase_def.verify {
                phase = phase.verify(self.build_predicate(&phase_def.name, spec)?);
            }
            for step_def in &phase_def.steps {
                phase = phase.step(self.build_step(step_def, defaults)?);
            }
            plan = plan.phase(phase);
        }

        plan.validate()?;
        Ok(plan)
    }

    fn build_step(&self, def: &StepDefinition, defaults: &StepDefaults) -> Result<Step, PlanError> {
        let mut retry = defaults.retry_policy();
        if let Some(max_retries) = def.max_retries {
            retry.max_retries = max_retries;
        }
        if let Some(ms) = def.backoff_ms {
            retry.backoff_base = Duration::from_millis(ms);
        }

        let mut step = Step::new(def.id.clone(), self.build_action(&def.id, &def.action)?)
            .idempotent(def.idempotent)
            .retry(retry)
            .timeout(
                def.timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| defaults.timeout()),
            );
        if let Some(description) = &def.description {
            step = step.describe(description.clone());
        }
        if let Some(spec) = &def.compensate {
            let owner = format!("{} (compensate)", def.id);
            step = step.compensate(self.build_action(&owner, spec)?);
        }
        if let Some(condition) = def.restart {
            step = step.restart(condition);
        }
        Ok(step)
    }
}

#[derive(Deserialize)]
struct CommandParams {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    /// Fact key receiving trimmed stdout
    #[serde(default)]
    capture: Option<String>,
    /// Parse stdout as a JSON object of facts
    #[serde(default)]
    json_output: bool,
}

fn command_action(spec: &ActionSpec) -> Result<Arc<dyn StepAction>, String> {
    let params: CommandParams = spec.params_as()?;
    let capture = match (params.capture, params.json_output) {
        (Some(_), true) => return Err("`capture` and `json_output` are exclusive".to_string()),
        (Some(key), false) => CaptureMode::Text(key),
        (None, true) => CaptureMode::JsonObject,
        (None, false) => CaptureMode::None,
    };
    let mut action = CommandAction::new(params.program)
        .args(params.args)
        .capture(capture);
    action.env = params.env;
    action.cwd = params.cwd;
    Ok(Arc::new(action))
}

#[derive(Deserialize)]
struct SetFactsParams {
    facts: Map<String, Value>,
}

fn set_facts_action(spec: &ActionSpec) -> Result<Arc<dyn StepAction>, String> {
    let params: SetFactsParams = spec.params_as()?;
    let facts: FactTable = params.facts.into_iter().collect();
    Ok(Arc::new(SetFactsAction { facts }))
}

#[derive(Deserialize)]
struct FailParams {
    #[serde(default = "default_fail_message")]
    message: String,
}

fn default_fail_message() -> String {
    "step configured to fail".to_string()
}

fn fail_action(spec: &ActionSpec) -> Result<Arc<dyn StepAction>, String> {
    let params: FailParams = spec.params_as()?;
    Ok(Arc::new(FailAction {
        message: params.message,
    }))
}

#[derive(Deserialize)]
struct FactEqualsParams {
    key: String,
    value: Value,
}

fn fact_equals_predicate(spec: &ActionSpec) -> Result<Arc<dyn VerificationPredicate>, String> {
    let params: FactEqualsParams = spec.params_as()?;
    Ok(Arc::new(FactEquals {
        key: params.key,
        expected: params.value,
    }))
}

#[derive(Deserialize)]
struct FactPresentParams {
    keys: Vec<String>,
}

fn fact_present_predicate(spec: &ActionSpec) -> Result<Arc<dyn VerificationPredicate>, String> {
    let params: FactPresentParams = spec.params_as()?;
    if params.keys.is_empty() {
        return Err("`keys` must name at least one fact".to_string());
    }
    Ok(Arc::new(FactPresent { keys: params.keys }))
}

#[derive(Deserialize)]
struct CommandPredicateParams {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

fn command_predicate(spec: &ActionSpec) -> Result<Arc<dyn VerificationPredicate>, String> {
    let params: CommandPredicateParams = spec.params_as()?;
    Ok(Arc::new(CommandPredicate {
        program: params.program,
        args: params.args,
    }))
}

/// Example plan printed by `handover example`.
pub const EXAMPLE_PLAN: &str = r#"id = "lt-0042-to-contoso"
created_at = "2026-01-05T09:00:00Z"
device = { name = "LT-0042", source_provider = "fabrikam-mdm", target_provider = "contoso-mdm" }

[[phase]]
name = "leave"

[[phase.step]]
id = "record-hostname"
idempotent = true
action = { kind = "command", program = "hostname", capture = "hostname" }

[[phase.step]]
id = "unenroll"
description = "Remove the device from the source provider"
max_retries = 2
action = { kind = "command", program = "mdm-tool", args = ["unenroll", "--device", "{fact:hostname}"] }
compensate = { kind = "command", program = "mdm-tool", args = ["enroll", "--device", "{fact:hostname}"] }

[[phase.step]]
id = "reboot"
restart = "on_boot"
action = { kind = "command", program = "shutdown", args = ["-r", "+1"] }

[[phase]]
name = "join"
verify = { kind = "fact_present", keys = ["device_id"] }

[[phase.step]]
id = "enroll"
timeout_secs = 900
action = { kind = "command", program = "mdm-tool", args = ["join", "--token", "{credential:enroll_token}"], json_output = true }
compensate = { kind = "command", program = "mdm-tool", args = ["leave"] }
"#;

//! Placeholder expansion for declarative action arguments.
//!
//! Supported forms:
//! - `{fact:KEY}`: value of a fact (strings verbatim, other values as JSON)
//! - `{credential:NAME}`: secret from the credential provider
//! - `${VAR}`: environment variable, left unchanged when unset

use super::StepContext;
use crate::models::{expand_env_vars, FactTable, StepActionError};
use regex::{Captures, Regex};
use secrecy::ExposeSecret;
use std::sync::OnceLock;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{(fact|credential):([^}]+)\}").expect("static regex"))
}

/// Expand every placeholder in `template` for a running step.
pub fn expand(template: &str, ctx: &StepContext<'_>) -> Result<String, StepActionError> {
    render(template, |kind, name| match kind {
        "fact" => ctx
            .facts
            .get_text(name)
            .ok_or_else(|| StepActionError::MissingFact(name.to_string())),
        _ => Ok(ctx.credential(name)?.expose_secret().to_string()),
    })
}

/// Expand fact and environment placeholders only; a `{credential:..}`
/// placeholder is an error here.
pub fn expand_facts(template: &str, facts: &FactTable) -> Result<String, StepActionError> {
    render(template, |kind, name| match kind {
        "fact" => facts
            .get_text(name)
            .ok_or_else(|| StepActionError::MissingFact(name.to_string())),
        _ => Err(StepActionError::failed(format!(
            "credential '{name}' is not available here"
        ))),
    })
}

fn render<F>(template: &str, resolve: F) -> Result<String, StepActionError>
where
    F: Fn(&str, &str) -> Result<String, StepActionError>,
{
    let mut error = None;
    let expanded = placeholder_re().replace_all(template, |caps: &Captures<'_>| {
        match resolve(&caps[1], caps[2].trim()) {
            Ok(value) => value,
            Err(e) => {
                error.get_or_insert(e);
                String::new()
            }
        }
    });
    match error {
        Some(e) => Err(e),
        None => Ok(expand_env_vars(&expanded)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::StaticCredentialProvider;
    use crate::models::DeviceIdentity;

    #[test]
    fn test_expand_facts_credentials_and_env() {
        std::env::set_var("HANDOVER_TEST_TENANT_HOST", "login.example.net");
        let facts = FactTable::new().with("tenant", "contoso").with("port", 8443);
        let creds = StaticCredentialProvider::new().with("enroll", "tok-1");
        let device = DeviceIdentity::named("LT-1");
        let ctx = StepContext {
            plan_id: "plan-1",
            device: &device,
            phase: "join",
            step_id: "enroll",
            attempt: 1,
            facts: &facts,
            credentials: &creds,
        };

        let out = expand(
            "--tenant={fact:tenant} --port {fact:port} --token {credential:enroll} ${HANDOVER_TEST_TENANT_HOST}",
            &ctx,
        )
        .unwrap();
        assert_eq!(out, "--tenant=contoso --port 8443 --token tok-1 login.example.net");
        assert_eq!(ctx.credential("enroll").unwrap().expose_secret(), "tok-1");
    }

    #[test]
    fn test_missing_fact_is_an_error() {
        let facts = FactTable::new();
        assert!(matches!(
            expand_facts("{fact:device_id}", &facts),
            Err(StepActionError::MissingFact(k)) if k == "device_id"
        ));
        assert!(expand_facts("{credential:x}", &facts).is_err());
        assert_eq!(expand_facts("plain", &facts).unwrap(), "plain");
    }
}

//! Environment variables visible to scripts.
//!
//! Two lists are in play: the selected (active) environment and the global
//! one. Lookups in the default scope check selected first, then global.
//! Values may reference other variables as `<<name>>`; those templates are
//! expanded on demand, never stored expanded.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of template expansion passes before giving up.
pub const MAX_EXPAND_DEPTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVariable {
    pub key: String,
    #[serde(alias = "value")]
    pub current_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<String>,
    #[serde(default)]
    pub secret: bool,
}

impl EnvVariable {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            key: key.into(),
            initial_value: Some(value.clone()),
            current_value: value,
            secret: false,
        }
    }
}

/// Which list an environment call looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvScope {
    #[default]
    All,
    Active,
    Global,
}

impl EnvScope {
    /// Unknown names fall back to [`EnvScope::All`].
    pub fn parse(name: &str) -> Self {
        match name {
            "active" => Self::Active,
            "global" => Self::Global,
            _ => Self::All,
        }
    }

    const fn includes_selected(self) -> bool {
        matches!(self, Self::All | Self::Active)
    }

    const fn includes_global(self) -> bool {
        matches!(self, Self::All | Self::Global)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnvField {
    Current,
    Initial,
}

/// Template expansion kept finding `<<...>>` references after
/// [`MAX_EXPAND_DEPTH`] passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Variable expansion exceeded {MAX_EXPAND_DEPTH} levels")]
pub struct ExpandLoop;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Environments {
    pub global: Vec<EnvVariable>,
    pub selected: Vec<EnvVariable>,
}

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<<([^>]*)>>").expect("template regex"))
}

/// Expand `<<name>>` references against `vars` (first match wins).
/// Unknown names expand to the empty string.
pub fn expand_template(template: &str, vars: &[&EnvVariable]) -> Result<String, ExpandLoop> {
    let regex = template_regex();
    let mut result = template.to_string();
    let mut depth = 0;
    while regex.is_match(&result) && depth <= MAX_EXPAND_DEPTH {
        result = regex
            .replace_all(&result, |caps: &regex::Captures<'_>| {
                vars.iter()
                    .find(|var| var.key == caps[1])
                    .map(|var| var.current_value.clone())
                    .unwrap_or_default()
            })
            .into_owned();
        depth += 1;
    }
    if depth > MAX_EXPAND_DEPTH {
        return Err(ExpandLoop);
    }
    Ok(result)
}

impl Environments {
    pub fn new(global: Vec<EnvVariable>, selected: Vec<EnvVariable>) -> Self {
        Self { global, selected }
    }

    pub fn find(&self, key: &str, scope: EnvScope) -> Option<&EnvVariable> {
        let selected = scope
            .includes_selected()
            .then(|| self.selected.iter().find(|var| var.key == key))
            .flatten();
        selected.or_else(|| {
            scope
                .includes_global()
                .then(|| self.global.iter().find(|var| var.key == key))
                .flatten()
        })
    }

    /// Variables in lookup order for `scope`.
    pub fn variables(&self, scope: EnvScope) -> Vec<&EnvVariable> {
        let selected = self.selected.iter().filter(|_| scope.includes_selected());
        let global = self.global.iter().filter(|_| scope.includes_global());
        selected.chain(global).collect()
    }

    /// Raw current value.
    pub fn get(&self, key: &str, scope: EnvScope) -> Option<&str> {
        self.find(key, scope).map(|var| var.current_value.as_str())
    }

    /// Current value with templates expanded against the same scope. An
    /// expansion loop yields the raw value.
    pub fn get_resolve(&self, key: &str, scope: EnvScope) -> Option<String> {
        let var = self.find(key, scope)?;
        let vars = self.variables(scope);
        Some(
            expand_template(&var.current_value, &vars)
                .unwrap_or_else(|_| var.current_value.clone()),
        )
    }

    /// Expand an arbitrary template against every variable.
    pub fn resolve(&self, template: &str) -> String {
        let vars = self.variables(EnvScope::All);
        expand_template(template, &vars).unwrap_or_else(|_| template.to_string())
    }

    /// Update the current value where the key already lives (selected
    /// first), or create it in the first list the scope allows.
    pub fn set(&mut self, key: &str, value: &str, scope: EnvScope) {
        self.set_field(key, value, scope, EnvField::Current);
    }

    /// Like [`Environments::set`] but targets the initial value of an
    /// existing variable.
    pub fn set_initial(&mut self, key: &str, value: &str, scope: EnvScope) {
        self.set_field(key, value, scope, EnvField::Initial);
    }

    fn set_field(&mut self, key: &str, value: &str, scope: EnvScope, field: EnvField) {
        let target = self.locate_mut(key, scope);
        if let Some(var) = target {
            match field {
                EnvField::Current => var.current_value = value.to_string(),
                EnvField::Initial => var.initial_value = Some(value.to_string()),
            }
            return;
        }
        let list = if scope.includes_selected() {
            &mut self.selected
        } else {
            &mut self.global
        };
        list.push(EnvVariable::new(key, value));
        tracing::trace!(event = "sandbox.env.create", key, "Created environment variable");
    }

    fn locate_mut(&mut self, key: &str, scope: EnvScope) -> Option<&mut EnvVariable> {
        if scope.includes_selected() {
            if let Some(idx) = self.selected.iter().position(|var| var.key == key) {
                return self.selected.get_mut(idx);
            }
        }
        if scope.includes_global() {
            return self.global.iter_mut().find(|var| var.key == key);
        }
        None
    }

    /// Remove the first match (selected before global). Returns whether
    /// anything was removed.
    pub fn unset(&mut self, key: &str, scope: EnvScope) -> bool {
        if scope.includes_selected() {
            if let Some(idx) = self.selected.iter().position(|var| var.key == key) {
                self.selected.remove(idx);
                return true;
            }
        }
        if scope.includes_global() {
            if let Some(idx) = self.global.iter().position(|var| var.key == key) {
                self.global.remove(idx);
                return true;
            }
        }
        false
    }

    /// Restore the current value from the initial value. Variables without
    /// an initial value are left alone.
    pub fn reset(&mut self, key: &str, scope: EnvScope) -> bool {
        match self.locate_mut(key, scope) {
            Some(var) => match var.initial_value.clone() {
                Some(initial) => {
                    var.current_value = initial;
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    pub fn get_initial_raw(&self, key: &str, scope: EnvScope) -> Option<&str> {
        self.find(key, scope)?.initial_value.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envs() -> Environments {
        Environments::new(
            vec![
                EnvVariable::new("shared", "global-shared"),
                EnvVariable::new("only_global", "g"),
            ],
            vec![
                EnvVariable::new("shared", "selected-shared"),
                EnvVariable::new("name", "Alice"),
                EnvVariable::new("greeting", "Hello <<name>>"),
            ],
        )
    }

    #[test]
    fn lookup_prefers_selected_and_honors_scope() {
        let envs = envs();
        assert_eq!(envs.get("shared", EnvScope::All), Some("selected-shared"));
        assert_eq!(envs.get("shared", EnvScope::Global), Some("global-shared"));
        assert_eq!(envs.get("only_global", EnvScope::Active), None);
        assert_eq!(envs.get("only_global", EnvScope::All), Some("g"));
        assert_eq!(envs.get("missing", EnvScope::All), None);
    }

    #[test]
    fn get_resolve_expands_nested_templates() {
        let mut envs = envs();
        envs.selected.push(EnvVariable::new("a", "<<greeting>>!"));
        assert_eq!(
            envs.get_resolve("a", EnvScope::All).as_deref(),
            Some("Hello Alice!")
        );
        assert_eq!(envs.get("a", EnvScope::All), Some("<<greeting>>!"));
    }

    #[test]
    fn resolve_drops_unknown_references() {
        let envs = envs();
        assert_eq!(envs.resolve("<<greeting>> and <<nobody>>."), "Hello Alice and .");
        assert_eq!(envs.resolve("plain"), "plain");
    }

    #[test]
    fn self_reference_falls_back_to_raw_value() {
        let mut envs = Environments::default();
        envs.selected.push(EnvVariable::new("loop", "x<<loop>>"));
        assert_eq!(
            envs.get_resolve("loop", EnvScope::All).as_deref(),
            Some("x<<loop>>")
        );
        assert_eq!(
            expand_template("<<loop>>", &envs.variables(EnvScope::All)),
            Err(ExpandLoop)
        );
    }

    #[test]
    fn expansion_at_the_depth_limit_still_succeeds() {
        let mut envs = Environments::default();
        for idx in 0..MAX_EXPAND_DEPTH {
            envs.selected
                .push(EnvVariable::new(format!("v{idx}"), format!("<<v{}>>", idx + 1)));
        }
        envs.selected
            .push(EnvVariable::new(format!("v{MAX_EXPAND_DEPTH}"), "end"));
        assert_eq!(envs.get_resolve("v0", EnvScope::All).as_deref(), Some("end"));
    }

    #[test]
    fn set_updates_in_place_or_creates_in_selected() {
        let mut envs = envs();
        envs.set("only_global", "changed", EnvScope::All);
        assert_eq!(envs.global[1].current_value, "changed");
        assert_eq!(envs.global[1].initial_value.as_deref(), Some("g"));

        envs.set("fresh", "v", EnvScope::All);
        let created = envs.selected.last().expect("created");
        assert_eq!(created, &EnvVariable::new("fresh", "v"));

        envs.set("fresh_global", "v", EnvScope::Global);
        assert_eq!(envs.global.last().map(|var| var.key.as_str()), Some("fresh_global"));
    }

    #[test]
    fn set_initial_reset_and_get_initial_raw() {
        let mut envs = envs();
        envs.set("name", "Bob", EnvScope::All);
        assert_eq!(envs.get_initial_raw("name", EnvScope::All), Some("Alice"));
        assert!(envs.reset("name", EnvScope::All));
        assert_eq!(envs.get("name", EnvScope::All), Some("Alice"));

        envs.set_initial("name", "Carol", EnvScope::Active);
        assert_eq!(envs.get("name", EnvScope::All), Some("Alice"));
        assert!(envs.reset("name", EnvScope::Active));
        assert_eq!(envs.get("name", EnvScope::All), Some("Carol"));
        assert!(!envs.reset("missing", EnvScope::All));
    }

    #[test]
    fn unset_removes_selected_before_global() {
        let mut envs = envs();
        assert!(envs.unset("shared", EnvScope::All));
        assert_eq!(envs.get("shared", EnvScope::All), Some("global-shared"));
        assert!(envs.unset("shared", EnvScope::All));
        assert!(!envs.unset("shared", EnvScope::All));
        assert!(!envs.unset("only_global", EnvScope::Active));
    }

    #[test]
    fn deserializes_legacy_value_field() {
        let envs: Environments = serde_json::from_value(serde_json::json!({
            "selected": [{ "key": "a", "value": "1" }]
        }))
        .expect("parse");
        assert_eq!(envs.selected[0].current_value, "1");
        assert_eq!(envs.selected[0].initial_value, None);
        assert!(envs.global.is_empty());
    }
}

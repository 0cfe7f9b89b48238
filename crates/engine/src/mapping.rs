//! Resource-mapping resolver: collapses the five permitted mapping
//! syntaxes into a flat list of canonical bindings.
//!
//! Data-only forms deserialize straight from configuration; transform and
//! predicate functions are compiled closures referenced by name through a
//! [`FnRegistry`].

use crate::error::ConfigError;
use model::core::{
    operation::{ActionSet, Operation},
    record::Record,
};
use serde::Deserialize;
use std::{collections::HashMap, fmt, sync::Arc};

pub type TransformFn = dyn Fn(&Record, Operation) -> Option<Record> + Send + Sync;
pub type PredicateFn = dyn Fn(&Record, Operation) -> bool + Send + Sync;

/// Named compiled functions available to mapping configs.
#[derive(Clone, Default)]
pub struct FnRegistry {
    transforms: HashMap<String, Arc<TransformFn>>,
    predicates: HashMap<String, Arc<PredicateFn>>,
}

impl FnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_transform<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Record, Operation) -> Option<Record> + Send + Sync + 'static,
    {
        self.transforms.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_predicate<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Record, Operation) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.to_string(), Arc::new(f));
    }

    fn transform(&self, name: &str) -> Result<Arc<TransformFn>, ConfigError> {
        self.transforms
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownTransform(name.to_string()))
    }

    fn predicate(&self, name: &str) -> Result<Arc<PredicateFn>, ConfigError> {
        self.predicates
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownPredicate(name.to_string()))
    }
}

/// The `resources` field of a replicator config, before canonicalisation.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResourcesSpec {
    /// `["users", "orders"]` — 1:1 replication, all actions.
    List(Vec<String>),
    /// Keyed forms: rename, full object, function-by-name, multi-destination.
    Map(HashMap<String, TargetSpec>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TargetSpec {
    /// `{users: "people"}` — rename only.
    Destination(String),
    /// `{users: [...]}` — fan-out to several destinations.
    Many(Vec<TargetSpec>),
    /// `{users: {destination?, actions?, transform?, should_replicate?}}`.
    Full(BindingSpec),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindingSpec {
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub actions: Option<Vec<Operation>>,
    /// Name of a registered transform.
    #[serde(default)]
    pub transform: Option<String>,
    /// Name of a registered predicate.
    #[serde(default)]
    pub should_replicate: Option<String>,
}

/// Canonical binding for one `(replicator, source resource)` pair.
#[derive(Clone)]
pub struct Binding {
    pub destination: String,
    pub actions: ActionSet,
    pub should_replicate: Option<Arc<PredicateFn>>,
    pub transform: Option<Arc<TransformFn>>,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("destination", &self.destination)
            .field("actions", &self.actions)
            .field("should_replicate", &self.should_replicate.is_some())
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl Binding {
    fn passthrough(destination: &str) -> Self {
        Binding {
            destination: destination.to_string(),
            actions: ActionSet::all(),
            should_replicate: None,
            transform: None,
        }
    }

    /// A binding with an empty action set is configured but a no-op.
    pub fn is_inert(&self) -> bool {
        self.actions.is_empty()
    }
}

fn resolve_target(
    resource: &str,
    target: &TargetSpec,
    fns: &FnRegistry,
    out: &mut Vec<(String, Binding)>,
) -> Result<(), ConfigError> {
    match target {
        TargetSpec::Destination(destination) => {
            out.push((resource.to_string(), Binding::passthrough(destination)));
        }
        TargetSpec::Many(targets) => {
            for target in targets {
                resolve_target(resource, target, fns, out)?;
            }
        }
        TargetSpec::Full(spec) => {
            let destination = spec.destination.clone().unwrap_or_else(|| resource.to_string());
            let actions = match &spec.actions {
                Some(ops) => ops.iter().copied().collect(),
                None => ActionSet::all(),
            };
            let transform = spec
                .transform
                .as_deref()
                .map(|name| fns.transform(name))
                .transpose()?;
            let should_replicate = spec
                .should_replicate
                .as_deref()
                .map(|name| fns.predicate(name))
                .transpose()?;
            out.push((
                resource.to_string(),
                Binding {
                    destination,
                    actions,
                    should_replicate,
                    transform,
                },
            ));
        }
    }
    Ok(())
}

/// Canonicalises a `resources` spec into a flat binding list. Fails loudly
/// on unknown function names; inert bindings are kept (the engine warns).
pub fn resolve_bindings(
    spec: &ResourcesSpec,
    fns: &FnRegistry,
) -> Result<Vec<(String, Binding)>, ConfigError> {
    let mut out = Vec::new();
    match spec {
        ResourcesSpec::List(resources) => {
            for resource in resources {
                out.push((resource.clone(), Binding::passthrough(resource)));
            }
        }
        ResourcesSpec::Map(targets) => {
            for (resource, target) in targets {
                resolve_target(resource, target, fns, &mut out)?;
            }
        }
    }
    if out.is_empty() {
        return Err(ConfigError::InvalidMapping(
            "resource mapping resolves to no bindings".to_string(),
        ));
    }
    Ok(out)
}

/// Groups resolved bindings by source resource.
pub fn group_by_resource(bindings: Vec<(String, Binding)>) -> HashMap<String, Vec<Binding>> {
    let mut grouped: HashMap<String, Vec<Binding>> = HashMap::new();
    for (resource, binding) in bindings {
        grouped.entry(resource).or_default().push(binding);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> FnRegistry {
        let mut fns = FnRegistry::new();
        fns.register_transform("strip_secret", |record, _op| {
            let mut out = record.clone();
            out.remove("secret");
            Some(out)
        });
        fns.register_predicate("big_orders", |record, _op| {
            record.get("total").and_then(|v| v.as_f64()).unwrap_or(0.0) >= 100.0
        });
        fns
    }

    fn spec(value: serde_json::Value) -> ResourcesSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn list_form_replicates_one_to_one() {
        let bindings =
            resolve_bindings(&spec(json!(["users", "orders"])), &FnRegistry::new()).unwrap();
        assert_eq!(bindings.len(), 2);
        let users = bindings.iter().find(|(r, _)| r == "users").unwrap();
        assert_eq!(users.1.destination, "users");
        assert_eq!(users.1.actions, ActionSet::all());
        assert!(users.1.transform.is_none());
    }

    #[test]
    fn flat_map_form_renames() {
        let bindings = resolve_bindings(
            &spec(json!({"users": "people"})),
            &FnRegistry::new(),
        )
        .unwrap();
        assert_eq!(bindings[0].0, "users");
        assert_eq!(bindings[0].1.destination, "people");
    }

    #[test]
    fn full_object_form_resolves_functions_and_actions() {
        let bindings = resolve_bindings(
            &spec(json!({
                "orders": {
                    "destination": "order_history",
                    "actions": ["inserted", "deleted"],
                    "transform": "strip_secret",
                    "should_replicate": "big_orders",
                }
            })),
            &registry(),
        )
        .unwrap();
        let binding = &bindings[0].1;
        assert_eq!(binding.destination, "order_history");
        assert!(binding.actions.contains(Operation::Inserted));
        assert!(!binding.actions.contains(Operation::Updated));
        assert!(binding.transform.is_some());
        assert!(binding.should_replicate.is_some());
    }

    #[test]
    fn function_form_defaults_destination_to_source() {
        let bindings = resolve_bindings(
            &spec(json!({"users": {"transform": "strip_secret"}})),
            &registry(),
        )
        .unwrap();
        assert_eq!(bindings[0].1.destination, "users");
        assert_eq!(bindings[0].1.actions, ActionSet::all());
    }

    #[test]
    fn multi_destination_form_duplicates_bindings() {
        let bindings = resolve_bindings(
            &spec(json!({
                "users": [
                    "people",
                    {"destination": "analytics", "transform": "strip_secret"},
                    {"destination": "audit", "actions": ["deleted"]},
                ]
            })),
            &registry(),
        )
        .unwrap();
        assert_eq!(bindings.len(), 3);
        let destinations: Vec<&str> =
            bindings.iter().map(|(_, b)| b.destination.as_str()).collect();
        assert!(destinations.contains(&"people"));
        assert!(destinations.contains(&"analytics"));
        assert!(destinations.contains(&"audit"));
    }

    #[test]
    fn unknown_transform_fails_loudly() {
        let err = resolve_bindings(
            &spec(json!({"users": {"transform": "nope"}})),
            &FnRegistry::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTransform(name) if name == "nope"));
    }

    #[test]
    fn empty_actions_yield_inert_binding() {
        let bindings = resolve_bindings(
            &spec(json!({"users": {"actions": []}})),
            &FnRegistry::new(),
        )
        .unwrap();
        assert!(bindings[0].1.is_inert());
    }

    #[test]
    fn empty_mapping_is_rejected() {
        let err = resolve_bindings(&spec(json!([])), &FnRegistry::new()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMapping(_)));
    }

    #[test]
    fn grouping_preserves_multi_bindings() {
        let bindings = resolve_bindings(
            &spec(json!({"users": ["a", "b"]})),
            &FnRegistry::new(),
        )
        .unwrap();
        let grouped = group_by_resource(bindings);
        assert_eq!(grouped["users"].len(), 2);
    }
}

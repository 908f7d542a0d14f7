//! Resolver registry: the single indirection point for cross-node references.
//!
//! A step never reads another node's output directly. It consumes a
//! [`RefObject`] and the registry dispatches to the [`Resolver`] registered
//! for that reference type. New kinds of cross-node references are added by
//! registering a resolver, never by touching executable or adviser code.
//!
//! Visibility is scope-path based. Publishing with `levels_to_keep = n`
//! attaches the value to the first `n` ambiance levels (`0` keeps the full
//! producer path). Resolution walks the consumer's runtime-id path from the
//! deepest prefix upward and returns the closest match, so a value published
//! deeper shadows one with the same name published wider.

mod outcome;
mod sweeping;

pub use outcome::OutcomeResolver;
pub use sweeping::SweepingOutputResolver;

use crate::ambiance::Ambiance;
use crate::core::{FailureInfo, FailureType, RefInstance, RefObject, RefType};
use crate::errors::{EngineError, EngineResult};
use crate::store::ExecutionStore;
use crate::utils::{generate_id, now_utc};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves and publishes one kind of cross-node reference.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// The reference type this resolver is registered under.
    fn ref_type(&self) -> RefType;

    /// Resolves a reference from the consuming ambiance.
    async fn resolve(&self, ambiance: &Ambiance, ref_object: &RefObject) -> EngineResult<Value>;

    /// Publishes a value visible to the first `levels_to_keep` ambiance
    /// levels (`0` keeps the full producer path). Returns the reference id.
    async fn consume(
        &self,
        ambiance: &Ambiance,
        name: &str,
        value: Value,
        levels_to_keep: usize,
    ) -> EngineResult<String>;
}

/// Maps reference types to resolvers.
pub struct ResolverRegistry {
    resolvers: RwLock<HashMap<RefType, Arc<dyn Resolver>>>,
}

impl ResolverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            resolvers: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry with the built-in resolvers over the given store.
    #[must_use]
    pub fn with_builtins(store: Arc<dyn ExecutionStore>) -> Self {
        let registry = Self::new();
        {
            let mut resolvers = registry.resolvers.write();
            resolvers.insert(
                RefType::Outcome,
                Arc::new(OutcomeResolver::new(store.clone())) as Arc<dyn Resolver>,
            );
            resolvers.insert(
                RefType::SweepingOutput,
                Arc::new(SweepingOutputResolver::new(store)) as Arc<dyn Resolver>,
            );
        }
        registry
    }

    /// Registers a resolver under its reference type.
    ///
    /// # Errors
    ///
    /// Returns a duplicate-registration error when the type is already bound.
    pub fn register(&self, resolver: Arc<dyn Resolver>) -> EngineResult<()> {
        let ref_type = resolver.ref_type();
        let mut resolvers = self.resolvers.write();
        if resolvers.contains_key(&ref_type) {
            return Err(EngineError::duplicate_registration(
                "resolver",
                ref_type.to_string(),
            ));
        }
        resolvers.insert(ref_type, resolver);
        Ok(())
    }

    /// Looks up the resolver for a reference type.
    ///
    /// # Errors
    ///
    /// Returns a not-registered error when the type is unbound.
    pub fn obtain(&self, ref_type: RefType) -> EngineResult<Arc<dyn Resolver>> {
        self.resolvers
            .read()
            .get(&ref_type)
            .cloned()
            .ok_or_else(|| EngineError::not_registered("resolver", ref_type.to_string()))
    }

    /// Returns the registered reference types.
    #[must_use]
    pub fn registered_types(&self) -> Vec<RefType> {
        self.resolvers.read().keys().copied().collect()
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Replaces every `{"$ref": {...}}` object in `value` with its resolved
/// value, recursing through objects and arrays.
pub fn resolve_inputs<'a>(
    registry: &'a ResolverRegistry,
    ambiance: &'a Ambiance,
    value: &'a Value,
) -> BoxFuture<'a, EngineResult<Value>> {
    Box::pin(async move {
        match value {
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(ref_value) = map.get("$ref") {
                        if let Ok(ref_object) =
                            serde_json::from_value::<RefObject>(ref_value.clone())
                        {
                            let resolver = registry.obtain(ref_object.ref_type)?;
                            return resolver.resolve(ambiance, &ref_object).await;
                        }
                    }
                }
                let mut resolved = serde_json::Map::with_capacity(map.len());
                for (key, nested) in map {
                    resolved.insert(
                        key.clone(),
                        resolve_inputs(registry, ambiance, nested).await?,
                    );
                }
                Ok(Value::Object(resolved))
            }
            Value::Array(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(resolve_inputs(registry, ambiance, item).await?);
                }
                Ok(Value::Array(resolved))
            }
            other => Ok(other.clone()),
        }
    })
}

/// Returns the scope path `levels_to_keep` selects from the producer's
/// ambiance. `0`, or a value at least the depth, keeps the full path.
pub(crate) fn scope_path_for(ambiance: &Ambiance, levels_to_keep: usize) -> String {
    if levels_to_keep == 0 || levels_to_keep >= ambiance.levels.len() {
        return ambiance.runtime_id_path();
    }
    ambiance.levels[..levels_to_keep]
        .iter()
        .map(|l| l.runtime_id.as_str())
        .collect::<Vec<_>>()
        .join("/")
}

/// Returns the consumer's runtime-id prefixes, deepest first.
pub(crate) fn consumer_prefixes(ambiance: &Ambiance) -> Vec<String> {
    let ids: Vec<&str> = ambiance
        .levels
        .iter()
        .map(|l| l.runtime_id.as_str())
        .collect();
    (1..=ids.len()).rev().map(|n| ids[..n].join("/")).collect()
}

fn unresolved(ref_type: RefType, name: &str) -> EngineError {
    EngineError::execution(FailureInfo::new(
        format!("could not resolve {ref_type} '{name}'"),
        vec![FailureType::Verification],
    ))
}

/// Publishes a reference instance for the deepest level of `ambiance`.
pub(crate) async fn consume_instance(
    store: &Arc<dyn ExecutionStore>,
    ambiance: &Ambiance,
    ref_type: RefType,
    name: &str,
    value: Value,
    levels_to_keep: usize,
) -> EngineResult<String> {
    let level = ambiance.current_level()?;
    let scope_path = scope_path_for(ambiance, levels_to_keep);

    // Published values are immutable: a second produce of the same name in
    // the same scope is the producer's bug.
    let existing = store.fetch_ref_instances(&ambiance.plan_execution_id).await?;
    if existing
        .iter()
        .any(|i| i.ref_type == ref_type && i.name == name && i.scope_path == scope_path)
    {
        return Err(EngineError::execution(FailureInfo::new(
            format!("{ref_type} '{name}' already produced in scope '{scope_path}'"),
            vec![FailureType::Application],
        )));
    }

    let instance = RefInstance {
        id: generate_id(),
        plan_execution_id: ambiance.plan_execution_id.clone(),
        ref_type,
        name: name.to_string(),
        value,
        producer_runtime_id: level.runtime_id.clone(),
        producer_setup_id: level.setup_id.clone(),
        scope_path,
        levels_kept: levels_to_keep,
        created_at: now_utc(),
    };
    let reference_id = instance.id.clone();
    store.save_ref_instance(instance).await?;
    Ok(reference_id)
}

/// Resolves a reference by walking the consumer's scope prefixes, with an
/// optional producer-qualified fast path.
pub(crate) async fn resolve_instance(
    store: &Arc<dyn ExecutionStore>,
    ambiance: &Ambiance,
    ref_type: RefType,
    ref_object: &RefObject,
    producer_refs: bool,
) -> EngineResult<Value> {
    let instances = store.fetch_ref_instances(&ambiance.plan_execution_id).await?;

    if producer_refs {
        let (producer, plain_name) = ref_object.producer_and_name();
        if let Some(producer) = producer {
            return resolve_produced_by(&instances, ambiance, ref_type, producer, plain_name);
        }
    }

    let name = ref_object.name.as_str();
    for prefix in consumer_prefixes(ambiance) {
        let found = instances
            .iter()
            .filter(|i| i.ref_type == ref_type && i.name == name && i.scope_path == prefix)
            .max_by_key(|i| i.created_at);
        if let Some(instance) = found {
            return Ok(instance.value.clone());
        }
    }
    Err(unresolved(ref_type, name))
}

fn resolve_produced_by(
    instances: &[RefInstance],
    ambiance: &Ambiance,
    ref_type: RefType,
    producer_setup_id: &str,
    name: &str,
) -> EngineResult<Value> {
    let candidates: Vec<&RefInstance> = instances
        .iter()
        .filter(|i| {
            i.ref_type == ref_type && i.name == name && i.producer_setup_id == producer_setup_id
        })
        .collect();

    // Prefer the attempt on the consumer's own ancestor path; retried or
    // repeated producers outside it fall back to the newest instance.
    let on_path = candidates
        .iter()
        .filter(|i| {
            ambiance
                .levels
                .iter()
                .any(|l| l.runtime_id == i.producer_runtime_id)
        })
        .max_by_key(|i| i.created_at);
    if let Some(instance) = on_path {
        return Ok(instance.value.clone());
    }

    candidates
        .into_iter()
        .max_by_key(|i| i.created_at)
        .map(|i| i.value.clone())
        .ok_or_else(|| unresolved(ref_type, name))
}

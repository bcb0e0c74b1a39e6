use super::value::{QualifiedName, Stub};
use std::collections::HashMap;

/// Builds the stand-in for one unresolvable type
pub type StubFactory = fn(&QualifiedName) -> Stub;

/// Default factory: an empty stub that only remembers its type name
pub fn recording_stub(type_name: &QualifiedName) -> Stub {
    Stub::new(type_name.clone())
}

/// Explicit table of types that are replaced by stubs during deserialization.
/// Entries are either exact type names or whole module trees.
#[derive(Clone, Debug, Default)]
pub struct StubRegistry {
    types: HashMap<QualifiedName, StubFactory>,
    modules: Vec<(String, StubFactory)>,
}
impl StubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry for the legacy body model assets, whose wrappers come from the
    /// ``chumpy`` autodiff library
    pub fn legacy_body_model() -> Self {
        let mut registry = Self::new();
        registry.register_module("chumpy", recording_stub);
        registry
    }

    pub fn register_type(&mut self, module: &str, name: &str, factory: StubFactory) -> &mut Self {
        self.types.insert(QualifiedName::new(module, name), factory);
        self
    }

    /// Registers ``module`` and all of its submodules
    pub fn register_module(&mut self, module: &str, factory: StubFactory) -> &mut Self {
        self.modules.push((module.to_string(), factory));
        self
    }

    /// Exact type entries win over module entries, longer module prefixes win
    /// over shorter ones
    pub fn lookup(&self, type_name: &QualifiedName) -> Option<StubFactory> {
        if let Some(factory) = self.types.get(type_name) {
            return Some(*factory);
        }
        self.modules
            .iter()
            .filter(|(prefix, _)| {
                type_name.module == *prefix
                    || type_name
                        .module
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('.'))
            })
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, factory)| *factory)
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty() && self.modules.is_empty()
    }
}

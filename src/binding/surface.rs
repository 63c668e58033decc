//! Whitelisted host type surface
//!
//! Host types are described up front (there is no runtime reflection), filtered
//! through a [`WhitelistPolicy`] and published as a tree of namespace tables in
//! the script globals. The tree only ever grows.

use mlua::{Lua, Table, Value};
use std::collections::{BTreeSet, HashSet};
use std::rc::Rc;
use tracing::{debug, warn};

use super::function::{FunctionBinder, FunctionBinding};

/// Which host assemblies and namespaces scripts may see. Fixed at start-up.
#[derive(Debug, Clone, Default)]
pub struct WhitelistPolicy {
    assemblies: BTreeSet<String>,
    namespace_prefixes: Vec<String>,
    entry_type: Option<String>,
}

impl WhitelistPolicy {
    pub fn new<A, N>(assemblies: A, namespace_prefixes: N, entry_type: Option<String>) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        N: IntoIterator,
        N::Item: Into<String>,
    {
        Self {
            assemblies: assemblies.into_iter().map(Into::into).collect(),
            namespace_prefixes: namespace_prefixes.into_iter().map(Into::into).collect(),
            entry_type: entry_type.filter(|t| !t.is_empty()),
        }
    }

    #[must_use]
    pub fn allows_assembly(&self, assembly: &str) -> bool {
        self.assemblies.contains(assembly)
    }

    #[must_use]
    pub fn is_entry_type(&self, ty: &HostType) -> bool {
        self.entry_type.as_deref() == Some(ty.full_name().as_str())
    }

    /// Namespace rules for a type that already comes from an allowed assembly
    #[must_use]
    pub fn is_type_eligible(&self, ty: &HostType) -> bool {
        if self.is_entry_type(ty) || ty.namespace.is_empty() {
            return true;
        }
        if ty.namespace == "System" && matches!(ty.kind, TypeKind::Value | TypeKind::String) {
            return true;
        }
        self.namespace_prefixes
            .iter()
            .any(|prefix| ty.namespace.starts_with(prefix.as_str()))
    }

    #[must_use]
    pub fn entry_type(&self) -> Option<&str> {
        self.entry_type.as_deref()
    }
}

/// Broad shape of a host type, used by the `System` namespace rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Value,
    String,
    Reference,
}

impl TypeKind {
    fn as_str(self) -> &'static str {
        match self {
            TypeKind::Value => "value",
            TypeKind::String => "string",
            TypeKind::Reference => "reference",
        }
    }
}

/// A host type that may be published to scripts
#[derive(Debug, Clone)]
pub struct HostType {
    pub namespace: String,
    pub name: String,
    pub kind: TypeKind,
    statics: Vec<Rc<FunctionBinding>>,
}

impl HostType {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kind,
            statics: Vec::new(),
        }
    }

    /// Attach a static function exposed on the type's table
    #[must_use]
    pub fn with_static(mut self, binding: FunctionBinding) -> Self {
        self.statics.push(Rc::new(binding));
        self
    }

    #[must_use]
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

/// A loaded host assembly and the types it defines
#[derive(Debug, Clone)]
pub struct HostAssembly {
    pub name: String,
    pub types: Vec<HostType>,
}

impl HostAssembly {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_type(mut self, ty: HostType) -> Self {
        self.types.push(ty);
        self
    }
}

/// Outcome of a surface build
#[derive(Debug, Clone, Default)]
pub struct SurfaceReport {
    /// Full names of types now reachable from the globals
    pub bound: Vec<String>,
    /// Eligible types that could not be registered
    pub failed: Vec<String>,
}

/// Publishes whitelisted host types into the script globals
pub struct TypeSurfaceBuilder<'p> {
    policy: &'p WhitelistPolicy,
}

impl<'p> TypeSurfaceBuilder<'p> {
    #[must_use]
    pub fn new(policy: &'p WhitelistPolicy) -> Self {
        Self { policy }
    }

    /// Bind every eligible type. Registration failures are logged and skipped.
    pub fn build(&self, lua: &Lua, assemblies: &[HostAssembly]) -> SurfaceReport {
        let mut report = SurfaceReport::default();
        let mut seen = HashSet::new();
        let globals = lua.globals();

        for assembly in assemblies {
            let allowed = self.policy.allows_assembly(&assembly.name);
            if !allowed {
                debug!(target: "plugins", "Assembly {} is not whitelisted", assembly.name);
            }

            for ty in &assembly.types {
                // the entry type is found wherever it lives
                let eligible = if allowed {
                    self.policy.is_type_eligible(ty)
                } else {
                    self.policy.is_entry_type(ty)
                };
                if !eligible {
                    continue;
                }

                let full_name = ty.full_name();
                if !seen.insert(full_name.clone()) {
                    debug!(target: "plugins", "Type {} already bound, skipping duplicate", full_name);
                    continue;
                }

                match bind_type(lua, &globals, ty) {
                    Ok(()) => report.bound.push(full_name),
                    Err(e) => {
                        warn!(target: "plugins", "Failed to register type {}: {}", full_name, e);
                        report.failed.push(full_name);
                    }
                }
            }
        }

        debug!(
            target: "plugins",
            "Type surface built: {} bound, {} failed",
            report.bound.len(),
            report.failed.len()
        );
        report
    }
}

/// Bind `ty` under its namespace. A table already in the slot (a namespace
/// node, usually) is extended in place so nothing bound under it is lost.
fn bind_type<'lua>(lua: &'lua Lua, globals: &Table<'lua>, ty: &HostType) -> mlua::Result<()> {
    let parent = namespace_table(lua, globals, &ty.namespace)?;

    let binding = match parent.get::<_, Value>(ty.name.as_str())? {
        Value::Nil => {
            let created = lua.create_table()?;
            parent.set(ty.name.as_str(), created.clone())?;
            created
        }
        Value::Table(existing) => {
            for function in &ty.statics {
                if let Value::Table(_) = existing.get::<_, Value>(function.name())? {
                    return Err(mlua::Error::RuntimeError(format!(
                        "static '{}' of '{}' would replace a nested namespace",
                        function.name(),
                        ty.full_name()
                    )));
                }
            }
            existing
        }
        other => {
            return Err(mlua::Error::RuntimeError(format!(
                "'{}' is already a {}",
                ty.full_name(),
                other.type_name()
            )));
        }
    };

    binding.set("FullName", ty.full_name())?;
    binding.set("Kind", ty.kind.as_str())?;
    for function in &ty.statics {
        binding.set(function.name(), FunctionBinder::bind(lua, Rc::clone(function))?)?;
    }
    Ok(())
}

/// Walk a dotted `path` from `root`, creating an empty table for each missing
/// segment. An empty path yields `root`. A segment already holding a
/// non-table value is an error.
pub fn namespace_table<'lua>(lua: &'lua Lua, root: &Table<'lua>, path: &str) -> mlua::Result<Table<'lua>> {
    let mut current = root.clone();
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current.get::<_, Value>(segment)? {
            Value::Table(existing) => existing,
            Value::Nil => {
                let created = lua.create_table()?;
                current.set(segment, created.clone())?;
                created
            }
            other => {
                return Err(mlua::Error::RuntimeError(format!(
                    "namespace segment '{}' of '{}' is already a {}",
                    segment,
                    path,
                    other.type_name()
                )));
            }
        };
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::HostValue;

    fn policy() -> WhitelistPolicy {
        WhitelistPolicy::new(["Game.Core"], ["Game."], Some("Host.Interface".to_string()))
    }

    fn assemblies() -> Vec<HostAssembly> {
        vec![
            HostAssembly::new("Game.Core")
                .with_type(HostType::new("Game.World", "Player", TypeKind::Reference))
                .with_type(HostType::new("System", "Int32", TypeKind::Value))
                .with_type(HostType::new("System", "String", TypeKind::String))
                .with_type(HostType::new("System", "Console", TypeKind::Reference))
                .with_type(HostType::new("System.IO", "File", TypeKind::Reference))
                .with_type(HostType::new("", "Globals", TypeKind::Reference)),
            HostAssembly::new("Host.Runtime").with_type(
                HostType::new("Host", "Interface", TypeKind::Reference)
                    .with_static(FunctionBinding::new("Version", |_, _| Ok(HostValue::from("1.0.0")))),
            ),
            HostAssembly::new("Untrusted")
                .with_type(HostType::new("Game.World", "Backdoor", TypeKind::Reference)),
        ]
    }

    fn reachable(lua: &Lua, path: &str) -> bool {
        lua.load(format!("return {path} ~= nil")).eval::<bool>().unwrap_or(false)
    }

    #[test]
    fn test_whitelisted_types_are_reachable() {
        let lua = Lua::new();
        let policy = policy();
        let report = TypeSurfaceBuilder::new(&policy).build(&lua, &assemblies());

        assert!(reachable(&lua, "Game.World.Player"));
        assert!(reachable(&lua, "System.Int32"));
        assert!(reachable(&lua, "System.String"));
        assert!(reachable(&lua, "Globals"));
        assert!(report.failed.is_empty());
        assert_eq!(report.bound.len(), 5);
    }

    #[test]
    fn test_excluded_types_are_absent() {
        let lua = Lua::new();
        let policy = policy();
        TypeSurfaceBuilder::new(&policy).build(&lua, &assemblies());

        assert!(!reachable(&lua, "System.Console"));
        assert!(!reachable(&lua, "System.IO"));
        assert!(!reachable(&lua, "Game.World.Backdoor"));
    }

    #[test]
    fn test_entry_type_escape_hatch() {
        let lua = Lua::new();
        let policy = policy();
        TypeSurfaceBuilder::new(&policy).build(&lua, &assemblies());

        let version: String = lua.load("return Host.Interface.Version()").eval().unwrap();
        assert_eq!(version, "1.0.0");
        let name: String = lua.load("return Host.Interface.FullName").eval().unwrap();
        assert_eq!(name, "Host.Interface");
    }

    #[test]
    fn test_failed_registration_is_skipped() {
        let lua = Lua::new();
        lua.globals().set("Game", 5).unwrap();
        let policy = policy();
        let report = TypeSurfaceBuilder::new(&policy).build(&lua, &assemblies());

        assert_eq!(report.failed, vec!["Game.World.Player".to_string()]);
        assert!(reachable(&lua, "System.Int32"));
    }

    #[test]
    fn test_type_over_namespace_keeps_nested_types() {
        let lua = Lua::new();
        let policy = WhitelistPolicy::new(["Game.Core"], ["Game"], None);
        let assemblies = vec![HostAssembly::new("Game.Core")
            .with_type(HostType::new("Game.World", "Player", TypeKind::Reference))
            .with_type(
                HostType::new("", "Game", TypeKind::Reference)
                    .with_static(FunctionBinding::new("Tick", |_, _| Ok(HostValue::Int(1)))),
            )];
        let report = TypeSurfaceBuilder::new(&policy).build(&lua, &assemblies);

        assert_eq!(report.bound, vec!["Game.World.Player".to_string(), "Game".to_string()]);
        assert!(reachable(&lua, "Game.World.Player"));
        let full_name: String = lua.load("return Game.FullName").eval().unwrap();
        assert_eq!(full_name, "Game");
        let tick: i64 = lua.load("return Game.Tick()").eval().unwrap();
        assert_eq!(tick, 1);
    }

    #[test]
    fn test_static_never_replaces_a_namespace() {
        let lua = Lua::new();
        let policy = WhitelistPolicy::new(["Game.Core"], ["Game"], None);
        let assemblies = vec![HostAssembly::new("Game.Core")
            .with_type(HostType::new("Game.World", "Player", TypeKind::Reference))
            .with_type(
                HostType::new("", "Game", TypeKind::Reference)
                    .with_static(FunctionBinding::new("World", |_, _| Ok(HostValue::Void))),
            )];
        let report = TypeSurfaceBuilder::new(&policy).build(&lua, &assemblies);

        assert_eq!(report.failed, vec!["Game".to_string()]);
        assert!(reachable(&lua, "Game.World.Player"));
    }

    #[test]
    fn test_namespace_table_reuses_segments() {
        let lua = Lua::new();
        let globals = lua.globals();
        let a = namespace_table(&lua, &globals, "A.B").unwrap();
        a.set("x", 1).unwrap();
        let b = namespace_table(&lua, &globals, "A.B").unwrap();
        assert_eq!(b.get::<_, i64>("x").unwrap(), 1);
    }
}

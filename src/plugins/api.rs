//! Built-in script API available to every plugin
use tracing::info;

use crate::binding::{FunctionBinding, HostValue, LibraryBinding, ParamType};

/// Name under which the built-in library is registered
pub const CORE_LIBRARY: &str = "core";

/// The `core` library, merged into the script globals:
///
/// - `Puts(message)` writes a line to the host log
/// - `V(major, minor, patch)` builds a version triple for a plugin's `Version`
#[must_use]
pub fn core_library() -> LibraryBinding {
    LibraryBinding::new(CORE_LIBRARY)
        .global(true)
        .function(
            FunctionBinding::new("Puts", |_, args| {
                info!(target: "plugins", "{}", render(args.get(0)));
                Ok(HostValue::Void)
            })
            .optional("message", ParamType::Any, HostValue::Void),
        )
        .function(
            FunctionBinding::new("V", |_, args| {
                let mut parts = Vec::with_capacity(3);
                for idx in 0..3 {
                    let part = args.int(idx)?;
                    if part < 0 {
                        anyhow::bail!("version component {} must not be negative", idx + 1);
                    }
                    parts.push(HostValue::Int(part));
                }
                Ok(HostValue::List(parts))
            })
            .param("major", ParamType::Int)
            .param("minor", ParamType::Int)
            .optional("patch", ParamType::Int, HostValue::Int(0)),
        )
}

fn render(value: &HostValue) -> String {
    match value {
        HostValue::Void => "nil".to_string(),
        HostValue::Str(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::Lua;

    #[test]
    fn test_core_library_is_global() {
        let lua = Lua::new();
        core_library().expose(&lua).unwrap();
        let ok: bool = lua.load("return Puts ~= nil and V ~= nil").eval().unwrap();
        assert!(ok);
        lua.load(r#"Puts("hello"); Puts({a = 1}); Puts()"#).exec().unwrap();
    }

    #[test]
    fn test_version_helper() {
        let lua = Lua::new();
        core_library().expose(&lua).unwrap();
        let parts: Vec<i64> = lua.load("return V(1, 2, 3)").eval().unwrap();
        assert_eq!(parts, vec![1, 2, 3]);
        let parts: Vec<i64> = lua.load("return V(2, 5)").eval().unwrap();
        assert_eq!(parts, vec![2, 5, 0]);
        assert!(lua.load("return V(-1, 0, 0)").exec().is_err());
    }

    #[test]
    fn test_render() {
        assert_eq!(render(&HostValue::from("x")), "x");
        assert_eq!(render(&HostValue::Int(4)), "4");
        assert_eq!(render(&HostValue::Void), "nil");
    }
}

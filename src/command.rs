//! Console commands accepted by the `hookhost` binary

use crate::binding::HostValue;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Show loaded plugins
    List,
    /// Reload one plugin by name
    Reload(String),
    /// Raise a hook with arguments
    Hook { name: String, args: Vec<HostValue> },
    Quit,
}

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    ///
    /// Hook arguments are whitespace separated JSON values; a token that is
    /// not valid JSON is taken as a plain string.
    pub fn parse(line: &str) -> Option<Result<Self, String>> {
        let mut tokens = line.split_whitespace();
        let head = tokens.next()?;

        Some(match head {
            "list" => Ok(Command::List),
            "quit" | "exit" => Ok(Command::Quit),
            "reload" => match tokens.next() {
                Some(name) => Ok(Command::Reload(name.to_string())),
                None => Err("usage: reload <plugin>".to_string()),
            },
            hook => Ok(Command::Hook {
                name: hook.to_string(),
                args: tokens.map(parse_argument).collect(),
            }),
        })
    }
}

fn parse_argument(token: &str) -> HostValue {
    serde_json::from_str(token).unwrap_or_else(|_| HostValue::Str(token.to_string()))
}

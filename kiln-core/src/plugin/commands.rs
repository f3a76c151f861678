//! Command table: named commands plus one-level string aliases.

use anyhow::Result;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::KilnError;

type CommandCallable = dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// A command a unit registers. `run` receives the command arguments
/// (`{"_": [positional...], ...}`).
#[derive(Clone)]
pub struct Command {
    pub name: String,
    pub alias: Option<String>,
    pub description: Option<String>,
    run: Arc<CommandCallable>,
}

impl Command {
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            alias: None,
            description: None,
            run: Arc::new(move |args| -> BoxFuture<'static, Result<Value>> { Box::pin(run(args)) }),
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub async fn call(&self, args: Value) -> Result<Value> {
        (self.run)(args).await
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("alias", &self.alias)
            .field("description", &self.description)
            .finish()
    }
}

/// A slot in the command table.
#[derive(Debug, Clone)]
pub enum CommandEntry {
    Direct(Command),
    /// Points at another command by name. Resolved one hop only.
    Alias(String),
}

/// Registered commands by name.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    entries: BTreeMap<String, CommandEntry>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a command and, if given, its alias. A taken name is a conflict;
    /// an alias silently replaces whatever held that name.
    pub fn register(&mut self, command: Command) -> Result<()> {
        if self.entries.contains_key(&command.name) {
            return Err(KilnError::Conflict(format!(
                "api.registerCommand() failed, the command {} is exists.",
                command.name
            ))
            .into());
        }
        let name = command.name.clone();
        if let Some(alias) = command.alias.clone() {
            self.entries.insert(alias, CommandEntry::Alias(name.clone()));
        }
        self.entries.insert(name, CommandEntry::Direct(command));
        Ok(())
    }

    /// Resolves `name` to a command, following at most one alias.
    pub fn resolve(&self, name: &str) -> Result<&Command> {
        let unknown = || -> anyhow::Error {
            KilnError::UnknownCommand(format!(
                "run command failed, command {name} does not exists."
            ))
            .into()
        };
        match self.entries.get(name) {
            Some(CommandEntry::Direct(command)) => Ok(command),
            Some(CommandEntry::Alias(target)) => match self.entries.get(target) {
                Some(CommandEntry::Direct(command)) => Ok(command),
                _ => Err(unknown()),
            },
            None => Err(unknown()),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Names of direct (non-alias) commands, sorted.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| matches!(entry, CommandEntry::Direct(_)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Direct commands, sorted by name.
    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.entries.values().filter_map(|entry| match entry {
            CommandEntry::Direct(command) => Some(command),
            CommandEntry::Alias(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo(name: &str) -> Command {
        let label = name.to_string();
        Command::new(name, move |_args| {
            let label = label.clone();
            async move { Ok(json!(label)) }
        })
    }

    #[tokio::test]
    async fn test_alias_resolves_one_hop() {
        let mut table = CommandTable::new();
        table.register(echo("build").alias("b")).unwrap();

        let command = table.resolve("b").unwrap();
        assert_eq!(command.call(json!({})).await.unwrap(), json!("build"));
        assert_eq!(table.names(), vec!["build".to_string()]);
    }

    #[test]
    fn test_multi_hop_alias_is_unknown() {
        let mut table = CommandTable::new();
        table.register(echo("build").alias("b")).unwrap();
        table.register(echo("bb").alias("x")).unwrap();
        // Point `x` at the alias `b` rather than at a command.
        table.entries.insert("x".into(), CommandEntry::Alias("b".into()));

        let err = table.resolve("x").unwrap_err();
        assert_eq!(
            err.downcast_ref::<KilnError>().map(KilnError::kind),
            Some("UnknownCommandError")
        );
    }

    #[test]
    fn test_duplicate_command_conflicts() {
        let mut table = CommandTable::new();
        table.register(echo("dev")).unwrap();
        let err = table.register(echo("dev")).unwrap_err();
        assert!(err.to_string().contains("dev"));
    }
}

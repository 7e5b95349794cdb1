//! Path-addressed dialog memory
//!
//! A memory path is `<scope>.<property path>`, e.g. `user.profile.name`. The
//! scope selects which backing map is read or written (the turn, a bot state,
//! the active dialog, ...). Short aliases such as `$name` are rewritten to a
//! full path before resolution, and a path whose first segment is not a known
//! scope falls back to the default scope.

mod path;
mod scopes;

#[cfg(test)]
mod proptests;

pub use path::{PathSegment, PropertyPath};
pub use scopes::{
    BotStateScope, ClassScope, DialogContextScope, DialogScope, MemoryScope, SettingsScope,
    ThisScope, TurnScope,
};

use crate::error::{Error, Result};
use crate::state::{CONVERSATION_STATE, USER_STATE};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::sync::Arc;

/// Scope used for paths that do not name one
pub const DEFAULT_SCOPE: &str = "dialog";

#[derive(Debug, Clone, PartialEq, Eq)]
struct AliasRule {
    prefix: String,
    target: String,
    /// Select the first element of the aliased collection (`@entity`)
    first_value: bool,
}

/// Prefix rewrites applied before scope resolution.
///
/// Rules are tried longest prefix first, so `@@` wins over `@`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasTable {
    rules: Vec<AliasRule>,
}

impl Default for AliasTable {
    fn default() -> Self {
        Self::empty()
            .with_alias("$", "dialog.")
            .with_alias("#", "turn.recognized.intents.")
            .with_alias("@@", "turn.recognized.entities.")
            .with_first_value_alias("@", "turn.recognized.entities.")
            .with_alias("%", "class.")
    }
}

impl AliasTable {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_alias(self, prefix: impl Into<String>, target: impl Into<String>) -> Self {
        self.with_rule(prefix.into(), target.into(), false)
    }

    /// Alias whose first path segment selects element `[0]`
    pub fn with_first_value_alias(self, prefix: impl Into<String>, target: impl Into<String>) -> Self {
        self.with_rule(prefix.into(), target.into(), true)
    }

    fn with_rule(mut self, prefix: String, target: String, first_value: bool) -> Self {
        self.rules.retain(|r| r.prefix != prefix);
        self.rules.push(AliasRule {
            prefix,
            target,
            first_value,
        });
        self.rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        self
    }

    /// Rewrite a leading alias; expressions without one come back unchanged
    pub fn expand<'e>(&self, expr: &'e str) -> Cow<'e, str> {
        for rule in &self.rules {
            let Some(rest) = expr.strip_prefix(rule.prefix.as_str()) else {
                continue;
            };
            let target = rule.target.trim_end_matches('.');
            if rest.is_empty() {
                return Cow::Owned(target.to_string());
            }

            let rest = if rule.first_value {
                let split = rest.find(['.', '[']).unwrap_or(rest.len());
                let (head, tail) = rest.split_at(split);
                format!("{head}[0]{tail}")
            } else {
                rest.to_string()
            };
            let separator = if rest.starts_with('[') { "" } else { "." };
            return Cow::Owned(format!("{target}{separator}{rest}"));
        }
        Cow::Borrowed(expr)
    }
}

/// A path resolved to its scope
pub struct ResolvedPath<'r> {
    pub scope: &'r dyn MemoryScope,
    pub path: PropertyPath,
}

/// Registered memory scopes plus the alias table and default scope
pub struct ScopeRegistry {
    scopes: Vec<Arc<dyn MemoryScope>>,
    aliases: AliasTable,
    default_scope: Option<String>,
}

impl Default for ScopeRegistry {
    fn default() -> Self {
        Self::with_defaults(Map::new())
    }
}

impl ScopeRegistry {
    /// No scopes, no aliases, no default scope
    pub fn empty() -> Self {
        Self {
            scopes: Vec::new(),
            aliases: AliasTable::empty(),
            default_scope: None,
        }
    }

    /// Standard scopes and aliases, with `settings` as the read-only
    /// `settings` scope
    pub fn with_defaults(settings: Map<String, Value>) -> Self {
        Self {
            aliases: AliasTable::default(),
            default_scope: Some(DEFAULT_SCOPE.to_string()),
            ..Self::empty()
        }
        .register(TurnScope)
        .register(BotStateScope::new("conversation", CONVERSATION_STATE))
        .register(BotStateScope::new("user", USER_STATE))
        .register(DialogScope)
        .register(ThisScope)
        .register(ClassScope)
        .register(SettingsScope::new(settings))
        .register(DialogContextScope)
    }

    /// Register a scope, replacing any scope with the same name
    #[must_use]
    pub fn register(mut self, scope: impl MemoryScope + 'static) -> Self {
        self.scopes
            .retain(|s| !s.name().eq_ignore_ascii_case(scope.name()));
        self.scopes.push(Arc::new(scope));
        self
    }

    #[must_use]
    pub fn with_aliases(mut self, aliases: AliasTable) -> Self {
        self.aliases = aliases;
        self
    }

    /// Scope for paths that do not start with a scope name; `None` makes
    /// such paths an error
    #[must_use]
    pub fn with_default_scope(mut self, name: Option<&str>) -> Self {
        self.default_scope = name.map(String::from);
        self
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    /// Look up a scope by name, ignoring ASCII case
    pub fn scope(&self, name: &str) -> Option<&dyn MemoryScope> {
        self.scopes
            .iter()
            .find(|s| s.name().eq_ignore_ascii_case(name))
            .map(Arc::as_ref)
    }

    pub fn scope_names(&self) -> impl Iterator<Item = &str> {
        self.scopes.iter().map(|s| s.name())
    }

    /// Expand aliases and split off the scope
    pub fn resolve(&self, expr: &str) -> Result<ResolvedPath<'_>> {
        let expanded = self.aliases.expand(expr.trim());
        let split = expanded.find(['.', '[']).unwrap_or(expanded.len());
        let (head, tail) = expanded.split_at(split);

        if let Some(scope) = self.scope(head) {
            let tail = tail.strip_prefix('.').unwrap_or(tail);
            return Ok(ResolvedPath {
                scope,
                path: PropertyPath::parse(tail)?,
            });
        }

        let Some(default) = &self.default_scope else {
            return Err(Error::invalid_path(expr, format!("unknown memory scope '{head}'")));
        };
        let scope = self.scope(default).ok_or_else(|| {
            Error::invalid_path(expr, format!("default scope '{default}' is not registered"))
        })?;
        Ok(ResolvedPath {
            scope,
            path: PropertyPath::parse(&expanded)?,
        })
    }

    /// Canonical `scope.path` form of an expression
    pub fn normalize(&self, expr: &str) -> Result<String> {
        let resolved = self.resolve(expr)?;
        let path = resolved.path.to_string();
        Ok(match path.chars().next() {
            None => resolved.scope.name().to_string(),
            Some('[') => format!("{}{path}", resolved.scope.name()),
            Some(_) => format!("{}.{path}", resolved.scope.name()),
        })
    }
}

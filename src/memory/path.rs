//! Property paths into JSON memory
//!
//! Grammar: dotted keys (`a.b`), bracket indices (`a[2]`) and quoted bracket
//! keys (`a['x.y']`). Reads never fail; missing or out-of-range segments
//! simply yield `None`. Writes create only the containers needed to hold the
//! leaf.

use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

/// Largest index a write may create; arrays are padded with nulls up to it
pub const MAX_INDEX: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parsed property path
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PropertyPath {
    segments: Vec<PathSegment>,
}

impl PropertyPath {
    /// Parse a path expression; an empty (or blank) expression is the root
    pub fn parse(expr: &str) -> Result<Self> {
        let fail = |reason: &str| Error::invalid_path(expr, reason);
        let mut segments = Vec::new();
        let mut chars = expr.trim().chars().peekable();
        if chars.peek().is_none() {
            return Ok(Self::default());
        }

        // True at the start and right after a '.'
        let mut expect_key = true;
        loop {
            match chars.peek().copied() {
                None if expect_key => return Err(fail("path ends with '.'")),
                None => break,
                Some('[') => {
                    chars.next();
                    let segment = parse_bracket(&mut chars).ok_or_else(|| fail("malformed '[...]'"))?;
                    segments.push(segment);
                    expect_key = false;
                }
                Some('.') if expect_key => return Err(fail("empty segment")),
                Some('.') => {
                    chars.next();
                    expect_key = true;
                }
                Some(_) if !expect_key => return Err(fail("expected '.' or '[' after ']'")),
                Some(_) => {
                    let mut key = String::new();
                    while let Some(&c) = chars.peek() {
                        if c == '.' || c == '[' {
                            break;
                        }
                        key.push(c);
                        chars.next();
                    }
                    segments.push(PathSegment::Key(key));
                    expect_key = false;
                }
            }
        }

        Ok(Self { segments })
    }

    pub fn from_segments(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Look up the path. Keys match exactly first, then ignoring ASCII case.
    pub fn get<'v>(&self, root: &'v Map<String, Value>) -> Option<&'v Value> {
        let (first, rest) = self.segments.split_first()?;
        let PathSegment::Key(key) = first else {
            return None;
        };
        let mut current = lookup_key(root, key)?;
        for segment in rest {
            current = match (segment, current) {
                (PathSegment::Key(key), Value::Object(map)) => lookup_key(map, key)?,
                (PathSegment::Index(index), Value::Array(items)) => items.get(*index)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Assign the leaf, creating intermediate objects (for keys) and arrays
    /// (for indices) where they are missing or null. Existing keys are
    /// matched the same way `get` matches them, so a write never shadows a
    /// key that differs only in case.
    pub fn set(&self, root: &mut Map<String, Value>, value: Value) -> Result<()> {
        let Some((first, rest)) = self.segments.split_first() else {
            return Err(Error::invalid_path(self.to_string(), "cannot assign to the root"));
        };
        let PathSegment::Key(first_key) = first else {
            return Err(Error::invalid_path(
                self.to_string(),
                "path must start with a property name",
            ));
        };

        let Some((last, middle)) = rest.split_last() else {
            let key = stored_key(root, first_key);
            root.insert(key, value);
            return Ok(());
        };

        // Validate before creating anything so a failed write leaves no trace
        self.check_writable(root)?;

        let key = stored_key(root, first_key);
        let mut current = root.entry(key).or_insert(Value::Null);
        for segment in middle {
            current = self.slot(current, segment)?;
        }
        *self.slot(current, last)? = value;
        Ok(())
    }

    /// Remove the leaf, returning what was there
    pub fn remove(&self, root: &mut Map<String, Value>) -> Option<Value> {
        let (last, parents) = self.segments.split_last()?;
        let Some((first, middle)) = parents.split_first() else {
            return match last {
                PathSegment::Key(key) => {
                    let key = stored_key(root, key);
                    root.remove(&key)
                }
                PathSegment::Index(_) => None,
            };
        };
        let PathSegment::Key(first_key) = first else {
            return None;
        };

        let mut current = lookup_key_mut(root, first_key)?;
        for segment in middle {
            current = match (segment, current) {
                (PathSegment::Key(key), Value::Object(map)) => lookup_key_mut(map, key)?,
                (PathSegment::Index(index), Value::Array(items)) => items.get_mut(*index)?,
                _ => return None,
            };
        }
        match (last, current) {
            (PathSegment::Key(key), Value::Object(map)) => {
                let key = stored_key(map, key);
                map.remove(&key)
            }
            (PathSegment::Index(index), Value::Array(items)) if *index < items.len() => {
                Some(items.remove(*index))
            }
            _ => None,
        }
    }

    /// Walk the existing part of the path and fail if it runs into a scalar
    /// or an index past `MAX_INDEX`
    fn check_writable(&self, root: &Map<String, Value>) -> Result<()> {
        for segment in &self.segments {
            if let PathSegment::Index(index) = segment {
                self.check_index(*index)?;
            }
        }
        let mut current: Option<&Value> = match self.segments.first() {
            Some(PathSegment::Key(key)) => lookup_key(root, key),
            _ => None,
        };
        // The leaf itself may be anything; only its parents must be containers
        let parents = self.segments.len().saturating_sub(1);
        for segment in self.segments.iter().take(parents).skip(1) {
            current = match (segment, current) {
                (_, None | Some(Value::Null)) => return Ok(()),
                (PathSegment::Key(key), Some(Value::Object(map))) => lookup_key(map, key),
                (PathSegment::Index(index), Some(Value::Array(items))) => items.get(*index),
                (_, Some(other)) => {
                    return Err(Error::invalid_path(
                        self.to_string(),
                        format!("cannot descend into {}", kind(other)),
                    ))
                }
            };
        }
        match (self.segments.last(), current) {
            (_, None | Some(Value::Null))
            | (Some(PathSegment::Key(_)), Some(Value::Object(_)))
            | (Some(PathSegment::Index(_)), Some(Value::Array(_))) => Ok(()),
            (_, Some(other)) => Err(Error::invalid_path(
                self.to_string(),
                format!("cannot descend into {}", kind(other)),
            )),
        }
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index > MAX_INDEX {
            return Err(Error::invalid_path(
                self.to_string(),
                format!("index {index} is larger than {MAX_INDEX}"),
            ));
        }
        Ok(())
    }

    fn slot<'v>(&self, container: &'v mut Value, segment: &PathSegment) -> Result<&'v mut Value> {
        if container.is_null() {
            *container = match segment {
                PathSegment::Key(_) => Value::Object(Map::new()),
                PathSegment::Index(_) => Value::Array(Vec::new()),
            };
        }
        match (segment, container) {
            (PathSegment::Key(key), Value::Object(map)) => {
                let key = stored_key(map, key);
                Ok(map.entry(key).or_insert(Value::Null))
            }
            (PathSegment::Index(index), Value::Array(items)) => {
                self.check_index(*index)?;
                if items.len() <= *index {
                    items.resize(*index + 1, Value::Null);
                }
                Ok(&mut items[*index])
            }
            (_, other) => Err(Error::invalid_path(
                self.to_string(),
                format!("cannot descend into {}", kind(other)),
            )),
        }
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                PathSegment::Key(key) if needs_quoting(key) => write!(f, "['{key}']")?,
                PathSegment::Key(key) if i == 0 => write!(f, "{key}")?,
                PathSegment::Key(key) => write!(f, ".{key}")?,
                PathSegment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

fn parse_bracket(chars: &mut Peekable<Chars<'_>>) -> Option<PathSegment> {
    match chars.peek().copied()? {
        quote @ ('\'' | '"') => {
            chars.next();
            let mut key = String::new();
            loop {
                let c = chars.next()?;
                if c == quote {
                    break;
                }
                key.push(c);
            }
            (chars.next()? == ']').then_some(PathSegment::Key(key))
        }
        _ => {
            let mut digits = String::new();
            loop {
                let c = chars.next()?;
                if c == ']' {
                    break;
                }
                digits.push(c);
            }
            digits.trim().parse().ok().map(PathSegment::Index)
        }
    }
}

fn lookup_key<'v>(map: &'v Map<String, Value>, key: &str) -> Option<&'v Value> {
    map.get(key).or_else(|| {
        map.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

fn lookup_key_mut<'v>(map: &'v mut Map<String, Value>, key: &str) -> Option<&'v mut Value> {
    let key = stored_key(map, key);
    map.get_mut(&key)
}

/// Spelling of `key` already present in `map` under `lookup_key` rules, or
/// `key` itself when it is new
fn stored_key(map: &Map<String, Value>, key: &str) -> String {
    if map.contains_key(key) {
        return key.to_string();
    }
    map.keys()
        .find(|k| k.eq_ignore_ascii_case(key))
        .map_or_else(|| key.to_string(), Clone::clone)
}

fn needs_quoting(key: &str) -> bool {
    key.is_empty() || key.contains(['.', '[', ']', '\'', '"'])
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

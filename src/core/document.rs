//! Front-matter document splitting and rendering.
//!
//! An entity file is a YAML mapping between two `---` lines followed by a
//! free-text body. The mapping is kept as a raw [`Mapping`] so keys this
//! crate does not know about survive a load/save cycle in their original
//! order, and the body is carried through byte-for-byte.

use serde_yaml::{Mapping, Value};

use crate::error::{Result, RoadmapError};

const DELIMITER: &str = "---";

/// A parsed entity file: raw front matter plus untouched body.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub front_matter: Mapping,
    pub body: String,
}

impl Document {
    pub fn new(front_matter: Mapping, body: impl Into<String>) -> Self {
        Self {
            front_matter,
            body: body.into(),
        }
    }

    /// Parse `---\n<yaml>---\n<body>`. `origin` only feeds error messages.
    pub fn parse(text: &str, origin: &str) -> Result<Self> {
        let (yaml, body) = split(text).ok_or_else(|| RoadmapError::InvalidEntity {
            path: origin.to_string(),
            reason: "missing `---` front matter delimiters".to_string(),
        })?;

        let front_matter = if yaml.trim().is_empty() {
            Mapping::new()
        } else {
            match serde_yaml::from_str::<Value>(yaml) {
                Ok(Value::Mapping(map)) => map,
                Ok(other) => {
                    return Err(RoadmapError::InvalidEntity {
                        path: origin.to_string(),
                        reason: format!("front matter must be a mapping, found {}", kind_of(&other)),
                    });
                }
                Err(err) => {
                    return Err(RoadmapError::InvalidEntity {
                        path: origin.to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        };

        Ok(Self {
            front_matter,
            body: body.to_string(),
        })
    }

    pub fn render(&self) -> Result<String> {
        let yaml = if self.front_matter.is_empty() {
            String::new()
        } else {
            serde_yaml::to_string(&self.front_matter)?
        };
        let mut out = String::with_capacity(yaml.len() + self.body.len() + 8);
        out.push_str(DELIMITER);
        out.push('\n');
        out.push_str(&yaml);
        if !yaml.is_empty() && !yaml.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(DELIMITER);
        out.push('\n');
        out.push_str(&self.body);
        Ok(out)
    }

    /// Set `key`, keeping its position when it already exists.
    pub fn set(&mut self, key: &str, value: Value) {
        let key = Value::String(key.to_string());
        if self.front_matter.get(&key) != Some(&value) {
            self.front_matter.insert(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.front_matter.shift_remove(key);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.front_matter.get(key)
    }
}

fn split(text: &str) -> Option<(&str, &str)> {
    let rest = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == DELIMITER {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    // Closing delimiter on the final line without a trailing newline.
    if rest[offset..].trim_end() == DELIMITER {
        return Some((&rest[..offset], ""));
    }
    None
}

const fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

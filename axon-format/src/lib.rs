#![deny(missing_docs)]
//! Section wire formats for axon.
//!
//! A format is bidirectional: [`SectionFormat::describe_structure`] tells
//! the model which sections to produce, [`SectionFormat::parse`] turns a
//! raw response back into `section name → raw contents`, and
//! [`SectionFormat::format_sections`] renders sections (observations,
//! validator feedback) back into the wire form.
//!
//! Two wire forms exist and the set is closed, so the seam is an enum
//! rather than a trait: XML-style tags (the default) and a single JSON
//! object. Parsing is lenient within the known tagset — unknown names are
//! ignored and repeated sections concatenate.

use axon_core::section::{Section, SectionSpec};
use std::collections::BTreeMap;
use thiserror::Error;

/// Parsed sections: name → raw contents in document order.
pub type SectionMap = BTreeMap<String, Vec<String>>;

/// Errors from section parsing.
#[non_exhaustive]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    /// The response contained none of the known sections. Recoverable —
    /// the loop decides what to feed back.
    #[error("no recognizable sections in response")]
    NoSections,

    /// The response was structurally broken (e.g. unparseable JSON).
    #[error("malformed response: {0}")]
    Malformed(String),

    /// One known section was present but structurally invalid.
    #[error("malformed section <{name}>: {detail}")]
    Section {
        /// The offending section name.
        name: String,
        /// What was wrong with it.
        detail: String,
    },
}

/// A section wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SectionFormat {
    /// XML-style tags: `<name>content</name>`.
    #[default]
    XmlTags,
    /// A single JSON object: `{"name": "content"}`.
    JsonObject,
}

impl SectionFormat {
    /// Describe the expected sections to the model, in the given order.
    pub fn describe_structure(&self, specs: &[SectionSpec]) -> String {
        match self {
            SectionFormat::XmlTags => {
                let blocks: Vec<String> = specs
                    .iter()
                    .map(|s| format!("<{0}>\n{1}\n</{0}>", s.name, s.guidance))
                    .collect();
                blocks.join("\n\n")
            }
            SectionFormat::JsonObject => {
                let mut out = String::from("{\n");
                for (i, s) in specs.iter().enumerate() {
                    out.push_str(&format!(
                        "  {}: {}{}\n",
                        json_string(&s.name),
                        json_string(&s.guidance),
                        if i + 1 < specs.len() { "," } else { "" }
                    ));
                }
                out.push('}');
                out
            }
        }
    }

    /// Parse a raw response into sections, considering only `known`
    /// names. Returns [`FormatError::NoSections`] when none are present.
    pub fn parse(&self, known: &[&str], raw: &str) -> Result<SectionMap, FormatError> {
        match self {
            SectionFormat::XmlTags => parse_xml(known, raw),
            SectionFormat::JsonObject => parse_json(known, raw),
        }
    }

    /// Render sections into the wire form. Output round-trips through
    /// [`parse`](Self::parse).
    pub fn format_sections(&self, sections: &[Section]) -> String {
        match self {
            SectionFormat::XmlTags => {
                let blocks: Vec<String> = sections
                    .iter()
                    .map(|s| format!("<{0}>\n{1}\n</{0}>", s.name, s.content))
                    .collect();
                blocks.join("\n\n")
            }
            SectionFormat::JsonObject => {
                // Repeated names collapse into an array value.
                let mut order: Vec<&str> = Vec::new();
                let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
                for s in sections {
                    if !grouped.contains_key(s.name.as_str()) {
                        order.push(&s.name);
                    }
                    grouped.entry(&s.name).or_default().push(&s.content);
                }
                let mut out = String::from("{\n");
                for (i, name) in order.iter().enumerate() {
                    let contents = &grouped[name];
                    let value = if contents.len() == 1 {
                        json_string(contents[0])
                    } else {
                        let items: Vec<String> =
                            contents.iter().map(|c| json_string(c)).collect();
                        format!("[{}]", items.join(", "))
                    };
                    out.push_str(&format!(
                        "  {}: {}{}\n",
                        json_string(name),
                        value,
                        if i + 1 < order.len() { "," } else { "" }
                    ));
                }
                out.push('}');
                out
            }
        }
    }
}

fn json_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn parse_xml(known: &[&str], raw: &str) -> Result<SectionMap, FormatError> {
    let mut map = SectionMap::new();
    for name in known {
        let open = format!("<{name}>");
        let close = format!("</{name}>");
        let mut pos = 0;
        let mut contents = Vec::new();
        while let Some(i) = raw[pos..].find(&open) {
            let start = pos + i + open.len();
            let Some(j) = raw[start..].find(&close) else {
                return Err(FormatError::Section {
                    name: name.to_string(),
                    detail: "unclosed tag".into(),
                });
            };
            contents.push(raw[start..start + j].trim().to_string());
            pos = start + j + close.len();
        }
        if !contents.is_empty() {
            map.insert(name.to_string(), contents);
        }
    }
    if map.is_empty() {
        return Err(FormatError::NoSections);
    }
    Ok(map)
}

fn parse_json(known: &[&str], raw: &str) -> Result<SectionMap, FormatError> {
    // Models often wrap the object in prose or code fences; take the
    // outermost braces.
    let start = raw.find('{').ok_or(FormatError::NoSections)?;
    let end = raw.rfind('}').ok_or(FormatError::NoSections)?;
    if end < start {
        return Err(FormatError::NoSections);
    }
    let value: serde_json::Value = serde_json::from_str(&raw[start..=end])
        .map_err(|e| FormatError::Malformed(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| FormatError::Malformed("top-level value is not an object".into()))?;

    let mut map = SectionMap::new();
    for name in known {
        let Some(value) = object.get(*name) else {
            continue;
        };
        let contents = match value {
            serde_json::Value::String(s) => vec![s.trim().to_string()],
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => s.trim().to_string(),
                    other => other.to_string(),
                })
                .collect(),
            // Structured payloads (e.g. a typed terminal answer) stay as
            // raw JSON text for the downstream decoder.
            other => vec![other.to_string()],
        };
        if !contents.is_empty() {
            map.insert(name.to_string(), contents);
        }
    }
    if map.is_empty() {
        return Err(FormatError::NoSections);
    }
    Ok(map)
}

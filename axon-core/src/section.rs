//! Named output sections — the unit of structure in model responses.

use serde::{Deserialize, Serialize};

/// A section the model is asked to produce: name plus guidance text
/// describing what belongs in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionSpec {
    /// Section name (the wire tag / object key).
    pub name: String,
    /// Guidance shown to the model in the structure description.
    pub guidance: String,
}

impl SectionSpec {
    /// Create a new section spec.
    pub fn new(name: impl Into<String>, guidance: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guidance: guidance.into(),
        }
    }
}

/// A concrete section instance: name plus raw content. Used for rendering
/// observations and validator feedback back into the wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    /// Section name.
    pub name: String,
    /// Raw section content.
    pub content: String,
}

impl Section {
    /// Create a new section.
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

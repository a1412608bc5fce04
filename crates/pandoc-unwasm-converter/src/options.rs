//! Conversion requests.
//!
//! Maps are `serde_json::Map`, which with the `preserve_order` feature keeps
//! insertion order; argument order follows it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What to convert and how.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConversionOptions {
    /// Input format, e.g. `markdown`.
    pub from: String,

    /// Output format, e.g. `html`.
    pub to: String,

    /// Produce a standalone document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub standalone: Option<bool>,

    /// Generate a table of contents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toc: Option<bool>,

    /// Template for standalone documents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// Template variables.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,

    /// Additional long options, without the leading `--`.
    ///
    /// `true` becomes a bare flag and `false` is passed as `--key false`;
    /// `null` is omitted; arrays repeat the flag once per element.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,

    /// Filters, applied in order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<String>,

    /// Document metadata.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ConversionOptions {
    /// Convert `from` one format `to` another.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn standalone(mut self, standalone: bool) -> Self {
        self.standalone = Some(standalone);
        self
    }

    #[must_use]
    pub fn toc(mut self, toc: bool) -> Self {
        self.toc = Some(toc);
        self
    }

    #[must_use]
    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    #[must_use]
    pub fn variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Add a long option. Re-adding a key keeps its original position.
    #[must_use]
    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn filter(mut self, name: impl Into<String>) -> Self {
        self.filters.push(name.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

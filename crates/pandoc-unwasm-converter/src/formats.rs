//! Version and format catalogue.
//!
//! The module offers no introspection entry point, so these are fixed lists
//! matching the bundled build.

use serde::{Deserialize, Serialize};

/// Version of the bundled converter.
pub const PANDOC_VERSION: &str = "3.1.9";

/// Formats accepted by `-f`.
pub const INPUT_FORMATS: &[&str] = &[
    "commonmark",
    "creole",
    "csv",
    "docbook",
    "docx",
    "dokuwiki",
    "epub",
    "fb2",
    "gfm",
    "haddock",
    "html",
    "ipynb",
    "jats",
    "jira",
    "json",
    "latex",
    "man",
    "markdown",
    "markdown_mmd",
    "markdown_phpextra",
    "markdown_strict",
    "mediawiki",
    "muse",
    "native",
    "odt",
    "opml",
    "org",
    "rst",
    "rtf",
    "t2t",
    "textile",
    "tikiwiki",
    "twiki",
    "vimwiki",
];

/// Formats accepted by `-t`.
pub const OUTPUT_FORMATS: &[&str] = &[
    "asciidoc",
    "asciidoctor",
    "beamer",
    "commonmark",
    "context",
    "docbook",
    "docbook4",
    "docbook5",
    "docx",
    "dokuwiki",
    "dzslides",
    "epub",
    "epub2",
    "epub3",
    "fb2",
    "gfm",
    "haddock",
    "html",
    "html4",
    "html5",
    "icml",
    "ipynb",
    "jats",
    "jira",
    "json",
    "latex",
    "man",
    "markdown",
    "markdown_mmd",
    "markdown_phpextra",
    "markdown_strict",
    "mediawiki",
    "ms",
    "muse",
    "native",
    "odt",
    "opml",
    "opendocument",
    "org",
    "pdf",
    "plain",
    "pptx",
    "revealjs",
    "rst",
    "rtf",
    "s5",
    "slideous",
    "slidy",
    "tei",
    "texinfo",
    "textile",
    "xwiki",
    "zimwiki",
];

/// Version and supported formats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PandocInfo {
    pub version: String,
    pub input_formats: Vec<String>,
    pub output_formats: Vec<String>,
}

impl PandocInfo {
    /// The catalogue of the bundled build.
    pub fn bundled() -> Self {
        Self {
            version: PANDOC_VERSION.to_string(),
            input_formats: INPUT_FORMATS.iter().map(ToString::to_string).collect(),
            output_formats: OUTPUT_FORMATS.iter().map(ToString::to_string).collect(),
        }
    }

    pub fn supports_input(&self, format: &str) -> bool {
        self.input_formats.iter().any(|f| f == format)
    }

    pub fn supports_output(&self, format: &str) -> bool {
        self.output_formats.iter().any(|f| f == format)
    }
}

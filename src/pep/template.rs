use std::{borrow::Cow, fs, path::Path};

use log::debug;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::{
    error::{PepError, PepResult},
    AccessRequest,
};

pub const PLACEHOLDER_ORGANIZATION: &str = "organization";
pub const PLACEHOLDER_SUBJECT_ID: &str = "subjectId";
pub const PLACEHOLDER_ACTION: &str = "action";

const KNOWN_PLACEHOLDERS: &[&str] = &[
    PLACEHOLDER_ORGANIZATION,
    PLACEHOLDER_SUBJECT_ID,
    PLACEHOLDER_ACTION,
];

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder regex is valid")
});

/// Access-request template, loaded once at startup and shared read-only.
///
/// A `Template` can only be obtained through [`Template::load`] or
/// [`Template::from_source`], both of which reject empty sources and unknown
/// placeholders, so holding one means rendering is always possible.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    escape_values: bool,
}

impl Template {
    pub fn load<P>(path: P) -> PepResult<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|e| {
            PepError::Configuration(format!(
                "Unable to read access request template from {}: {e}",
                path.display()
            ))
        })?;
        debug!("Access request template read from {}", path.display());
        Self::from_source(source)
    }

    pub fn from_source<S: Into<String>>(source: S) -> PepResult<Self> {
        let source = source.into();
        if source.trim().is_empty() {
            return Err(PepError::Configuration(
                "Access request template is empty".to_string(),
            ));
        }

        for caps in PLACEHOLDER_RE.captures_iter(&source) {
            let name = &caps[1];
            if !KNOWN_PLACEHOLDERS.contains(&name) {
                return Err(PepError::Configuration(format!(
                    "Unknown placeholder '{name}' in access request template"
                )));
            }
        }

        Ok(Self {
            source,
            escape_values: false,
        })
    }

    /// XML-escape substituted values. Off by default: values are trusted to be
    /// sanitized by the caller.
    pub fn with_escaping(mut self, escape_values: bool) -> Self {
        self.escape_values = escape_values;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Substitutes the request parameters into the template.
    pub fn render(&self, request: &AccessRequest) -> String {
        PLACEHOLDER_RE
            .replace_all(&self.source, |caps: &Captures| {
                let value = match &caps[1] {
                    PLACEHOLDER_ORGANIZATION => request.organization.as_str(),
                    PLACEHOLDER_SUBJECT_ID => request.identity_token.as_str(),
                    PLACEHOLDER_ACTION => request.action.as_str(),
                    // rejected in from_source
                    _ => "",
                };
                self.prepare(value).into_owned()
            })
            .into_owned()
    }

    fn prepare<'a>(&self, value: &'a str) -> Cow<'a, str> {
        if self.escape_values {
            quick_xml::escape::escape(value)
        } else {
            Cow::Borrowed(value)
        }
    }
}

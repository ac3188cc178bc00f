//! Validation of rendered resource declarations.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use super::resource::{is_cluster_scoped, ResourceDeclaration, ResourceKey};
use crate::error::RenderError;

// DNS-1123 subdomain, as used for object names.
static RE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

// DNS-1123 label, as used for namespaces and application names.
static RE_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

static RE_KIND: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z][A-Za-z0-9]*$").unwrap());

const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Returns true if `name` is a valid DNS label (application names, namespaces).
pub fn is_dns_label(name: &str) -> bool {
    name.len() <= MAX_LABEL_LEN && RE_LABEL.is_match(name)
}

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    Invalid { resource: String, message: String },
    Duplicate(ResourceKey),
}

impl From<ValidationIssue> for RenderError {
    fn from(issue: ValidationIssue) -> Self {
        match issue {
            ValidationIssue::Invalid { resource, message } => {
                RenderError::Invalid { resource, message }
            }
            ValidationIssue::Duplicate(key) => RenderError::DuplicateResource { key },
        }
    }
}

/// Validator for a rendered set of declarations.
#[derive(Default)]
pub struct ManifestValidator {
    issues: Vec<ValidationIssue>,
}

impl ManifestValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates every declaration and the set as a whole.
    ///
    /// All issues are collected; the first one is returned as the error.
    pub fn validate(&mut self, declarations: &[ResourceDeclaration]) -> Result<(), RenderError> {
        self.issues.clear();

        let mut seen = HashSet::new();
        for decl in declarations {
            self.validate_declaration(decl);
            let key = decl.key();
            if !seen.insert(key.clone()) {
                self.issues.push(ValidationIssue::Duplicate(key));
            }
        }

        match self.issues.first() {
            Some(issue) => Err(issue.clone().into()),
            None => Ok(()),
        }
    }

    /// All issues found by the last `validate` call.
    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    fn validate_declaration(&mut self, decl: &ResourceDeclaration) {
        let resource = decl.key().to_string();
        let mut fail = |message: String| {
            self.issues.push(ValidationIssue::Invalid {
                resource: resource.clone(),
                message,
            })
        };

        if decl.api_version.trim().is_empty() {
            fail("apiVersion is required".to_string());
        }

        if !RE_KIND.is_match(&decl.kind) {
            fail(format!("kind '{}' is not a valid kind name", decl.kind));
        }

        let name = &decl.metadata.name;
        if name.is_empty() {
            fail("metadata.name is required".to_string());
        } else if name.len() > MAX_NAME_LEN || !RE_NAME.is_match(name) {
            fail(format!("metadata.name '{}' is not a valid DNS subdomain", name));
        }

        match (&decl.metadata.namespace, is_cluster_scoped(&decl.kind)) {
            (Some(ns), true) => fail(format!(
                "{} is cluster-scoped but declares namespace '{}'",
                decl.kind, ns
            )),
            (Some(ns), false) if !is_dns_label(ns) => {
                fail(format!("namespace '{}' is not a valid DNS label", ns))
            }
            (None, false) => fail("namespaced resource has no namespace".to_string()),
            _ => {}
        }
    }
}

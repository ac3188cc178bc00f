//! Expands a revision into the ordered set of resource declarations it declares.
//!
//! A directory is either plain (every `*.yaml`/`*.yml` file below it, in
//! lexical order) or driven by an `overlay.yaml` that composes bases,
//! listed resource files, a namespace override, common labels, patches and
//! template variables. Output depends only on the revision, the path and the
//! render context, so results are cached.

use moka::sync::Cache;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

use super::resource::{
    is_cluster_scoped, Resource, ResourceDeclaration, ResourceKind, API_VERSION,
};
use super::validation::ManifestValidator;
use crate::application::SourceRef;
use crate::error::RenderError;
use crate::source::{join_path, normalize_path, Revision, SourceRepository};

/// File name that turns a directory into an overlay.
pub const OVERLAY_FILE: &str = "overlay.yaml";

const CACHE_CAPACITY: u64 = 256;

static RE_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Overlay resource (`kind: Overlay`).
pub type OverlayResource = Resource<OverlaySpec>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlaySpec {
    /// Directories, relative to the overlay, rendered first.
    #[serde(default)]
    pub bases: Vec<String>,

    /// Files, relative to the overlay, added after the bases.
    #[serde(default)]
    pub resources: Vec<String>,

    /// Namespace forced onto every namespaced resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default)]
    pub common_labels: BTreeMap<String, String>,

    #[serde(default)]
    pub patches: Vec<Patch>,

    /// Template variables. Values set by an including overlay win.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

/// A deep-merge patch applied to one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub target: PatchTarget,
    pub patch: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchTarget {
    pub kind: String,
    pub name: String,
}

/// Per-application inputs to rendering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderContext {
    pub application: String,
    /// Namespace given to resources that declare none.
    pub namespace: String,
}

impl RenderContext {
    pub fn new(application: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            namespace: namespace.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    repo_url: String,
    revision: String,
    path: String,
    context: RenderContext,
}

/// A parsed document and the file it came from.
#[derive(Debug, Clone)]
struct Document {
    origin: String,
    value: Value,
}

/// Documents plus the template variables in effect for them.
#[derive(Debug, Default)]
struct Rendered {
    documents: Vec<Document>,
    vars: BTreeMap<String, String>,
}

pub struct ManifestRenderer {
    source: Arc<dyn SourceRepository>,
    cache: Cache<CacheKey, Arc<Vec<ResourceDeclaration>>>,
    renders: AtomicUsize,
}

impl ManifestRenderer {
    pub fn new(source: Arc<dyn SourceRepository>) -> Self {
        Self {
            source,
            cache: Cache::new(CACHE_CAPACITY),
            renders: AtomicUsize::new(0),
        }
    }

    /// Number of renders that missed the cache.
    pub fn render_count(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    /// Renders `revision.path` of `source` into sorted, validated declarations.
    pub async fn render(
        &self,
        source: &SourceRef,
        revision: &Revision,
        context: &RenderContext,
    ) -> Result<Arc<Vec<ResourceDeclaration>>, RenderError> {
        let key = CacheKey {
            repo_url: source.repo_url.clone(),
            revision: revision.id.clone(),
            path: revision.path.clone(),
            context: context.clone(),
        };
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        self.renders.fetch_add(1, Ordering::SeqCst);
        let root = normalize_path(&revision.path).ok_or_else(|| RenderError::MissingBase {
            path: revision.path.clone(),
        })?;
        // Bases may live outside the application path, so list the whole tree.
        let files: BTreeSet<String> = self
            .source
            .list_files(source, revision, "")
            .await?
            .into_iter()
            .collect();

        let mut stack = Vec::new();
        let rendered = self
            .render_dir(source, revision, &files, &root, &mut stack)
            .await?;

        let mut vars = rendered.vars;
        vars.insert("REVISION".to_string(), revision.id.clone());
        vars.insert("APP".to_string(), context.application.clone());

        let mut declarations = Vec::with_capacity(rendered.documents.len());
        for mut doc in rendered.documents {
            substitute(&mut doc.value, &vars, &doc.origin)?;
            declarations.push(into_declaration(doc, context)?);
        }

        ManifestValidator::new().validate(&declarations)?;
        sort_declarations(&mut declarations);

        let declarations = Arc::new(declarations);
        self.cache.insert(key, declarations.clone());
        log::debug!(
            "Rendered {} resources from {} for {}",
            declarations.len(),
            revision,
            context.application
        );
        Ok(declarations)
    }

    fn render_dir<'a>(
        &'a self,
        source: &'a SourceRef,
        revision: &'a Revision,
        files: &'a BTreeSet<String>,
        dir: &'a str,
        stack: &'a mut Vec<String>,
    ) -> futures_util::future::BoxFuture<'a, Result<Rendered, RenderError>> {
        Box::pin(async move {
            if stack.iter().any(|d| d == dir) {
                return Err(RenderError::BaseCycle {
                    path: dir.to_string(),
                });
            }

            let overlay_path = join_path(dir, OVERLAY_FILE).unwrap_or_default();
            if !files.contains(&overlay_path) {
                return self.render_plain(source, revision, files, dir).await;
            }

            stack.push(dir.to_string());
            let content = self.read(source, revision, &overlay_path).await?;
            let overlay: OverlayResource =
                serde_yaml::from_str(&content).map_err(|e| RenderError::Parse {
                    path: overlay_path.clone(),
                    message: e.to_string(),
                })?;
            if overlay.api_version != API_VERSION || overlay.kind != ResourceKind::Overlay {
                return Err(RenderError::Parse {
                    path: overlay_path,
                    message: format!("expected {} Overlay", API_VERSION),
                });
            }
            let spec = overlay.spec;

            let mut out = Rendered::default();
            for base in &spec.bases {
                let base_dir = join_path(dir, base).ok_or_else(|| RenderError::MissingBase {
                    path: base.clone(),
                })?;
                if stack.iter().any(|d| *d == base_dir) {
                    return Err(RenderError::BaseCycle { path: base_dir });
                }
                let prefix = format!("{}/", base_dir);
                if !files.iter().any(|f| base_dir.is_empty() || f.starts_with(&prefix)) {
                    return Err(RenderError::MissingBase { path: base_dir });
                }
                let base_rendered = self
                    .render_dir(source, revision, files, &base_dir, stack)
                    .await?;
                out.documents.extend(base_rendered.documents);
                out.vars.extend(base_rendered.vars);
            }

            for resource in &spec.resources {
                let path = join_path(dir, resource).ok_or_else(|| RenderError::Parse {
                    path: resource.clone(),
                    message: "resource path leaves the repository".to_string(),
                })?;
                let content = self.read(source, revision, &path).await?;
                out.documents.extend(parse_documents(&path, &content)?);
            }

            out.vars.extend(spec.vars.clone());
            apply_overlay(&spec, &mut out.documents, &overlay_path)?;

            stack.pop();
            Ok(out)
        })
    }

    async fn render_plain(
        &self,
        source: &SourceRef,
        revision: &Revision,
        files: &BTreeSet<String>,
        dir: &str,
    ) -> Result<Rendered, RenderError> {
        let prefix = if dir.is_empty() { String::new() } else { format!("{}/", dir) };
        let mut out = Rendered::default();

        for path in files.iter().filter(|f| f.starts_with(&prefix)) {
            let relative = &path[prefix.len()..];
            let hidden = relative.split('/').any(|c| c.starts_with('.'));
            let is_yaml = path.ends_with(".yaml") || path.ends_with(".yml");
            if hidden || !is_yaml {
                continue;
            }

            let content = self.read(source, revision, path).await?;
            for doc in parse_documents(path, &content)? {
                if is_overlay_document(&doc.value) {
                    log::warn!("Ignoring Overlay document in {} outside an overlay root", path);
                    continue;
                }
                out.documents.push(doc);
            }
        }
        Ok(out)
    }

    async fn read(
        &self,
        source: &SourceRef,
        revision: &Revision,
        path: &str,
    ) -> Result<String, RenderError> {
        let bytes = self.source.get_file(source, revision, path).await?;
        String::from_utf8(bytes).map_err(|_| RenderError::Parse {
            path: path.to_string(),
            message: "file is not valid UTF-8".to_string(),
        })
    }
}

fn is_overlay_document(value: &Value) -> bool {
    value.get("apiVersion").and_then(Value::as_str) == Some(API_VERSION)
        && value.get("kind").and_then(Value::as_str) == Some("Overlay")
}

/// Parses a multi-document YAML file. Empty documents are dropped.
fn parse_documents(path: &str, content: &str) -> Result<Vec<Document>, RenderError> {
    let mut documents = Vec::new();
    for de in serde_yaml::Deserializer::from_str(content) {
        let value = Value::deserialize(de).map_err(|e| RenderError::Parse {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        match value {
            Value::Null => continue,
            Value::Object(_) => documents.push(Document {
                origin: path.to_string(),
                value,
            }),
            _ => {
                return Err(RenderError::Parse {
                    path: path.to_string(),
                    message: "document is not a mapping".to_string(),
                })
            }
        }
    }
    Ok(documents)
}

fn apply_overlay(spec: &OverlaySpec, documents: &mut [Document], overlay_path: &str) -> Result<(), RenderError> {
    for doc in documents.iter_mut() {
        let kind = doc.value.get("kind").and_then(Value::as_str).unwrap_or_default().to_string();
        let Some(metadata) = doc.value.get_mut("metadata").and_then(Value::as_object_mut) else {
            continue;
        };
        if let Some(ns) = &spec.namespace {
            if !is_cluster_scoped(&kind) {
                metadata.insert("namespace".to_string(), Value::String(ns.clone()));
            }
        }
        if !spec.common_labels.is_empty() {
            let labels = metadata
                .entry("labels")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(labels) = labels.as_object_mut() {
                for (k, v) in &spec.common_labels {
                    labels.insert(k.clone(), Value::String(v.clone()));
                }
            }
        }
    }

    for patch in &spec.patches {
        let mut matched = false;
        for doc in documents.iter_mut() {
            let kind = doc.value.get("kind").and_then(Value::as_str);
            let name = doc.value.pointer("/metadata/name").and_then(Value::as_str);
            if kind == Some(patch.target.kind.as_str()) && name == Some(patch.target.name.as_str()) {
                deep_merge(&mut doc.value, &patch.patch);
                matched = true;
            }
        }
        if !matched {
            return Err(RenderError::Invalid {
                resource: format!("{}/{}", patch.target.kind, patch.target.name),
                message: format!("patch target in {} matches no resource", overlay_path),
            });
        }
    }
    Ok(())
}

/// Merges `patch` into `target`. Objects merge key by key, `null` removes a key,
/// anything else replaces.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    deep_merge(target.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Replaces `${NAME}` placeholders in every string of `value`.
fn substitute(value: &mut Value, vars: &BTreeMap<String, String>, origin: &str) -> Result<(), RenderError> {
    match value {
        Value::String(s) => {
            if !s.contains("${") {
                return Ok(());
            }
            let mut missing = None;
            let replaced = RE_PLACEHOLDER.replace_all(s, |caps: &regex::Captures| {
                let name = &caps[1];
                match vars.get(name) {
                    Some(v) => v.clone(),
                    None => {
                        missing.get_or_insert_with(|| name.to_string());
                        String::new()
                    }
                }
            });
            if let Some(name) = missing {
                return Err(RenderError::Template {
                    path: origin.to_string(),
                    message: format!("undefined variable '{}'", name),
                });
            }
            *s = replaced.into_owned();
        }
        Value::Array(items) => {
            for item in items {
                substitute(item, vars, origin)?;
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                substitute(item, vars, origin)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn into_declaration(doc: Document, context: &RenderContext) -> Result<ResourceDeclaration, RenderError> {
    let mut decl: ResourceDeclaration =
        serde_json::from_value(doc.value).map_err(|e| RenderError::Parse {
            path: doc.origin.clone(),
            message: e.to_string(),
        })?;
    decl.content.remove("status");
    if decl.metadata.namespace.is_none() && !is_cluster_scoped(&decl.kind) {
        decl.metadata.namespace = Some(context.namespace.clone());
    }
    Ok(decl)
}

/// Sorts declarations by (dependency weight, kind, namespace, name).
pub fn sort_declarations(declarations: &mut [ResourceDeclaration]) {
    declarations.sort_by(|a, b| {
        (a.weight(), a.key()).cmp(&(b.weight(), b.key()))
    });
}

use std::sync::Arc;

use anyhow::{Context, Result};

use converge::manifest::RenderContext;
use converge::{InMemorySource, ManifestRenderer, SourceRef, SourceRepository};

use crate::cli::{OutputFormat, RenderArgs};
use crate::output::print_structured;

const LOCAL_REPO: &str = "file://local";
const LOCAL_REF: &str = "local";

/// Renders a working copy the way the controller would, without a server.
pub async fn render(args: &RenderArgs, format: OutputFormat) -> Result<()> {
    let source = Arc::new(InMemorySource::new());
    source
        .commit_directory(LOCAL_REPO, LOCAL_REF, &args.dir)
        .with_context(|| format!("Failed to read {}", args.dir.display()))?;

    let source_ref = SourceRef::new(LOCAL_REPO, LOCAL_REF, args.path.as_str());
    let revision = source.resolve_ref(&source_ref).await?;
    let renderer = ManifestRenderer::new(source);
    let declarations = renderer
        .render(
            &source_ref,
            &revision,
            &RenderContext::new(args.app.as_str(), args.namespace.as_str()),
        )
        .await?;

    if print_structured(declarations.as_ref(), format)? {
        return Ok(());
    }
    for (i, declaration) in declarations.iter().enumerate() {
        if i > 0 {
            println!("---");
        }
        print!("{}", serde_yaml::to_string(declaration)?);
    }
    log::info!("Rendered {} resources", declarations.len());
    Ok(())
}

//! Resource declarations and their rendering from source revisions.

pub mod renderer;
pub mod resource;
pub mod validation;

pub use renderer::{ManifestRenderer, OverlayResource, OverlaySpec, RenderContext};
pub use resource::{
    canonical_json, dependency_weight, is_cluster_scoped, is_controller_key, ObjectMeta, Resource,
    ResourceDeclaration, ResourceKey, ResourceKind, API_VERSION, APPLICATION_LABEL,
    CONTROLLER_PREFIX, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};
pub use validation::ManifestValidator;

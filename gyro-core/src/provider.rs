//! Provider - Narrow contract between the primitives and remote clients
//!
//! Resource lifecycle code wraps a specific cloud API behind these traits.
//! The tag reconciler and the convergence poller never talk to AWS directly.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use log::debug;

use crate::resource::ResourceId;
use crate::tags::{self, TagDelta, TagSet};

/// Error type for Provider operations
#[derive(Debug)]
pub struct ProviderError {
    pub message: String,
    pub resource_id: Option<ResourceId>,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref id) = self.resource_id {
            write!(f, "[{}] {}", id, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error)
    }
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            resource_id: None,
            cause: None,
        }
    }

    pub fn for_resource(mut self, id: ResourceId) -> Self {
        self.resource_id = Some(id);
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Return type for async operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Tagging operations for a single remote resource
///
/// Implementations are bound to one resource (type and identifier), so the
/// calls only carry tags.
pub trait TagClient: Send + Sync {
    /// Remove the given tags. Values are the ones currently applied.
    fn untag<'a>(
        &'a self,
        tags: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, ProviderResult<()>>;

    /// Add the given tags with their desired values
    fn tag<'a>(
        &'a self,
        tags: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, ProviderResult<()>>;
}

impl<T: TagClient + ?Sized> TagClient for Box<T> {
    fn untag<'a>(
        &'a self,
        tags: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        (**self).untag(tags)
    }

    fn tag<'a>(
        &'a self,
        tags: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        (**self).tag(tags)
    }
}

/// Converge the remote tags of a resource to `desired`
///
/// Removals are issued before additions so that services rejecting a key
/// present twice in one tagging call still accept changed values. Sides with
/// nothing to do are skipped. Returns the delta that was applied.
pub async fn sync_tags<C: TagClient + ?Sized>(
    client: &C,
    desired: &TagSet,
    current: &TagSet,
) -> ProviderResult<TagDelta> {
    let delta = tags::diff(desired, current);

    if !delta.to_remove.is_empty() {
        debug!("removing {} tag(s)", delta.to_remove.len());
        client.untag(&delta.to_remove).await?;
    }

    if !delta.to_add.is_empty() {
        debug!("adding {} tag(s)", delta.to_add.len());
        client.tag(&delta.to_add).await?;
    }

    Ok(delta)
}

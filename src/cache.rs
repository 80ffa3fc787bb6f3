//! In-memory projection of the routable cluster state.
//!
//! The cache owns all model values; cross references between kinds are plain
//! string keys into the sibling maps, never pointers.

use std::collections::HashMap;

use crate::resources::namespaces::Namespace;
use crate::resources::pods::PodWithRoutes;
use crate::resources::secrets::Secret;

/// The three routing buckets: namespaces and secrets keyed by namespace
/// name, pods keyed by pod name.
#[derive(Debug, Default)]
pub struct Cache {
    pub namespaces: HashMap<String, Namespace>,
    pub pods: HashMap<String, PodWithRoutes>,
    pub secrets: HashMap<String, Secret>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }
}

//! Long-lived resource handles owned by plugin instances.
//!
//! A [`ConnectionHandle`] pairs a stable id with a shared, type-erased
//! resource (a socket, an API client, a watch stream). Handles are cheap to
//! clone; the runtime moves them between instances during a reload without
//! ever reopening the underlying resource.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A resource that can be carried across a plugin reload.
pub trait Resource: Send + Sync + 'static {
    /// Short description of the resource kind, e.g. `"tcp"` or `"http-client"`.
    fn kind(&self) -> &str;

    /// Close the underlying resource. Must be idempotent.
    fn close(&self);

    /// Whether the resource is still usable.
    fn is_open(&self) -> bool {
        true
    }

    /// Downcast support for plugins adopting a handle.
    fn as_any(&self) -> &dyn Any;
}

/// Identified reference to a [`Resource`].
#[derive(Clone)]
pub struct ConnectionHandle {
    id: String,
    resource: Arc<dyn Resource>,
}

impl ConnectionHandle {
    pub fn new(id: impl Into<String>, resource: Arc<dyn Resource>) -> Self {
        Self {
            id: id.into(),
            resource,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn resource(&self) -> &Arc<dyn Resource> {
        &self.resource
    }

    /// Downcast the resource to a concrete type.
    pub fn downcast<T: Any>(&self) -> Option<&T> {
        self.resource.as_any().downcast_ref::<T>()
    }

    /// True when both handles point at the same underlying resource object.
    pub fn same_resource(&self, other: &ConnectionHandle) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.resource), Arc::as_ptr(&other.resource))
    }

    pub fn is_open(&self) -> bool {
        self.resource.is_open()
    }

    pub fn close(&self) {
        self.resource.close();
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("kind", &self.resource.kind())
            .field("open", &self.resource.is_open())
            .finish()
    }
}

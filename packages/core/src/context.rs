//! Hierarchical extension bag carried by every pipeline context.
//!
//! Each logical operation (a session call or one inbound message) owns a
//! subtree of [`Extensions`] nodes. Lookups walk from the node up to the root
//! and return the first match; writes only ever touch the local node, so a
//! child can shadow an ancestor's value without the ancestor observing it.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ContextError;

type Slot = Arc<dyn Any + Send + Sync>;

/// One node of the context tree.
///
/// The parent reference is captured at creation time and never changes.
/// The local bag sits behind a lock only so it can be written through a
/// shared `Arc`; a subtree is never mutated by more than one operation.
pub struct Extensions {
    parent: Option<Arc<Extensions>>,
    local: RwLock<HashMap<TypeId, Slot>>,
}

impl Extensions {
    /// Creates a root node with no parent.
    #[must_use]
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            local: RwLock::new(HashMap::new()),
        })
    }

    /// Creates a child whose lookups fall back to `parent`.
    #[must_use]
    pub fn new_child(parent: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(Arc::clone(parent)),
            local: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the parent node, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Extensions>> {
        self.parent.as_ref()
    }

    /// Returns the nearest instance of `T` held by this node or an ancestor.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::NotFound`] if no node up to the root holds `T`.
    pub fn get<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ContextError> {
        self.try_get::<T>().ok_or(ContextError::NotFound {
            type_name: type_name::<T>(),
        })
    }

    /// Like [`get`](Self::get) but returns `None` on a miss.
    #[must_use]
    pub fn try_get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let key = TypeId::of::<T>();
        let mut node = Some(self);
        while let Some(current) = node {
            if let Some(slot) = current.local.read().get(&key) {
                return Arc::clone(slot).downcast::<T>().ok();
            }
            node = current.parent.as_deref();
        }
        None
    }

    /// Returns the nearest `T`, installing `T::default()` at this node on a miss.
    ///
    /// Ancestors are never written.
    pub fn get_or_create<T: Any + Send + Sync + Default>(&self) -> Arc<T> {
        if let Some(existing) = self.try_get::<T>() {
            return existing;
        }
        let value = Arc::new(T::default());
        self.local
            .write()
            .insert(TypeId::of::<T>(), Arc::clone(&value) as Slot);
        value
    }

    /// Stores `value` at this node, shadowing any ancestor value for this subtree.
    pub fn set<T: Any + Send + Sync>(&self, value: T) {
        self.set_shared(Arc::new(value));
    }

    /// Stores an already shared value at this node.
    pub fn set_shared<T: Any + Send + Sync>(&self, value: Arc<T>) {
        self.local.write().insert(TypeId::of::<T>(), value as Slot);
    }

    /// Removes `T` from this node only. Ancestor values become visible again.
    pub fn remove<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.local
            .write()
            .remove(&TypeId::of::<T>())
            .and_then(|slot| slot.downcast::<T>().ok())
    }

    /// Returns `true` if this node itself (not an ancestor) holds `T`.
    #[must_use]
    pub fn contains_local<T: Any + Send + Sync>(&self) -> bool {
        self.local.read().contains_key(&TypeId::of::<T>())
    }

    /// Depth of this node; the root is 0.
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut node = self.parent.as_deref();
        while let Some(current) = node {
            depth += 1;
            node = current.parent.as_deref();
        }
        depth
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("depth", &self.depth())
            .field("local_entries", &self.local.read().len())
            .finish()
    }
}

//! Per-node store of every locally known interface handle.

use std::collections::HashMap;

use tandem_core::GlobalHandle;

use crate::Flags;

/// The kind of interface a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Publication,
    Input,
    Endpoint,
    Filter,
}

/// Metadata describing one registered interface.
#[derive(Debug, Clone)]
pub struct HandleInfo {
    pub handle: GlobalHandle,
    pub kind: HandleKind,
    pub key: String,
    pub type_name: String,
    pub units: String,
    pub flags: Flags,
}

/// The error type for interface registration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("an interface named {0:?} of the same kind already exists")]
    DuplicateName(String),

    #[error("no interface named {0:?} is known")]
    UnknownTarget(String),

    #[error("type mismatch binding {key:?}: offered {offered:?}, wanted {wanted:?}")]
    TypeMismatch {
        key: String,
        offered: String,
        wanted: String,
    },
}

/// Store of interface handles known at one node. Broker-side instances
/// additionally resolve string keys to global handles for late binding.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    handles: HashMap<GlobalHandle, HandleInfo>,
    by_key: HashMap<(HandleKind, String), GlobalHandle>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle. A `(kind, key)` collision is a duplicate-name
    /// registration error; the offending info is not stored.
    pub fn register(&mut self, info: HandleInfo) -> Result<(), RegistrationError> {
        let key = (info.kind, info.key.clone());
        if self.by_key.contains_key(&key) {
            return Err(RegistrationError::DuplicateName(info.key));
        }
        self.by_key.insert(key, info.handle);
        self.handles.insert(info.handle, info);
        Ok(())
    }

    pub fn lookup(&self, handle: GlobalHandle) -> Option<&HandleInfo> {
        self.handles.get(&handle)
    }

    pub fn lookup_by_key(&self, kind: HandleKind, key: &str) -> Option<&HandleInfo> {
        self.by_key
            .get(&(kind, key.to_owned()))
            .and_then(|handle| self.handles.get(handle))
    }

    /// Resolve a string key to the matching global handle.
    pub fn resolve(&self, kind: HandleKind, key: &str) -> Option<GlobalHandle> {
        self.by_key.get(&(kind, key.to_owned())).copied()
    }

    pub fn for_each(&self, kind: HandleKind, mut f: impl FnMut(&HandleInfo)) {
        for info in self.handles.values().filter(|info| info.kind == kind) {
            f(info);
        }
    }

    /// Remove a handle, returning its info if it was present.
    pub fn remove(&mut self, handle: GlobalHandle) -> Option<HandleInfo> {
        let info = self.handles.remove(&handle)?;
        self.by_key.remove(&(info.kind, info.key.clone()));
        Some(info)
    }

    /// Remove every handle owned by the given federate.
    pub fn remove_federate(&mut self, federate: tandem_core::GlobalFederateId) {
        let owned: Vec<GlobalHandle> = self
            .handles
            .keys()
            .filter(|h| h.federate == federate)
            .copied()
            .collect();
        for handle in owned {
            self.remove(handle);
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{GlobalFederateId, InterfaceHandle};

    fn info(kind: HandleKind, fed: i32, hnd: i32, key: &str) -> HandleInfo {
        HandleInfo {
            handle: GlobalHandle::new(GlobalFederateId::new(fed), InterfaceHandle::new(hnd)),
            kind,
            key: key.to_owned(),
            type_name: "double".to_owned(),
            units: "V".to_owned(),
            flags: Flags::empty(),
        }
    }

    #[test]
    fn register_lookup_remove() {
        let mut reg = HandleRegistry::new();
        reg.register(info(HandleKind::Publication, 131_072, 1, "pub1"))
            .unwrap();
        reg.register(info(HandleKind::Input, 131_072, 2, "pub1"))
            .unwrap();

        assert_eq!(
            reg.lookup_by_key(HandleKind::Publication, "pub1")
                .unwrap()
                .handle
                .handle,
            InterfaceHandle::new(1)
        );
        assert_eq!(reg.len(), 2);

        // Same key, same kind is a duplicate.
        assert_eq!(
            reg.register(info(HandleKind::Publication, 131_073, 3, "pub1")),
            Err(RegistrationError::DuplicateName("pub1".to_owned()))
        );

        let handle = reg.resolve(HandleKind::Publication, "pub1").unwrap();
        reg.remove(handle).unwrap();
        assert!(reg.lookup_by_key(HandleKind::Publication, "pub1").is_none());
        assert!(reg.lookup_by_key(HandleKind::Input, "pub1").is_some());
    }

    #[test]
    fn remove_federate_retires_all_handles() {
        let mut reg = HandleRegistry::new();
        reg.register(info(HandleKind::Publication, 131_072, 1, "a"))
            .unwrap();
        reg.register(info(HandleKind::Endpoint, 131_072, 2, "b"))
            .unwrap();
        reg.register(info(HandleKind::Endpoint, 131_073, 1, "c"))
            .unwrap();

        reg.remove_federate(GlobalFederateId::new(131_072));
        assert_eq!(reg.len(), 1);
        assert!(reg.lookup_by_key(HandleKind::Endpoint, "c").is_some());
    }
}

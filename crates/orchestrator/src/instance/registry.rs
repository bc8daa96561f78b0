//! Instance Registry: the set of known instances, indexed by transport peer,
//! by `(mapID, instanceID)`, and by private password.
//!
//! Instances live in a dense `HashMap` keyed by an internal handle that is
//! never reused within a run, so removal never leaves a hole for iteration
//! to stumble over, and no index into a vector is ever invalidated by a
//! `swap_remove`.

use std::collections::HashMap;

use super::{Instance, SysAddr};

/// Opaque, never-reused handle identifying one row in the registry.
/// Distinct from the protocol-level `instanceID` field, which a world itself
/// chooses is free to collide across different `mapID`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(u64);

/// Indexed collection of running (or spawning, or draining) instances.
#[derive(Default)]
pub struct InstanceRegistry {
    next_handle: u64,
    instances: HashMap<InstanceHandle, Instance>,
    /// Insertion order, for iteration during tick.
    order: Vec<InstanceHandle>,
    by_sys_addr: HashMap<SysAddr, InstanceHandle>,
    /// Keyed on `(mapID, instanceID)` only — `cloneID` is intentionally
    /// excluded because the caller addresses a *running* instance, not a
    /// reservation slot.
    by_map_instance: HashMap<(u16, u16), InstanceHandle>,
    by_password: HashMap<String, InstanceHandle>,
}

impl InstanceRegistry {
    /// Creates an empty registry.
    pub fn new() -> InstanceRegistry {
        InstanceRegistry::default()
    }

    /// Inserts a new instance, returning its handle.
    ///
    /// Panics if an instance with the same `(mapID, cloneID, instanceID)`
    /// already exists — upholding that uniqueness invariant is the caller's
    /// responsibility, by allocating fresh instance IDs.
    pub fn add(&mut self, instance: Instance) -> InstanceHandle {
        assert!(
            self.find_key(instance.key()).is_none(),
            "duplicate instance key {:?}",
            instance.key()
        );

        let handle = InstanceHandle(self.next_handle);
        self.next_handle += 1;

        self.by_sys_addr.insert(instance.sys_addr, handle);
        self.by_map_instance.insert((instance.map_id, instance.instance_id), handle);
        if let Some(password) = &instance.private_password {
            self.by_password.insert(password.clone(), handle);
        }

        self.order.push(handle);
        self.instances.insert(handle, instance);

        handle
    }

    /// Removes an instance from every index. No-op if the handle is unknown.
    pub fn remove(&mut self, handle: InstanceHandle) -> Option<Instance> {
        let instance = self.instances.remove(&handle)?;

        self.by_sys_addr.remove(&instance.sys_addr);
        self.by_map_instance.remove(&(instance.map_id, instance.instance_id));
        if let Some(password) = &instance.private_password {
            self.by_password.remove(password);
        }
        self.order.retain(|&h| h != handle);

        Some(instance)
    }

    pub fn get(&self, handle: InstanceHandle) -> Option<&Instance> {
        self.instances.get(&handle)
    }

    pub fn get_mut(&mut self, handle: InstanceHandle) -> Option<&mut Instance> {
        self.instances.get_mut(&handle)
    }

    /// Looks up the instance owning a given transport peer.
    pub fn get_by_sys_addr(&self, addr: SysAddr) -> Option<InstanceHandle> {
        self.by_sys_addr.get(&addr).copied()
    }

    /// Refreshes the remembered transport peer for an instance (used on
    /// `SERVER_INFO` reconnect during crash-recovery).
    pub fn rebind_sys_addr(&mut self, handle: InstanceHandle, new_addr: SysAddr) {
        if let Some(instance) = self.instances.get_mut(&handle) {
            self.by_sys_addr.remove(&instance.sys_addr);
            instance.sys_addr = new_addr;
            self.by_sys_addr.insert(new_addr, handle);
        }
    }

    fn find_key(&self, key: (u16, u32, u16)) -> Option<InstanceHandle> {
        self.by_map_instance.get(&(key.0, key.2)).copied().filter(|&h| {
            self.instances.get(&h).map(|i| i.clone_id == key.1).unwrap_or(false)
        })
    }

    /// `findByMapAndInstance`: addresses a *running* instance by
    /// `(mapID, instanceID)` without regard to `cloneID`.
    pub fn find_by_map_and_instance(&self, map_id: u16, instance_id: u16) -> Option<InstanceHandle> {
        self.by_map_instance.get(&(map_id, instance_id)).copied()
    }

    /// `findByMapID`: every known instance for a map, in insertion order.
    pub fn find_by_map_id(&self, map_id: u16) -> Vec<InstanceHandle> {
        self.order.iter().copied().filter(|&h| self.instances.get(&h).map(|i| i.map_id == map_id).unwrap_or(false)).collect()
    }

    /// `findPrivate`: the instance created with this private password, if any.
    pub fn find_private(&self, password: &str) -> Option<InstanceHandle> {
        self.by_password.get(password).copied()
    }

    /// Records a private password for an already-inserted instance (used by
    /// `CREATE_PRIVATE_ZONE` right after `add`).
    pub fn set_private_password(&mut self, handle: InstanceHandle, password: String) {
        if let Some(instance) = self.instances.get_mut(&handle) {
            instance.private_password = Some(password.clone());
            self.by_password.insert(password, handle);
        }
    }

    /// Whether any known instance is already bound to `port`.
    pub fn is_port_in_use(&self, port: u16) -> bool {
        self.instances.values().any(|i| i.port == port)
    }

    /// Iterates every instance in insertion order (used by the control loop's
    /// per-tick sweep).
    pub fn iter(&self) -> impl Iterator<Item = (InstanceHandle, &Instance)> {
        self.order.iter().filter_map(|&h| self.instances.get(&h).map(|i| (h, i)))
    }

    /// Handles of every instance, in insertion order — a stable snapshot
    /// callers can iterate while mutating individual instances by handle.
    pub fn handles(&self) -> Vec<InstanceHandle> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr(port: u16) -> SysAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn sample(map_id: u16, clone_id: u32, instance_id: u16, port: u16) -> Instance {
        Instance::spawned(map_id, clone_id, instance_id, "10.0.0.5".to_owned(), port, addr(port))
    }

    #[test]
    fn add_then_find_by_map_and_instance() {
        let mut registry = InstanceRegistry::new();
        let handle = registry.add(sample(1200, 0, 1, 9100));

        let found = registry.find_by_map_and_instance(1200, 1).unwrap();
        assert_eq!(found, handle);
    }

    #[test]
    fn cloneid_is_excluded_from_the_find_key() {
        let mut registry = InstanceRegistry::new();
        registry.add(sample(1200, 7, 1, 9100));

        assert!(registry.find_by_map_and_instance(1200, 1).is_some());
    }

    #[test]
    #[should_panic(expected = "duplicate instance key")]
    fn rejects_duplicate_key() {
        let mut registry = InstanceRegistry::new();
        registry.add(sample(1200, 0, 1, 9100));
        registry.add(sample(1200, 0, 1, 9101));
    }

    #[test]
    fn remove_clears_every_index() {
        let mut registry = InstanceRegistry::new();
        let handle = registry.add(sample(1200, 0, 1, 9100));

        registry.remove(handle);

        assert!(registry.get(handle).is_none());
        assert!(registry.find_by_map_and_instance(1200, 1).is_none());
        assert!(registry.get_by_sys_addr(addr(9100)).is_none());
        assert!(!registry.is_port_in_use(9100));
    }

    #[test]
    fn iteration_order_matches_insertion_and_has_no_holes_after_removal() {
        let mut registry = InstanceRegistry::new();
        let a = registry.add(sample(1200, 0, 1, 9100));
        let b = registry.add(sample(1200, 0, 2, 9101));
        let c = registry.add(sample(1200, 0, 3, 9102));

        registry.remove(b);

        let remaining: Vec<_> = registry.iter().map(|(h, _)| h).collect();
        assert_eq!(remaining, vec![a, c]);
    }

    #[test]
    fn private_password_lookup() {
        let mut registry = InstanceRegistry::new();
        let handle = registry.add(sample(1300, 5, 1, 9200));
        registry.set_private_password(handle, "hunter2".to_owned());

        assert_eq!(registry.find_private("hunter2"), Some(handle));
        assert_eq!(registry.get(handle).unwrap().clone_id, 5);
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{DeviceId, Role};

/// King-authoritative snapshot of every member's role.
///
/// Broadcast on every change so members know whom to follow when the
/// king disappears.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Census(BTreeMap<DeviceId, Role>);

impl Census {
    pub fn new() -> Self {
        Self::default()
    }

    /// A census holding only `king`.
    pub fn crowned(king: DeviceId) -> Self {
        let mut census = Self::new();
        census.insert(king, Role::King);
        census
    }

    pub fn insert(&mut self, id: DeviceId, role: Role) -> Option<Role> {
        self.0.insert(id, role)
    }

    pub fn remove(&mut self, id: &DeviceId) -> Option<Role> {
        self.0.remove(id)
    }

    pub fn role_of(&self, id: &DeviceId) -> Option<Role> {
        self.0.get(id).copied()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.0.contains_key(id)
    }

    pub fn king(&self) -> Option<&DeviceId> {
        self.find(Role::King)
    }

    pub fn prince(&self) -> Option<&DeviceId> {
        self.find(Role::Prince)
    }

    fn find(&self, role: Role) -> Option<&DeviceId> {
        self.0.iter().find(|(_, r)| **r == role).map(|(id, _)| id)
    }

    /// Everyone except the king.
    pub fn members(&self) -> impl Iterator<Item = &DeviceId> {
        self.0
            .iter()
            .filter(|(_, r)| **r != Role::King)
            .map(|(id, _)| id)
    }

    pub fn member_count(&self) -> usize {
        self.members().count()
    }

    /// Make `prince` the only prince; any previous prince becomes a peasant.
    pub fn designate_prince(&mut self, prince: &DeviceId) {
        for (id, role) in self.0.iter_mut() {
            if *role == Role::Prince && id != prince {
                *role = Role::Peasant;
            }
        }
        if let Some(role) = self.0.get_mut(prince) {
            *role = Role::Prince;
        }
    }

    /// Member that should be pronounced prince: the greatest identity.
    pub fn heir_candidate(&self) -> Option<&DeviceId> {
        self.members().max()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, Role)> {
        self.0.iter().map(|(id, role)| (id, *role))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

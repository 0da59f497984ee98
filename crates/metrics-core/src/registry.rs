//! Registry of known entities
//!
//! Tracks the nodes and service instances the sampling loop pulls each
//! tick, and backs label-based entity selection in queries. Registration
//! is driven from outside the core (the orchestration layer announces
//! entities); the core never invents entity ids.

use crate::models::EntityRef;
use dashmap::DashMap;
use std::collections::BTreeMap;
use tracing::info;

#[derive(Default)]
pub struct EntityRegistry {
    entities: DashMap<String, EntityRef>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entity: EntityRef) {
        info!(entity_id = %entity.entity_id, kind = ?entity.kind, "Entity registered");
        self.entities.insert(entity.entity_id.clone(), entity);
    }

    pub fn deregister(&self, entity_id: &str) -> Option<EntityRef> {
        self.entities.remove(entity_id).map(|(_, e)| {
            info!(entity_id, "Entity deregistered");
            e
        })
    }

    pub fn get(&self, entity_id: &str) -> Option<EntityRef> {
        self.entities.get(entity_id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<EntityRef> {
        let mut entities: Vec<EntityRef> = self.entities.iter().map(|e| e.value().clone()).collect();
        entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        entities
    }

    /// Entity ids whose labels all match the selector, sorted for
    /// deterministic query results.
    pub fn ids_matching_labels(&self, selector: &BTreeMap<String, String>) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entities
            .iter()
            .filter(|e| e.value().matches_labels(selector))
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

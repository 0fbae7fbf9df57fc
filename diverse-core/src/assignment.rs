//! The presets assigned to one character.

use crate::actor::Actor;
use crate::host::Capabilities;
use crate::preset::{Category, Preset};
use std::collections::BTreeMap;
use std::sync::Arc;

/// At most one preset per category.
#[derive(Debug, Clone, Default)]
pub struct AssignmentSet {
    slots: BTreeMap<Category, Arc<Preset>>,
}

impl AssignmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `preset` in its category's slot, returning the preset it replaced.
    pub fn insert(&mut self, preset: Arc<Preset>) -> Option<Arc<Preset>> {
        self.slots.insert(preset.category(), preset)
    }

    pub fn remove(&mut self, category: Category) -> Option<Arc<Preset>> {
        self.slots.remove(&category)
    }

    pub fn get(&self, category: Category) -> Option<&Arc<Preset>> {
        self.slots.get(&category)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Preset>> {
        self.slots.values()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Preset ids in category order.
    pub fn preset_ids(&self) -> Vec<String> {
        self.slots.values().map(|p| p.id().to_string()).collect()
    }

    /// Keep only slots for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&Arc<Preset>) -> bool) {
        self.slots.retain(|_, preset| keep(preset));
    }

    /// Apply every preset, skipping categories for which `skip` is true.
    /// True if at least one preset applied.
    pub fn apply(
        &self,
        actor: &Actor,
        caps: &Capabilities,
        skip: impl Fn(Category) -> bool,
    ) -> bool {
        let mut applied = false;
        for (category, preset) in &self.slots {
            if skip(*category) {
                continue;
            }
            applied |= preset.apply(actor, caps);
        }
        applied
    }
}

impl FromIterator<Arc<Preset>> for AssignmentSet {
    fn from_iter<I: IntoIterator<Item = Arc<Preset>>>(iter: I) -> Self {
        let mut set = Self::new();
        for preset in iter {
            set.insert(preset);
        }
        set
    }
}

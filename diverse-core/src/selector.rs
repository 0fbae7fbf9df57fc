//! Automatic preset selection.
//!
//! For each category the selector keeps the candidates with the highest
//! [`CoincidenceLevel`] and picks one of them uniformly at random. A category
//! where nothing scores above `NONE` stays empty.

use crate::actor::Actor;
use crate::assignment::AssignmentSet;
use crate::catalog::Catalog;
use crate::conditions::{CoincidenceLevel, Filter};
use crate::host::Exclusion;
use crate::preset::{Category, Preset};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use tracing::debug;

/// Chooses presets for characters from a catalog.
#[derive(Debug, Clone)]
pub struct Selector {
    catalog: Catalog,
}

impl Selector {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    /// Select using the thread-local generator.
    pub fn select(&self, actor: &Actor) -> AssignmentSet {
        self.select_excluding(actor, &Exclusion::None, &mut rand::thread_rng())
    }

    /// Select with a specific RNG (useful for testing).
    pub fn select_with_rng<R: Rng>(&self, actor: &Actor, rng: &mut R) -> AssignmentSet {
        self.select_excluding(actor, &Exclusion::None, rng)
    }

    /// Select, leaving excluded categories empty.
    pub fn select_excluding<R: Rng>(
        &self,
        actor: &Actor,
        exclusion: &Exclusion,
        rng: &mut R,
    ) -> AssignmentSet {
        let presets = self.catalog.presets();
        let mut result = AssignmentSet::new();

        for category in Category::ALL {
            if exclusion.excludes(category) {
                continue;
            }
            let candidates = presets.iter().filter(|p| p.category() == category);
            if let Some(chosen) = pick_best(actor, candidates, rng) {
                debug!(
                    form_id = %actor.form_id,
                    preset = %chosen.id(),
                    category = %category,
                    "preset selected"
                );
                result.insert(chosen);
            }
        }
        result
    }
}

fn pick_best<'a, R: Rng>(
    actor: &Actor,
    candidates: impl Iterator<Item = &'a Arc<Preset>>,
    rng: &mut R,
) -> Option<Arc<Preset>> {
    let mut best = CoincidenceLevel::NONE;
    let mut tied: Vec<&Arc<Preset>> = Vec::new();

    for preset in candidates {
        let level = preset.check(actor, Filter::ALL);
        if level == CoincidenceLevel::NONE || level < best {
            continue;
        }
        if level > best {
            best = level;
            tied.clear();
        }
        tied.push(preset);
    }

    tied.choose(rng).map(|p| Arc::clone(p))
}

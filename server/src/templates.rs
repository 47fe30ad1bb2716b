//! Starting content for each zone, keyed by zone name

use crate::scripts::{ChatBot, Chicken, ScriptRegistry};
use crate::store::WorldStore;
use log::{info, warn};

pub const CHICKEN_COUNT: usize = 10;

/// What a zone contains when its worker starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneTemplate {
    GhibliHills,
    AdventureDungeon,
    Empty,
}

impl ZoneTemplate {
    pub fn for_name(zone_name: &str) -> Self {
        match zone_name {
            "GhibliHills" => ZoneTemplate::GhibliHills,
            "AdventureDungeon" => ZoneTemplate::AdventureDungeon,
            _ => ZoneTemplate::Empty,
        }
    }

    /// Places the template's objects into `store`. Does nothing if the store
    /// already holds objects, so a zone is populated at most once.
    ///
    /// Returns the number of objects placed.
    pub fn populate(&self, store: &WorldStore, registry: &ScriptRegistry) -> usize {
        if !store.is_empty() {
            return 0;
        }

        let wanted: Vec<(&str, usize)> = match self {
            ZoneTemplate::GhibliHills => (0..CHICKEN_COUNT).map(|i| (Chicken::NAME, i)).collect(),
            ZoneTemplate::AdventureDungeon => vec![(ChatBot::NAME, 0)],
            ZoneTemplate::Empty => Vec::new(),
        };

        let mut placed = 0;
        for (script, index) in wanted {
            match registry.create(script, index) {
                Some(object) => {
                    store.insert(object);
                    placed += 1;
                }
                None => warn!("No `{}` template available for {:?}", script, self),
            }
        }

        info!("Populated {:?} with {} objects", self, placed);
        placed
    }
}

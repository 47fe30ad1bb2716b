use super::ScriptError;
use crate::movement::{MoveOutcome, MoveRejection, MovementAuthority};
use crate::store::WorldStore;
use log::info;
use rand::rngs::ThreadRng;
use rand::seq::SliceRandom;
use rand::Rng;
use shared::{ObjectId, WorldObject, ZoneMessage, MAX_DICE_AMOUNT};

/// What a behavior script may touch while it runs for one object.
///
/// The context is rebuilt for every call; anything a script wants to keep
/// between ticks has to be written onto the object itself.
pub struct ScriptContext<'a> {
    store: &'a WorldStore,
    movement: &'a MovementAuthority,
    object_id: ObjectId,
    tick: u64,
    rng: ThreadRng,
}

impl<'a> ScriptContext<'a> {
    pub fn new(
        store: &'a WorldStore,
        movement: &'a MovementAuthority,
        object_id: ObjectId,
        tick: u64,
    ) -> Self {
        Self {
            store,
            movement,
            object_id,
            tick,
            rng: rand::thread_rng(),
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// Number of the tick cycle this call belongs to; 0 for activations.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn object(&self) -> Result<WorldObject, ScriptError> {
        self.store
            .get(self.object_id)
            .ok_or(ScriptError::MissingObject(self.object_id))
    }

    /// Posts a message into the zone as this object.
    pub fn say(&mut self, body: &str) -> Result<ZoneMessage, ScriptError> {
        let object = self.object()?;
        info!("{}: {}", object.name, body);
        Ok(self
            .store
            .post_message(&object.name, body, object.position, false))
    }

    /// Says one of `lines` picked at random. Does nothing for an empty slice.
    pub fn rand_say(&mut self, lines: &[&str]) -> Result<Option<ZoneMessage>, ScriptError> {
        match lines.choose(&mut self.rng) {
            Some(line) => self.say(line).map(Some),
            None => Ok(None),
        }
    }

    /// Rolls dice written as `NdM`, e.g. `"1d100"` or `"3d6"`.
    pub fn roll(&mut self, dice: &str) -> Result<u32, ScriptError> {
        let (count, sides) = parse_dice(dice)?;
        Ok((0..count).map(|_| self.rng.gen_range(1..=sides)).sum())
    }

    /// Takes one random step through the movement authority.
    ///
    /// Returns false when the step was blocked by another object.
    pub fn wander(&mut self) -> Result<bool, ScriptError> {
        let dx = self.rng.gen_range(-1..=1);
        let dy = self.rng.gen_range(-1..=1);

        match self.movement.attempt_move(self.object_id, dx, dy, 0) {
            MoveOutcome::Moved(_) => Ok(true),
            MoveOutcome::Rejected(MoveRejection::Collision { .. }) => Ok(false),
            MoveOutcome::Rejected(MoveRejection::UnknownObject) => {
                Err(ScriptError::MissingObject(self.object_id))
            }
        }
    }

    /// Adds a state tag to this object.
    pub fn set_state(&mut self, state: &str) -> Result<(), ScriptError> {
        self.store
            .update(self.object_id, |object| {
                object.add_state(state);
                object.touch();
            })
            .ok_or(ScriptError::MissingObject(self.object_id))
    }
}

pub(crate) fn parse_dice(dice: &str) -> Result<(u32, u32), ScriptError> {
    let invalid = || ScriptError::InvalidDice(dice.to_string());

    let (count, sides) = dice.trim().split_once('d').ok_or_else(invalid)?;
    let count: u32 = count.parse().map_err(|_| invalid())?;
    let sides: u32 = sides.parse().map_err(|_| invalid())?;

    if count == 0 || count > MAX_DICE_AMOUNT || sides == 0 {
        return Err(invalid());
    }
    Ok((count, sides))
}

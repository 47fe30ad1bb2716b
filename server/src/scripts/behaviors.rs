//! Built-in behavior scripts

use super::{BehaviorScript, ScriptContext, ScriptError};
use rand::Rng;
use shared::{ScriptOutcome, Vec3, WorldObject};

fn rand_loc() -> f32 {
    rand::thread_rng().gen_range(-100..=100) as f32
}

fn rand_rot() -> f32 {
    rand::thread_rng().gen_range(-360..=360) as f32
}

fn rand_scale() -> f32 {
    rand::thread_rng().gen_range(0.75..=1.25)
}

/// Scatters a scripted object somewhere in the zone.
fn scattered(name: &str, resource: &str, script: &str) -> WorldObject {
    let mut object = WorldObject::new(name, resource)
        .at(Vec3::new(rand_loc(), rand_loc(), rand_loc()))
        .physical(true)
        .with_states(&["alive", "whole", "clickable"])
        .with_scripts(&[script]);
    object.rotation = Vec3::new(rand_rot(), rand_rot(), rand_rot());
    object.scale = Vec3::new(rand_scale(), rand_scale(), rand_scale());
    object
}

pub struct Chicken;

impl Chicken {
    pub const NAME: &'static str = "chicken";
    const IDLE_CHAT: [&'static str; 5] = ["BAWK", "BUCAW", "BUCK BUCK BUCK", "BROOOOCK", "CLUCK"];
    const COLLIDE_CHAT: [&'static str; 4] = ["bump.", "bamp!", "BUMP", "THUD!!"];
}

impl BehaviorScript for Chicken {
    fn tick(&self, ctx: &mut ScriptContext<'_>) -> Result<(), ScriptError> {
        if ctx.roll("1d100")? == 100 {
            ctx.rand_say(&Self::IDLE_CHAT)?;
        }

        if ctx.roll("1d100")? == 100 {
            ctx.say("I think I'll take a stroll!")?;
            if ctx.wander()? {
                ctx.say("That stroll was nice.")?;
            } else {
                ctx.rand_say(&Self::COLLIDE_CHAT)?;
            }
        }
        Ok(())
    }

    fn create(&self, index: usize) -> Option<WorldObject> {
        Some(scattered(
            &format!("Chicken #{}", index),
            "chicken",
            Self::NAME,
        ))
    }
}

pub struct ChatBot;

impl ChatBot {
    pub const NAME: &'static str = "chatbot";
    const IDLE_CHAT: [&'static str; 2] = ["Try clicking on me.", "Maybe Right Click>Activate?"];
    const ACTIVATION: [&'static str; 1] = ["Nice! You activated me."];
}

impl BehaviorScript for ChatBot {
    fn tick(&self, ctx: &mut ScriptContext<'_>) -> Result<(), ScriptError> {
        if ctx.roll("1d100")? >= 90 {
            ctx.rand_say(&Self::IDLE_CHAT)?;
        }
        ctx.wander()?;
        Ok(())
    }

    fn activate(
        &self,
        ctx: &mut ScriptContext<'_>,
        _actor: &str,
    ) -> Result<ScriptOutcome, ScriptError> {
        ctx.rand_say(&Self::ACTIVATION)?;
        Ok(ScriptOutcome::Activated)
    }

    fn create(&self, _index: usize) -> Option<WorldObject> {
        Some(
            WorldObject::new("Linnea", "girl")
                .at(Vec3::ZERO)
                .physical(true)
                .with_states(&["alive", "whole", "clickable"])
                .with_scripts(&[Self::NAME]),
        )
    }
}

/// Says her piece when activated and otherwise stands still.
pub struct Linnea;

impl Linnea {
    pub const NAME: &'static str = "linnea";
}

impl BehaviorScript for Linnea {
    fn tick(&self, _ctx: &mut ScriptContext<'_>) -> Result<(), ScriptError> {
        Ok(())
    }

    fn activate(
        &self,
        ctx: &mut ScriptContext<'_>,
        _actor: &str,
    ) -> Result<ScriptOutcome, ScriptError> {
        ctx.say(
            "There today in order to it activates it knows the letter, which it suffered. \
             Fact of jokes of period of training of wish of 1 hour.",
        )?;
        Ok(ScriptOutcome::Activated)
    }
}

pub struct Greeter {
    every: u64,
}

impl Greeter {
    pub const NAME: &'static str = "greeter";

    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
        }
    }
}

impl Default for Greeter {
    fn default() -> Self {
        Self::new(50)
    }
}

impl BehaviorScript for Greeter {
    fn tick(&self, ctx: &mut ScriptContext<'_>) -> Result<(), ScriptError> {
        if ctx.tick() % self.every == 0 {
            ctx.say("Welcome, traveller! Click me if you need anything.")?;
        }
        Ok(())
    }

    fn activate(
        &self,
        ctx: &mut ScriptContext<'_>,
        actor: &str,
    ) -> Result<ScriptOutcome, ScriptError> {
        ctx.say(&format!("Hello, {}!", actor))?;
        Ok(ScriptOutcome::Activated)
    }

    fn create(&self, _index: usize) -> Option<WorldObject> {
        Some(
            WorldObject::new("Greeter", "villager")
                .at(Vec3::new(5.0, 0.0, 5.0))
                .physical(true)
                .with_states(&["alive", "clickable"])
                .with_scripts(&[Self::NAME]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::MovementAuthority;
    use crate::store::WorldStore;
    use std::sync::Arc;

    #[test]
    fn test_chicken_create_is_scattered_and_scripted() {
        let chicken = Chicken.create(3).unwrap();
        assert_eq!(chicken.name, "Chicken #3");
        assert_eq!(chicken.scripts, vec![Chicken::NAME.to_string()]);
        assert!(chicken.physical);
        assert!(chicken.has_state("clickable"));

        let position = chicken.position.unwrap();
        assert!((-100.0..=100.0).contains(&position.x));
        assert!((0.75..=1.25).contains(&chicken.scale.y));
    }

    #[test]
    fn test_linnea_has_no_template() {
        assert!(Linnea.create(0).is_none());
    }

    #[test]
    fn test_greeter_speaks_on_schedule_and_on_activation() {
        let store = Arc::new(WorldStore::new());
        let movement = MovementAuthority::new(Arc::clone(&store));
        let greeter = Greeter::new(10);
        let id = store.insert(greeter.create(0).unwrap());

        for tick in 1..=30 {
            let mut ctx = ScriptContext::new(&store, &movement, id, tick);
            greeter.tick(&mut ctx).unwrap();
        }
        assert_eq!(store.messages().len(), 3);

        let mut ctx = ScriptContext::new(&store, &movement, id, 0);
        let outcome = greeter.activate(&mut ctx, "Groxnor").unwrap();
        assert_eq!(outcome, ScriptOutcome::Activated);
        assert_eq!(store.messages().last().unwrap().body, "Hello, Groxnor!");
    }

    #[test]
    fn test_chatbot_activation_speaks() {
        let store = Arc::new(WorldStore::new());
        let movement = MovementAuthority::new(Arc::clone(&store));
        let id = store.insert(ChatBot.create(0).unwrap());

        let mut ctx = ScriptContext::new(&store, &movement, id, 0);
        assert_eq!(
            ChatBot.activate(&mut ctx, "Groxnor").unwrap(),
            ScriptOutcome::Activated
        );
        assert_eq!(store.messages()[0].body, "Nice! You activated me.");
    }
}

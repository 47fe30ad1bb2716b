//! Who may ask for which character, and where characters live
//!
//! Account storage is not this service's business; it only needs answers to
//! two questions, asked through [`Authenticator`] and [`CharacterDirectory`].
//! The in-memory implementations back the binary and the tests.

use std::collections::HashMap;
use thiserror::Error;

/// Zone a character without an explicit assignment is placed in.
pub const DEFAULT_ZONE_NAME: &str = "GhibliHills";
pub const PLAYER_INSTANCE: &str = "playerinstance";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("invalid credentials")]
    Unauthenticated,
    #[error("{user} has no character named {character}")]
    NotYourCharacter { user: String, character: String },
}

/// Turns credentials into a user name.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credentials: &str) -> Option<String>;
}

/// Knows which user owns a character and which zone it is in.
pub trait CharacterDirectory: Send + Sync {
    fn characters_of(&self, user: &str) -> Vec<String>;
    fn zone_of(&self, character: &str) -> Option<String>;
}

/// Accepts `user:password` credentials from a fixed table.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthenticator {
    passwords: HashMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: &str, password: &str) -> Self {
        self.passwords.insert(user.to_string(), password.to_string());
        self
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, credentials: &str) -> Option<String> {
        let (user, password) = credentials.split_once(':')?;
        match self.passwords.get(user) {
            Some(expected) if expected == password => Some(user.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryDirectory {
    owners: HashMap<String, String>,
    zones: HashMap<String, String>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_character(mut self, user: &str, character: &str) -> Self {
        self.owners.insert(character.to_string(), user.to_string());
        self
    }

    pub fn with_zone(mut self, character: &str, zone_id: &str) -> Self {
        self.zones.insert(character.to_string(), zone_id.to_string());
        self
    }
}

impl CharacterDirectory for InMemoryDirectory {
    fn characters_of(&self, user: &str) -> Vec<String> {
        let mut characters: Vec<String> = self
            .owners
            .iter()
            .filter(|(_, owner)| owner.as_str() == user)
            .map(|(character, _)| character.clone())
            .collect();
        characters.sort();
        characters
    }

    /// Characters without an assignment live in their own instance of the
    /// starting zone.
    fn zone_of(&self, character: &str) -> Option<String> {
        if let Some(zone_id) = self.zones.get(character) {
            return Some(zone_id.clone());
        }
        self.owners
            .contains_key(character)
            .then(|| format!("{}-{}-{}", PLAYER_INSTANCE, DEFAULT_ZONE_NAME, character))
    }
}

/// Checks the caller owns `character` and returns the zone id it is in.
pub fn character_zone(
    auth: &dyn Authenticator,
    directory: &dyn CharacterDirectory,
    credentials: &str,
    character: &str,
) -> Result<String, DirectoryError> {
    let user = auth
        .authenticate(credentials)
        .ok_or(DirectoryError::Unauthenticated)?;

    let not_yours = || DirectoryError::NotYourCharacter {
        user: user.clone(),
        character: character.to_string(),
    };

    if !directory.characters_of(&user).iter().any(|c| c == character) {
        return Err(not_yours());
    }
    directory.zone_of(character).ok_or_else(not_yours)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> (StaticAuthenticator, InMemoryDirectory) {
        let auth = StaticAuthenticator::new()
            .with_user("alice", "hunter2")
            .with_user("bob", "swordfish");
        let directory = InMemoryDirectory::new()
            .with_character("alice", "Groxnor")
            .with_character("alice", "Linnea")
            .with_character("bob", "Bobbin")
            .with_zone("Linnea", "playerinstance-AdventureDungeon-Linnea");
        (auth, directory)
    }

    #[test]
    fn test_authenticate() {
        let (auth, _) = fixtures();
        assert_eq!(auth.authenticate("alice:hunter2"), Some("alice".to_string()));
        assert_eq!(auth.authenticate("alice:wrong"), None);
        assert_eq!(auth.authenticate("alice"), None);
        assert_eq!(auth.authenticate("carol:hunter2"), None);
    }

    #[test]
    fn test_character_zone_defaults_to_starting_zone() {
        let (auth, directory) = fixtures();
        assert_eq!(
            character_zone(&auth, &directory, "alice:hunter2", "Groxnor").unwrap(),
            "playerinstance-GhibliHills-Groxnor"
        );
        assert_eq!(
            character_zone(&auth, &directory, "alice:hunter2", "Linnea").unwrap(),
            "playerinstance-AdventureDungeon-Linnea"
        );
        assert_eq!(directory.characters_of("alice"), vec!["Groxnor", "Linnea"]);
    }

    #[test]
    fn test_character_zone_checks_ownership() {
        let (auth, directory) = fixtures();
        assert_eq!(
            character_zone(&auth, &directory, "bob:swordfish", "Groxnor").unwrap_err(),
            DirectoryError::NotYourCharacter {
                user: "bob".to_string(),
                character: "Groxnor".to_string()
            }
        );
        assert_eq!(
            character_zone(&auth, &directory, "bob:wrong", "Bobbin").unwrap_err(),
            DirectoryError::Unauthenticated
        );
    }
}

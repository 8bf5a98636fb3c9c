//! Directory/identity collaborator
//!
//! Resolves structure ids to display data and user ids to contact fields, and
//! lists the local administrators of a structure.

use crate::{BridgeError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A school/structure record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Structure {
    pub id: String,
    pub name: String,
    /// Administrative unit identifier of the school
    pub uai: String,
    pub academy: String,
}

/// A user's contact profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Directory lookup contract
#[async_trait]
pub trait Directory: Send + Sync {
    async fn structure(&self, structure_id: &str) -> Result<Structure>;
    async fn user(&self, user_id: &str) -> Result<UserProfile>;
    async fn local_admins(&self, structure_id: &str) -> Result<Vec<UserProfile>>;
}

/// Static in-memory directory
///
/// Suitable for tests and small deployments where the directory content is
/// loaded once at startup.
#[derive(Default)]
pub struct StaticDirectory {
    structures: HashMap<String, Structure>,
    users: HashMap<String, UserProfile>,
    admins: HashMap<String, Vec<String>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_structure(&mut self, structure: Structure) {
        self.structures.insert(structure.id.clone(), structure);
    }

    pub fn add_user(&mut self, user: UserProfile) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn add_admin(&mut self, structure_id: impl Into<String>, user_id: impl Into<String>) {
        self.admins
            .entry(structure_id.into())
            .or_default()
            .push(user_id.into());
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn structure(&self, structure_id: &str) -> Result<Structure> {
        self.structures
            .get(structure_id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(format!("structure {}", structure_id)))
    }

    async fn user(&self, user_id: &str) -> Result<UserProfile> {
        self.users
            .get(user_id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(format!("user {}", user_id)))
    }

    async fn local_admins(&self, structure_id: &str) -> Result<Vec<UserProfile>> {
        let ids = self.admins.get(structure_id).cloned().unwrap_or_default();
        let mut profiles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(profile) = self.users.get(&id) {
                profiles.push(profile.clone());
            }
        }
        Ok(profiles)
    }
}

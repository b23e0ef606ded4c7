//! The user directory: passdb-style lookups whose result fields
//! carry proxy routing hints.

use crate::store::LookupContext;
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, PartialEq)]
pub enum PassdbLookup {
    NotFound,
    Found(HashMap<String, String>),
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Look a user up in the passdb. `Err` is a temporary directory
    /// failure; `NotFound` falls through to the local delivery path.
    async fn passdb_lookup(
        &self,
        username: &str,
        ctx: &LookupContext,
    ) -> anyhow::Result<PassdbLookup>;
}

/// Directory backed by the static user table from the settings file.
pub struct StaticDirectory {
    users: HashMap<String, HashMap<String, String>>,
}

impl StaticDirectory {
    pub fn new(users: HashMap<String, HashMap<String, String>>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn passdb_lookup(
        &self,
        username: &str,
        _ctx: &LookupContext,
    ) -> anyhow::Result<PassdbLookup> {
        Ok(match self.users.get(username) {
            Some(fields) => PassdbLookup::Found(fields.clone()),
            None => PassdbLookup::NotFound,
        })
    }
}

// Identity — who this device is, as supplied by the host application

use crate::message::{SourceToken, BROADCAST};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Account or identity id used as the sender of messages
    pub id: String,
    /// Stable per-install device id
    pub device_id: String,
    pub display_name: String,
}

pub trait IdentityProvider: Send + Sync {
    fn identity(&self) -> Identity;
}

/// Fixed identity, used by tests, the simulator and hosts that resolve
/// identity once at startup.
#[derive(Debug, Clone)]
pub struct StaticIdentity(Identity);

impl StaticIdentity {
    pub fn new(
        id: impl Into<String>,
        device_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self(Identity {
            id: id.into(),
            device_id: device_id.into(),
            display_name: display_name.into(),
        })
    }
}

impl IdentityProvider for StaticIdentity {
    fn identity(&self) -> Identity {
        self.0.clone()
    }
}

/// Every name this device answers to when checking an envelope's `to` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfAliases {
    aliases: Vec<String>,
    token: SourceToken,
}

impl SelfAliases {
    pub fn new(identity: &Identity) -> Self {
        let token = SourceToken::from_identity(&identity.id);
        let mut aliases = vec![
            identity.id.clone(),
            identity.device_id.clone(),
            token.to_string(),
        ];
        aliases.retain(|a| !a.is_empty());
        aliases.dedup();
        Self { aliases, token }
    }

    pub fn token(&self) -> SourceToken {
        self.token
    }

    pub fn is_self(&self, name: &str) -> bool {
        self.aliases.iter().any(|a| a == name)
    }

    /// Whether a message addressed to `to` should be surfaced on this device.
    pub fn accepts(&self, to: &str) -> bool {
        to.is_empty() || to == BROADCAST || self.is_self(to)
    }
}

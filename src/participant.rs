//! Network participants and the registry used to resolve signer keys.

use crate::crypto::ContentHasher;
use crate::error::ChainError;
use std::collections::HashMap;

/// A known node of the network. Registered once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Participant {
    pub name: String,
    /// Compressed secp256k1 public key.
    pub public_key: Vec<u8>,
    pub address: String,
    pub port: u16,
    pub special_role: Option<String>,
}

impl Participant {
    pub fn new(name: impl Into<String>, public_key: Vec<u8>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            public_key,
            address: address.into(),
            port,
            special_role: None,
        }
    }

    pub fn with_special_role(mut self, role: impl Into<String>) -> Self {
        self.special_role = Some(role.into());
        self
    }

    /// Folds the identifying fields into a content hash.
    pub(crate) fn hash_identity(&self, hasher: &mut ContentHasher) {
        hasher
            .str(&self.name)
            .str(&self.address)
            .u32(self.port as u32)
            .bytes(&self.public_key);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParticipantRegistry {
    participants: HashMap<String, Participant>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, participant: Participant) -> Result<(), ChainError> {
        if self.participants.contains_key(&participant.name) {
            return Err(ChainError::ParticipantAlreadyExists(participant.name));
        }
        self.participants.insert(participant.name.clone(), participant);
        Ok(())
    }

    pub fn by_name(&self, name: &str) -> Option<&Participant> {
        self.participants.get(name)
    }

    pub fn all(&self) -> Vec<&Participant> {
        let mut all: Vec<_> = self.participants.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Every participant except the local node; the broadcast set.
    pub fn all_other(&self, self_name: &str) -> Vec<&Participant> {
        self.all().into_iter().filter(|p| p.name != self_name).collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

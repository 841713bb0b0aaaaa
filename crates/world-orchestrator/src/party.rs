//! Party membership with leader succession and disbanding.
//!
//! Parties are cluster-local state owned by the world. When a member goes
//! offline the party may need a new leader, and a party left with fewer than
//! two members or no one online is disbanded.

use dashmap::DashMap;
use std::fmt;
use tracing::info;

use crate::players::PlayerRegistry;
use crate::types::{AccountId, CharacterId};

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct PartyId(pub i64);

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartyMember {
    pub account_id: AccountId,
    pub character_id: CharacterId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Party {
    pub id: PartyId,
    pub leader: CharacterId,
    /// Members in join order.
    pub members: Vec<PartyMember>,
}

/// What the offline cleanup did to a party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartyChange {
    Unchanged,
    LeaderChanged { party: PartyId, leader: CharacterId },
    Disbanded { party: PartyId },
}

#[derive(Default)]
pub struct PartyRegistry {
    parties: DashMap<PartyId, Party>,
    by_character: DashMap<CharacterId, PartyId>,
}

impl PartyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a party led by its first member. Returns `None` for an empty
    /// member list.
    pub fn create(&self, id: PartyId, members: Vec<PartyMember>) -> Option<Party> {
        let leader = members.first()?.character_id;
        for member in &members {
            self.by_character.insert(member.character_id, id);
        }
        let party = Party {
            id,
            leader,
            members,
        };
        self.parties.insert(id, party.clone());
        Some(party)
    }

    pub fn get(&self, id: PartyId) -> Option<Party> {
        self.parties.get(&id).map(|p| p.value().clone())
    }

    pub fn party_of(&self, character_id: CharacterId) -> Option<Party> {
        let id = *self.by_character.get(&character_id)?;
        self.get(id)
    }

    pub fn len(&self) -> usize {
        self.parties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parties.is_empty()
    }

    /// Remove a member. The party's leader moves to the next member in join
    /// order if the leader left.
    pub fn leave(&self, character_id: CharacterId) -> Option<Party> {
        let (_, id) = self.by_character.remove(&character_id)?;
        let mut party = self.parties.get_mut(&id)?;
        party.members.retain(|m| m.character_id != character_id);
        if party.leader == character_id {
            if let Some(next) = party.members.first().map(|m| m.character_id) {
                party.leader = next;
            }
        }
        Some(party.clone())
    }

    /// Cleanup after `character_id` went offline: hand leadership to the
    /// first online member if it was the leader, then disband the party if
    /// it no longer has two members or anyone online.
    pub fn on_member_offline(
        &self,
        character_id: CharacterId,
        players: &PlayerRegistry,
    ) -> PartyChange {
        let Some(id) = self.by_character.get(&character_id).map(|id| *id) else {
            return PartyChange::Unchanged;
        };

        let (change, disband) = {
            let Some(mut party) = self.parties.get_mut(&id) else {
                return PartyChange::Unchanged;
            };
            let mut change = PartyChange::Unchanged;
            if party.leader == character_id {
                let successor = party
                    .members
                    .iter()
                    .find(|m| m.character_id != character_id && players.is_online(m.account_id))
                    .map(|m| m.character_id);
                if let Some(leader) = successor {
                    party.leader = leader;
                    info!(party = %id, leader = %leader, "party leader handed over");
                    change = PartyChange::LeaderChanged { party: id, leader };
                }
            }
            let anyone_online = party
                .members
                .iter()
                .any(|m| players.is_online(m.account_id));
            (change, party.members.len() < 2 || !anyone_online)
        };

        if disband {
            self.disband(id);
            return PartyChange::Disbanded { party: id };
        }
        change
    }

    pub fn disband(&self, id: PartyId) -> Option<Party> {
        let (_, party) = self.parties.remove(&id)?;
        for member in &party.members {
            self.by_character.remove_if(&member.character_id, |_, party_id| *party_id == id);
        }
        info!(party = %id, "party disbanded");
        Some(party)
    }
}

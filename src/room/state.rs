use std::collections::{BTreeMap, HashMap};

use super::Participant;
use crate::media::MediaKind;
use crate::negotiation::Role;

/// Membership changes produced by a roster snapshot.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RosterDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Local, eventually consistent copy of the room membership. Rebuilt from
/// every snapshot the relay sends. Roles survive rebuilds: the first role
/// assigned for a pair is the one that sticks.
#[derive(Debug, Default)]
pub struct Roster {
    participants: BTreeMap<String, Participant>,
    roles: HashMap<String, Role>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the membership with `users`, leaving out the local participant.
    pub fn replace(&mut self, users: Vec<Participant>, local_id: &str) -> RosterDiff {
        let next: BTreeMap<String, Participant> = users
            .into_iter()
            .filter(|p| p.participant_id != local_id)
            .map(|p| (p.participant_id.clone(), p))
            .collect();

        let added = next
            .keys()
            .filter(|id| !self.participants.contains_key(*id))
            .cloned()
            .collect();
        let removed: Vec<String> = self
            .participants
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .collect();

        for id in &removed {
            self.roles.remove(id);
        }
        self.participants = next;
        RosterDiff { added, removed }
    }

    pub fn upsert(&mut self, participant: Participant) {
        self.participants
            .insert(participant.participant_id.clone(), participant);
    }

    pub fn remove(&mut self, participant_id: &str) -> Option<Participant> {
        self.roles.remove(participant_id);
        self.participants.remove(participant_id)
    }

    pub fn get(&self, participant_id: &str) -> Option<&Participant> {
        self.participants.get(participant_id)
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.participants.contains_key(participant_id)
    }

    pub fn display_name(&self, participant_id: &str) -> Option<&str> {
        self.participants
            .get(participant_id)
            .map(|p| p.display_name.as_str())
    }

    /// Record our role towards `participant_id` unless one is already set.
    /// Returns the role in force.
    pub fn assign_role(&mut self, participant_id: &str, role: Role) -> Role {
        *self
            .roles
            .entry(participant_id.to_string())
            .or_insert(role)
    }

    pub fn role(&self, participant_id: &str) -> Option<Role> {
        self.roles.get(participant_id).copied()
    }

    pub fn set_media(&mut self, participant_id: &str, kind: MediaKind, enabled: bool) -> bool {
        match self.participants.get_mut(participant_id) {
            Some(p) => {
                match kind {
                    MediaKind::Audio => p.audio_enabled = enabled,
                    MediaKind::Video => p.video_enabled = enabled,
                }
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
        self.roles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users(ids: &[&str]) -> Vec<Participant> {
        ids.iter().map(|id| Participant::new(*id, format!("name-{id}"))).collect()
    }

    #[test]
    fn snapshot_excludes_local_participant() {
        let mut roster = Roster::new();
        let diff = roster.replace(users(&["me", "a", "b"]), "me");
        assert_eq!(diff.added, vec!["a".to_string(), "b".to_string()]);
        assert!(diff.removed.is_empty());
        assert_eq!(roster.len(), 2);
        assert!(!roster.contains("me"));
    }

    #[test]
    fn snapshot_reports_departures_and_drops_their_roles() {
        let mut roster = Roster::new();
        roster.replace(users(&["a", "b"]), "me");
        roster.assign_role("b", Role::Initiator);

        let diff = roster.replace(users(&["a", "c"]), "me");
        assert_eq!(diff.added, vec!["c".to_string()]);
        assert_eq!(diff.removed, vec!["b".to_string()]);
        assert_eq!(roster.role("b"), None);
    }

    #[test]
    fn first_role_assignment_wins() {
        let mut roster = Roster::new();
        assert_eq!(roster.assign_role("a", Role::Responder), Role::Responder);
        assert_eq!(roster.assign_role("a", Role::Initiator), Role::Responder);
    }

    #[test]
    fn media_flags_track_remote_toggles() {
        let mut roster = Roster::new();
        roster.replace(users(&["a"]), "me");
        assert!(roster.set_media("a", MediaKind::Video, false));
        assert!(!roster.get("a").unwrap().video_enabled);
        assert!(!roster.set_media("ghost", MediaKind::Audio, false));
    }
}

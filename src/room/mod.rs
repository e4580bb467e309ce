//! Room identity and the locally cached roster.

mod state;

pub use state::{Roster, RosterDiff};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

const ROOM_ID_LEN: usize = 13;

/// A room member as reported by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub participant_id: String,
    pub display_name: String,
    #[serde(default)]
    pub is_initiator: bool,
    #[serde(default = "default_true")]
    pub video_enabled: bool,
    #[serde(default = "default_true")]
    pub audio_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Participant {
    pub fn new(participant_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            display_name: display_name.into(),
            is_initiator: false,
            video_enabled: true,
            audio_enabled: true,
        }
    }
}

pub fn generate_room_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ROOM_ID_LEN)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

pub fn generate_participant_id() -> String {
    format!("user-{}", rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_ids_are_short_lowercase_tokens() {
        let id = generate_room_id();
        assert_eq!(id.len(), ROOM_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn participant_flags_default_on() {
        let p: Participant = serde_json::from_value(serde_json::json!({
            "participantId": "user-1",
            "displayName": "Ada"
        }))
        .unwrap();
        assert!(p.video_enabled);
        assert!(p.audio_enabled);
        assert!(!p.is_initiator);
    }
}

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    #[default]
    Participant,
}

/// One participant as published by the directory service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub peer_id: PeerId,
    pub display_name: String,
    pub role: Role,
}

/// Descriptor as it arrives from the directory; every field may be missing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParticipantRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "username")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

const ANONYMOUS: &str = "Anonymous";

/// Full roster snapshot. Each update replaces the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    participants: Vec<Participant>,
}

impl Roster {
    pub fn new(participants: Vec<Participant>) -> Self {
        let mut roster = Self::default();
        for p in participants {
            roster.push(p);
        }
        roster
    }

    /// Build a roster from raw directory records.
    ///
    /// Records without an id are dropped, missing names become "Anonymous"
    /// and unknown or missing roles become [`Role::Participant`].
    pub fn from_records(records: impl IntoIterator<Item = ParticipantRecord>) -> Self {
        let mut roster = Self::default();
        for record in records {
            let Some(id) = record.id.filter(|id| !id.trim().is_empty()) else {
                tracing::debug!("roster: dropping participant record without id");
                continue;
            };
            let display_name = record
                .display_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| ANONYMOUS.to_string());
            let role = match record.role.as_deref() {
                Some("host") => Role::Host,
                _ => Role::Participant,
            };
            roster.push(Participant {
                peer_id: PeerId::new(id),
                display_name,
                role,
            });
        }
        roster
    }

    /// Parse a JSON array of participant records.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let records: Vec<ParticipantRecord> = serde_json::from_str(json)?;
        Ok(Self::from_records(records))
    }

    /// Convenience constructor for plain ids.
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_records(ids.into_iter().map(|id| ParticipantRecord {
            id: Some(id.into()),
            ..Default::default()
        }))
    }

    fn push(&mut self, participant: Participant) {
        if !self.participants.iter().any(|p| p.peer_id == participant.peer_id) {
            self.participants.push(participant);
        }
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant(&self, peer_id: &PeerId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.peer_id == peer_id)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.participant(peer_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Peers the local endpoint should be connected to.
    pub fn desired_peers(&self, self_id: &PeerId) -> BTreeSet<PeerId> {
        self.participants
            .iter()
            .filter(|p| &p.peer_id != self_id)
            .map(|p| p.peer_id.clone())
            .collect()
    }

    pub fn is_host(&self, peer_id: &PeerId) -> bool {
        self.participant(peer_id).is_some_and(|p| p.role == Role::Host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: Option<&str>, name: Option<&str>, role: Option<&str>) -> ParticipantRecord {
        ParticipantRecord {
            id: id.map(str::to_string),
            display_name: name.map(str::to_string),
            role: role.map(str::to_string),
        }
    }

    #[test]
    fn normalises_missing_fields() {
        let roster = Roster::from_records(vec![
            record(Some("a"), None, None),
            record(None, Some("ghost"), Some("host")),
            record(Some(""), Some("blank"), None),
            record(Some("b"), Some("Bob"), Some("host")),
        ]);
        assert_eq!(roster.len(), 2);
        let a = roster.participant(&PeerId::new("a")).unwrap();
        assert_eq!(a.display_name, "Anonymous");
        assert_eq!(a.role, Role::Participant);
        assert!(roster.is_host(&PeerId::new("b")));
    }

    #[test]
    fn no_duplicate_participants() {
        let roster = Roster::from_ids(["a", "b", "a"]);
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn desired_peers_excludes_self() {
        let roster = Roster::from_ids(["a", "b", "c"]);
        let desired = roster.desired_peers(&PeerId::new("a"));
        let ids: Vec<_> = desired.iter().map(|p| p.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn parses_directory_json() {
        let roster = Roster::from_json(
            r#"[{"id":"u1","username":"Alice","role":"host"},{"id":"u2"}]"#,
        )
        .unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.participants()[0].display_name, "Alice");
        assert_eq!(roster.participants()[1].display_name, "Anonymous");
    }
}

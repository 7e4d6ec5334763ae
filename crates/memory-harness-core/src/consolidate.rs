//! Conversation grouping for sleep-phase consolidation.
//!
//! Episodic turns are grouped by session id, and a session is split into
//! separate conversations wherever two consecutive turns are further apart
//! than the idle gap. Each [`ConversationGroup`] renders to one transcript
//! that the indexer chunks and embeds as `kind = conversation`.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::json;

use crate::models::EpisodicTurn;

/// Consecutive turns of one session with no idle gap between them.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationGroup {
    pub session_id: String,
    pub turns: Vec<EpisodicTurn>,
}

impl ConversationGroup {
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.turns.first().map(|t| t.timestamp)
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.turns.last().map(|t| t.timestamp)
    }

    /// Synthetic source path: `conversation/<first turn timestamp>`.
    pub fn source_path(&self) -> String {
        let start = self
            .started_at()
            .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default();
        format!("conversation/{}", start)
    }

    pub fn referenced_paths(&self) -> BTreeSet<String> {
        self.turns
            .iter()
            .flat_map(|t| t.referenced_paths.iter().cloned())
            .collect()
    }

    /// Transcript text: a header, the files touched, then `role: content`
    /// lines in order.
    pub fn render(&self) -> String {
        let fmt = |ts: Option<DateTime<Utc>>| {
            ts.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default()
        };
        let mut out = format!(
            "Conversation from {} to {}\n",
            fmt(self.started_at()),
            fmt(self.ended_at())
        );
        let paths = self.referenced_paths();
        if !paths.is_empty() {
            out.push_str("Files: ");
            out.push_str(&paths.into_iter().collect::<Vec<_>>().join(", "));
            out.push('\n');
        }
        for turn in &self.turns {
            out.push_str(turn.role.as_str());
            out.push_str(": ");
            out.push_str(turn.content.trim());
            out.push('\n');
        }
        out
    }

    /// Metadata stored alongside each chunk of the transcript.
    pub fn metadata(&self) -> serde_json::Value {
        json!({
            "session_id": self.session_id,
            "turns": self.turns.len(),
            "started_at": self.started_at(),
            "ended_at": self.ended_at(),
            "referenced_paths": self.referenced_paths(),
        })
    }
}

/// Group turns (already in timestamp order) into conversations.
///
/// Groups come out ordered by their first turn. Turns without a session id
/// share the empty session and are split purely on gaps.
pub fn group_turns(turns: &[EpisodicTurn], idle_gap: Duration) -> Vec<ConversationGroup> {
    let mut groups: Vec<ConversationGroup> = Vec::new();
    let mut open: HashMap<&str, usize> = HashMap::new();

    for turn in turns {
        let continues = open.get(turn.session_id.as_str()).and_then(|&i| {
            let last = groups[i].turns.last()?;
            (turn.timestamp - last.timestamp <= idle_gap).then_some(i)
        });
        match continues {
            Some(i) => groups[i].turns.push(turn.clone()),
            None => {
                open.insert(turn.session_id.as_str(), groups.len());
                groups.push(ConversationGroup {
                    session_id: turn.session_id.clone(),
                    turns: vec![turn.clone()],
                });
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use chrono::TimeZone;

    fn turn(session: &str, minute: i64, role: Role, text: &str) -> EpisodicTurn {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        EpisodicTurn::new(session, role, text).at(base + Duration::minutes(minute))
    }

    #[test]
    fn one_session_one_group() {
        let turns = vec![
            turn("s1", 0, Role::User, "how does login work?"),
            turn("s1", 1, Role::Agent, "it checks the password"),
            turn("s1", 2, Role::User, "thanks"),
        ];
        let groups = group_turns(&turns, Duration::minutes(30));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].turns.len(), 3);
        assert_eq!(groups[0].source_path(), "conversation/2024-05-01T10:00:00.000Z");
    }

    #[test]
    fn idle_gap_splits_session() {
        let turns = vec![
            turn("s1", 0, Role::User, "a"),
            turn("s1", 45, Role::User, "b"),
            turn("s1", 50, Role::Agent, "c"),
        ];
        let groups = group_turns(&turns, Duration::minutes(30));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].turns.len(), 2);
    }

    #[test]
    fn sessions_interleave_into_separate_groups() {
        let turns = vec![
            turn("s1", 0, Role::User, "a"),
            turn("s2", 1, Role::User, "b"),
            turn("s1", 2, Role::Agent, "c"),
        ];
        let groups = group_turns(&turns, Duration::minutes(30));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].session_id, "s1");
        assert_eq!(groups[0].turns.len(), 2);
        assert_eq!(groups[1].session_id, "s2");
    }

    #[test]
    fn render_includes_roles_and_files() {
        let turns = vec![
            turn("s1", 0, Role::User, "look at auth.py").with_paths(["auth.py"]),
            turn("s1", 1, Role::Agent, "login() hashes the password"),
        ];
        let groups = group_turns(&turns, Duration::minutes(30));
        let text = groups[0].render();
        assert!(text.starts_with("Conversation from 2024-05-01T10:00:00Z to 2024-05-01T10:01:00Z\n"));
        assert!(text.contains("Files: auth.py\n"));
        assert!(text.contains("user: look at auth.py\n"));
        assert!(text.contains("agent: login() hashes the password\n"));
        assert_eq!(groups[0].metadata()["turns"], 2);
    }

    #[test]
    fn empty_input_no_groups() {
        assert!(group_turns(&[], Duration::minutes(30)).is_empty());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a team's collaboration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamState {
    Idle,
    Working,
    Negotiating,
    Handoff,
    Completed,
    Escalated,
}

/// Mode of a cross-team interaction. Each mode requires its own explicit
/// permission record on the acting team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Read-only queries to another team.
    Crosstalk,
    /// Transferring work and artifacts to another team.
    Handoff,
}

/// An explicit permission record allowing one interaction mode with one
/// peer team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamLink {
    pub peer: Uuid,
    pub mode: LinkMode,
}

/// A group of agents collaborating under a leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub member_ids: Vec<Uuid>,
    pub leader_id: Uuid,
    pub state: TeamState,
    /// Cross-team permission records.
    #[serde(default)]
    pub links: Vec<TeamLink>,
    /// Tasks the team may work concurrently.
    pub max_concurrent_tasks: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl Team {
    pub fn new(name: impl Into<String>, leader_id: Uuid, member_ids: Vec<Uuid>) -> Self {
        let mut members = member_ids;
        if !members.contains(&leader_id) {
            members.push(leader_id);
        }
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            member_ids: members,
            leader_id,
            state: TeamState::Idle,
            links: Vec::new(),
            max_concurrent_tasks: 5,
            created_at: Utc::now(),
            version: 0,
        }
    }

    pub fn with_link(mut self, peer: Uuid, mode: LinkMode) -> Self {
        self.links.push(TeamLink { peer, mode });
        self
    }

    pub fn is_member(&self, agent_id: Uuid) -> bool {
        self.member_ids.contains(&agent_id)
    }

    /// Whether this team holds a permission record for `mode` with `peer`.
    pub fn allows(&self, peer: Uuid, mode: LinkMode) -> bool {
        self.links.iter().any(|l| l.peer == peer && l.mode == mode)
    }
}

/// Message type in the negotiation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationKind {
    Proposal,
    Counter,
    Vote,
    Decision,
}

/// A member's vote on a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteChoice {
    Agree,
    Disagree,
    Abstain,
}

/// One entry in a team's append-only negotiation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationMessage {
    pub id: Uuid,
    pub team_id: Uuid,
    pub proposer: Uuid,
    pub kind: NegotiationKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl NegotiationMessage {
    pub fn new(
        team_id: Uuid,
        proposer: Uuid,
        kind: NegotiationKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            team_id,
            proposer,
            kind,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Status of a pending work transfer between teams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffStatus {
    /// Proposed by the sending team, not yet acknowledged.
    Pending,
    /// Acknowledged by the receiving team; ownership transferred.
    Acknowledged,
}

/// The payload carried with a handoff: completed work references,
/// artifacts, and free-form notes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HandoffPayload {
    /// Open tasks whose ownership transfers to the receiving team.
    pub task_ids: Vec<Uuid>,
    /// References to completed tasks carried for context.
    #[serde(default)]
    pub completed_refs: Vec<Uuid>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A work transfer between two teams. Complete only once the receiving
/// team acknowledges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub id: Uuid,
    pub from_team: Uuid,
    pub to_team: Uuid,
    pub payload: HandoffPayload,
    pub status: HandoffStatus,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Handoff {
    pub fn new(from_team: Uuid, to_team: Uuid, payload: HandoffPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            from_team,
            to_team,
            payload,
            status: HandoffStatus::Pending,
            created_at: Utc::now(),
            acknowledged_at: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_leader_always_a_member() {
        let leader = Uuid::new_v4();
        let team = Team::new("search", leader, vec![Uuid::new_v4()]);
        assert!(team.is_member(leader));
        assert_eq!(team.member_ids.len(), 2);
    }

    #[test]
    fn test_link_permissions_are_per_mode() {
        let peer = Uuid::new_v4();
        let team = Team::new("search", Uuid::new_v4(), vec![]).with_link(peer, LinkMode::Crosstalk);
        assert!(team.allows(peer, LinkMode::Crosstalk));
        assert!(!team.allows(peer, LinkMode::Handoff));
        assert!(!team.allows(Uuid::new_v4(), LinkMode::Crosstalk));
    }

    #[test]
    fn test_negotiation_message() {
        let team = Uuid::new_v4();
        let proposer = Uuid::new_v4();
        let msg = NegotiationMessage::new(
            team,
            proposer,
            NegotiationKind::Proposal,
            serde_json::json!({"text": "split the backlog by component"}),
        );
        assert_eq!(msg.kind, NegotiationKind::Proposal);
        assert_eq!(msg.team_id, team);
    }

    #[test]
    fn test_handoff_starts_pending() {
        let handoff = Handoff::new(Uuid::new_v4(), Uuid::new_v4(), HandoffPayload::default());
        assert_eq!(handoff.status, HandoffStatus::Pending);
        assert!(handoff.acknowledged_at.is_none());
    }
}

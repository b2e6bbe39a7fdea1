use crate::delegation::DelegationEngine;
use crate::escalation::EscalationManager;
use crate::rate_limit::PairRateLimiter;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use taskfleet_core::{
    AuditEvent, AuditSink, EscalationKind, FleetConfig, FleetError, FleetResult, Handoff,
    HandoffPayload, HandoffStatus, LinkMode, NegotiationKind, NegotiationMessage, Notification,
    Notifier, Repository, Severity, TaskStatus, Team, TeamState, VoteChoice,
};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Adoption threshold: at or above this agree share, the proposal is
/// adopted without leader involvement.
const ADOPT_AT: f64 = 0.8;
/// Between this and [`ADOPT_AT`], the leader must explicitly confirm.
const CONFIRM_AT: f64 = 0.6;
/// Between this and [`CONFIRM_AT`], the leader decides unilaterally.
/// Below it, the proposal is rejected outright.
const LEADER_DECIDES_AT: f64 = 0.4;

/// Where a negotiation stands after a vote or a leader action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum NegotiationOutcome {
    /// Votes still outstanding.
    Pending { votes_cast: usize, votes_expected: usize },
    /// Adopted on votes alone.
    Adopted,
    /// Majority agreed but the leader must confirm.
    AwaitingLeaderConfirmation,
    /// Split vote; the leader decides unilaterally.
    AwaitingLeaderDecision,
    /// Rejected on votes alone. Re-proposal is allowed.
    Rejected,
}

/// Drives the team state machine: negotiation by proposal and vote,
/// cross-team queries, and acknowledged work transfers.
///
/// The negotiation state is nothing but the team's append-only message
/// log; every tally is recomputed from it, so there is no separate round
/// state to drift out of sync.
pub struct TeamCoordinator {
    repo: Arc<dyn Repository>,
    config: Arc<FleetConfig>,
    delegation: Arc<DelegationEngine>,
    escalations: Arc<EscalationManager>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    rate: PairRateLimiter,
    pending_handoffs: RwLock<HashMap<Uuid, Handoff>>,
}

impl TeamCoordinator {
    pub fn new(
        repo: Arc<dyn Repository>,
        config: Arc<FleetConfig>,
        delegation: Arc<DelegationEngine>,
        escalations: Arc<EscalationManager>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let rate = PairRateLimiter::new(config.rate_limit_per_hour);
        Self {
            repo,
            config,
            delegation,
            escalations,
            notifier,
            audit,
            rate,
            pending_handoffs: RwLock::new(HashMap::new()),
        }
    }

    // --- negotiation ---

    /// Post a proposal and move the team to `negotiating`.
    pub async fn propose(
        &self,
        team_id: Uuid,
        proposer: Uuid,
        payload: serde_json::Value,
    ) -> FleetResult<NegotiationMessage> {
        let team = self.repo.team(team_id).await?;
        if !team.is_member(proposer) {
            return Err(FleetError::Negotiation(format!(
                "agent {proposer} is not a member of team {team_id}"
            )));
        }
        if matches!(team.state, TeamState::Escalated | TeamState::Handoff) {
            return Err(FleetError::Negotiation(format!(
                "team {team_id} cannot negotiate in its current state"
            )));
        }
        if self.open_proposal(team_id).await?.is_some() {
            return Err(FleetError::Negotiation(format!(
                "team {team_id} already has an open proposal"
            )));
        }

        let message = self
            .repo
            .append_negotiation(NegotiationMessage::new(
                team_id,
                proposer,
                NegotiationKind::Proposal,
                payload,
            ))
            .await?;

        self.set_team_state(team_id, TeamState::Negotiating).await?;
        info!(team_id = %team_id, proposal_id = %message.id, "proposal posted");
        self.record_audit(
            "proposal_posted",
            team_id,
            serde_json::json!({"proposal_id": message.id, "proposer": proposer}),
        )
        .await;
        Ok(message)
    }

    /// Post a counter-proposal against the open proposal. Counters are
    /// recorded for context; they do not reset the vote or the deadline.
    pub async fn counter(
        &self,
        team_id: Uuid,
        proposal_id: Uuid,
        member: Uuid,
        payload: serde_json::Value,
    ) -> FleetResult<NegotiationMessage> {
        let team = self.repo.team(team_id).await?;
        if !team.is_member(member) {
            return Err(FleetError::Negotiation(format!(
                "agent {member} is not a member of team {team_id}"
            )));
        }
        let log = self.repo.negotiation_log(team_id).await?;
        Self::find_open_proposal(&log, proposal_id)?;

        let message = self
            .repo
            .append_negotiation(NegotiationMessage::new(
                team_id,
                member,
                NegotiationKind::Counter,
                serde_json::json!({"proposal_id": proposal_id, "counter": payload}),
            ))
            .await?;
        self.record_audit(
            "counter_posted",
            team_id,
            serde_json::json!({"proposal_id": proposal_id, "by": member}),
        )
        .await;
        Ok(message)
    }

    /// Record a member's vote, then tally if everyone has voted.
    pub async fn vote(
        &self,
        team_id: Uuid,
        proposal_id: Uuid,
        voter: Uuid,
        choice: VoteChoice,
    ) -> FleetResult<NegotiationOutcome> {
        let team = self.repo.team(team_id).await?;
        let log = self.repo.negotiation_log(team_id).await?;
        let proposal = Self::find_open_proposal(&log, proposal_id)?;

        if !team.is_member(voter) {
            return Err(FleetError::Negotiation(format!(
                "agent {voter} is not a member of team {team_id}"
            )));
        }
        if voter == proposal.proposer {
            return Err(FleetError::Negotiation(
                "the proposer does not vote on their own proposal".to_string(),
            ));
        }
        if Self::votes_for(&log, proposal_id)
            .iter()
            .any(|(v, _)| *v == voter)
        {
            return Err(FleetError::Negotiation(format!(
                "agent {voter} already voted on proposal {proposal_id}"
            )));
        }
        if self.deadline_passed(proposal) {
            self.expire_proposal(&team, proposal).await?;
            return Err(FleetError::NegotiationTimeout(format!(
                "voting deadline passed for proposal {proposal_id}"
            )));
        }

        self.repo
            .append_negotiation(NegotiationMessage::new(
                team_id,
                voter,
                NegotiationKind::Vote,
                serde_json::json!({"proposal_id": proposal_id, "choice": choice}),
            ))
            .await?;

        let outcome = self.tally(team_id, proposal_id).await?;
        match &outcome {
            NegotiationOutcome::Adopted => {
                self.decide(team_id, proposal_id, proposal.proposer, "adopted")
                    .await?;
                self.set_team_state(team_id, TeamState::Completed).await?;
            }
            NegotiationOutcome::Rejected => {
                self.decide(team_id, proposal_id, proposal.proposer, "rejected")
                    .await?;
                // Re-proposal is allowed; the team goes back to work.
                self.set_team_state(team_id, TeamState::Working).await?;
            }
            NegotiationOutcome::Pending { .. }
            | NegotiationOutcome::AwaitingLeaderConfirmation
            | NegotiationOutcome::AwaitingLeaderDecision => {}
        }
        Ok(outcome)
    }

    /// The leader confirms (60–80% agree) or decides (40–60% agree).
    pub async fn confirm(
        &self,
        team_id: Uuid,
        proposal_id: Uuid,
        leader: Uuid,
        approve: bool,
    ) -> FleetResult<NegotiationOutcome> {
        let team = self.repo.team(team_id).await?;
        if team.leader_id != leader {
            return Err(FleetError::Negotiation(format!(
                "agent {leader} is not the leader of team {team_id}"
            )));
        }
        let outcome = self.tally(team_id, proposal_id).await?;
        if !matches!(
            outcome,
            NegotiationOutcome::AwaitingLeaderConfirmation
                | NegotiationOutcome::AwaitingLeaderDecision
        ) {
            return Err(FleetError::Negotiation(format!(
                "proposal {proposal_id} is not waiting on the leader"
            )));
        }

        let result = if approve { "adopted" } else { "rejected" };
        self.decide(team_id, proposal_id, leader, result).await?;
        if approve {
            self.set_team_state(team_id, TeamState::Completed).await?;
            Ok(NegotiationOutcome::Adopted)
        } else {
            self.set_team_state(team_id, TeamState::Working).await?;
            Ok(NegotiationOutcome::Rejected)
        }
    }

    /// Expire proposals whose deadline passed without full participation.
    /// Called from the health cycle. Each expiry marks the team escalated
    /// and raises a `negotiation_timeout` escalation.
    pub async fn expire_stale_negotiations(&self) -> FleetResult<usize> {
        let mut expired = 0;
        for team in self.repo.teams().await? {
            if team.state != TeamState::Negotiating {
                continue;
            }
            let Some(proposal) = self.open_proposal(team.id).await? else {
                continue;
            };
            let log = self.repo.negotiation_log(team.id).await?;
            let votes = Self::votes_for(&log, proposal.id).len();
            let expected = team.member_ids.len().saturating_sub(1);
            if self.deadline_passed(&proposal) && votes < expected {
                self.expire_proposal(&team, &proposal).await?;
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Current tally for a proposal, recomputed from the log.
    pub async fn tally(&self, team_id: Uuid, proposal_id: Uuid) -> FleetResult<NegotiationOutcome> {
        let team = self.repo.team(team_id).await?;
        let log = self.repo.negotiation_log(team_id).await?;
        let proposal = Self::find_open_proposal(&log, proposal_id)?;

        let votes = Self::votes_for(&log, proposal_id);
        let expected = team
            .member_ids
            .iter()
            .filter(|m| **m != proposal.proposer)
            .count();
        if votes.len() < expected {
            return Ok(NegotiationOutcome::Pending {
                votes_cast: votes.len(),
                votes_expected: expected,
            });
        }

        let agree = votes
            .iter()
            .filter(|(_, c)| *c == VoteChoice::Agree)
            .count();
        let ratio = if votes.is_empty() {
            0.0
        } else {
            agree as f64 / votes.len() as f64
        };

        Ok(if ratio >= ADOPT_AT {
            NegotiationOutcome::Adopted
        } else if ratio >= CONFIRM_AT {
            NegotiationOutcome::AwaitingLeaderConfirmation
        } else if ratio >= LEADER_DECIDES_AT {
            NegotiationOutcome::AwaitingLeaderDecision
        } else {
            NegotiationOutcome::Rejected
        })
    }

    // --- cross-team interactions ---

    /// A read-only query to a peer team. Requires an explicit crosstalk
    /// permission record and a token from the pair's rate budget.
    pub async fn request_crosstalk(&self, from_team: Uuid, to_team: Uuid) -> FleetResult<()> {
        let from = self.repo.team(from_team).await?;
        self.repo.team(to_team).await?;
        if !from.allows(to_team, LinkMode::Crosstalk) {
            return Err(FleetError::PermissionDenied(format!(
                "team {from_team} has no crosstalk permission for team {to_team}"
            )));
        }
        if !self.rate.check(from_team, to_team, LinkMode::Crosstalk).await {
            return Err(FleetError::RateLimited(format!(
                "crosstalk budget exhausted for pair {from_team} -> {to_team}"
            )));
        }
        self.record_audit(
            "crosstalk",
            from_team,
            serde_json::json!({"to_team": to_team}),
        )
        .await;
        Ok(())
    }

    /// Propose transferring work to a peer team. The transfer is complete
    /// only once the receiving team acknowledges.
    pub async fn request_handoff(
        &self,
        from_team: Uuid,
        to_team: Uuid,
        payload: HandoffPayload,
    ) -> FleetResult<Handoff> {
        let from = self.repo.team(from_team).await?;
        self.repo.team(to_team).await?;
        if !from.allows(to_team, LinkMode::Handoff) {
            return Err(FleetError::PermissionDenied(format!(
                "team {from_team} has no handoff permission for team {to_team}"
            )));
        }
        if !self.rate.check(from_team, to_team, LinkMode::Handoff).await {
            return Err(FleetError::RateLimited(format!(
                "handoff budget exhausted for pair {from_team} -> {to_team}"
            )));
        }
        for task_id in &payload.task_ids {
            let task = self.repo.task(*task_id).await?;
            if task.status.is_terminal() {
                return Err(FleetError::Store(format!(
                    "task {task_id} is terminal and cannot be handed off"
                )));
            }
        }

        let handoff = Handoff::new(from_team, to_team, payload);
        self.pending_handoffs
            .write()
            .await
            .insert(handoff.id, handoff.clone());
        self.set_team_state(from_team, TeamState::Handoff).await?;

        info!(handoff_id = %handoff.id, from = %from_team, to = %to_team, "handoff proposed");
        self.record_audit(
            "handoff_proposed",
            from_team,
            serde_json::json!({"handoff_id": handoff.id, "to_team": to_team}),
        )
        .await;
        Ok(handoff)
    }

    /// The receiving team acknowledges: each open task is released from
    /// its current owner and handed to the receiving leader through the
    /// same compare-and-swap path as any delegation, carrying the payload
    /// with it.
    pub async fn acknowledge_handoff(&self, handoff_id: Uuid) -> FleetResult<Handoff> {
        let mut handoff = {
            let pending = self.pending_handoffs.read().await;
            pending
                .get(&handoff_id)
                .cloned()
                .ok_or_else(|| FleetError::NotFound(format!("handoff {handoff_id}")))?
        };
        if handoff.status != HandoffStatus::Pending {
            return Err(FleetError::Store(format!(
                "handoff {handoff_id} already acknowledged"
            )));
        }
        let to = self.repo.team(handoff.to_team).await?;

        for task_id in handoff.payload.task_ids.clone() {
            self.release_for_transfer(task_id).await?;
            match self.delegation.assign_to(task_id, to.leader_id).await {
                Ok(_) => {}
                Err(FleetError::NoEligibleAgent(reason)) => {
                    // Leader is saturated; the task stays pending for the
                    // receiving side's next delegation pass.
                    info!(task_id = %task_id, %reason, "handed-off task left pending");
                }
                Err(e) => return Err(e),
            }
        }

        handoff.status = HandoffStatus::Acknowledged;
        handoff.acknowledged_at = Some(Utc::now());
        self.pending_handoffs
            .write()
            .await
            .insert(handoff.id, handoff.clone());

        self.set_team_state(handoff.from_team, TeamState::Working).await?;
        self.set_team_state(handoff.to_team, TeamState::Working).await?;

        let notification = Notification::new(
            "handoff acknowledged",
            format!(
                "{} tasks, {} artifacts transferred{}",
                handoff.payload.task_ids.len(),
                handoff.payload.artifacts.len(),
                handoff
                    .payload
                    .notes
                    .as_deref()
                    .map(|n| format!("; notes: {n}"))
                    .unwrap_or_default()
            ),
            Severity::Info,
        );
        if let Err(e) = self
            .notifier
            .notify(&[handoff.from_team, handoff.to_team], &notification)
            .await
        {
            warn!(error = %e, "handoff notification failed");
        }
        self.record_audit(
            "handoff_acknowledged",
            handoff.to_team,
            serde_json::json!({
                "handoff_id": handoff.id,
                "tasks": handoff.payload.task_ids,
                "artifacts": handoff.payload.artifacts,
            }),
        )
        .await;

        info!(handoff_id = %handoff_id, "handoff complete");
        Ok(handoff)
    }

    // --- internals ---

    /// The team's open proposal: the latest proposal with no decision.
    async fn open_proposal(&self, team_id: Uuid) -> FleetResult<Option<NegotiationMessage>> {
        let log = self.repo.negotiation_log(team_id).await?;
        let decided: Vec<Uuid> = log
            .iter()
            .filter(|m| m.kind == NegotiationKind::Decision)
            .filter_map(|m| {
                m.payload
                    .get("proposal_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
            })
            .collect();
        Ok(log
            .iter()
            .filter(|m| m.kind == NegotiationKind::Proposal && !decided.contains(&m.id))
            .last()
            .cloned())
    }

    fn find_open_proposal(
        log: &[NegotiationMessage],
        proposal_id: Uuid,
    ) -> FleetResult<&NegotiationMessage> {
        let proposal = log
            .iter()
            .find(|m| m.id == proposal_id && m.kind == NegotiationKind::Proposal)
            .ok_or_else(|| FleetError::NotFound(format!("proposal {proposal_id}")))?;
        let decided = log.iter().any(|m| {
            m.kind == NegotiationKind::Decision
                && m.payload.get("proposal_id").and_then(|v| v.as_str())
                    == Some(proposal_id.to_string().as_str())
        });
        if decided {
            return Err(FleetError::Negotiation(format!(
                "proposal {proposal_id} is already decided"
            )));
        }
        Ok(proposal)
    }

    fn votes_for(log: &[NegotiationMessage], proposal_id: Uuid) -> Vec<(Uuid, VoteChoice)> {
        log.iter()
            .filter(|m| m.kind == NegotiationKind::Vote)
            .filter(|m| {
                m.payload.get("proposal_id").and_then(|v| v.as_str())
                    == Some(proposal_id.to_string().as_str())
            })
            .filter_map(|m| {
                m.payload
                    .get("choice")
                    .and_then(|c| serde_json::from_value(c.clone()).ok())
                    .map(|choice| (m.proposer, choice))
            })
            .collect()
    }

    fn deadline_passed(&self, proposal: &NegotiationMessage) -> bool {
        Utc::now() - proposal.created_at > Duration::minutes(self.config.vote_deadline_minutes)
    }

    async fn expire_proposal(&self, team: &Team, proposal: &NegotiationMessage) -> FleetResult<()> {
        self.decide(team.id, proposal.id, team.leader_id, "expired")
            .await?;
        self.set_team_state(team.id, TeamState::Escalated).await?;
        self.escalations
            .raise(
                EscalationKind::NegotiationTimeout,
                team.id,
                Severity::Warning,
                format!(
                    "team '{}' missed the voting deadline on proposal {}",
                    team.name, proposal.id
                ),
                Some("review the proposal with the team leader".into()),
            )
            .await?;
        warn!(team_id = %team.id, proposal_id = %proposal.id, "negotiation timed out");
        Ok(())
    }

    async fn decide(
        &self,
        team_id: Uuid,
        proposal_id: Uuid,
        by: Uuid,
        result: &str,
    ) -> FleetResult<()> {
        self.repo
            .append_negotiation(NegotiationMessage::new(
                team_id,
                by,
                NegotiationKind::Decision,
                serde_json::json!({"proposal_id": proposal_id, "result": result}),
            ))
            .await?;
        self.record_audit(
            "negotiation_decided",
            team_id,
            serde_json::json!({"proposal_id": proposal_id, "result": result}),
        )
        .await;
        Ok(())
    }

    /// Release a task from its owner for a team transfer. No retry is
    /// spent: a handoff is not a failure.
    async fn release_for_transfer(&self, task_id: Uuid) -> FleetResult<()> {
        for _ in 0..5 {
            let mut task = self.repo.task(task_id).await?;
            if task.status == TaskStatus::Pending {
                return Ok(());
            }
            if task.status.is_terminal() {
                return Err(FleetError::Store(format!(
                    "task {task_id} became terminal during handoff"
                )));
            }
            let owner = task.assigned_agent.take();
            task.status = TaskStatus::Pending;
            task.started_at = None;
            task.progress_percent = 0;
            task.touch();
            match self.repo.update_task(task).await {
                Ok(_) => {
                    if let Some(agent_id) = owner {
                        self.delegation
                            .detach_task_from_agent(agent_id, task_id, false)
                            .await;
                    }
                    return Ok(());
                }
                Err(FleetError::AssignmentConflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FleetError::AssignmentConflict(format!(
            "task {task_id} contested during handoff"
        )))
    }

    async fn set_team_state(&self, team_id: Uuid, state: TeamState) -> FleetResult<()> {
        for _ in 0..5 {
            let mut team = self.repo.team(team_id).await?;
            if team.state == state {
                return Ok(());
            }
            team.state = state;
            match self.repo.update_team(team).await {
                Ok(_) => return Ok(()),
                Err(FleetError::AssignmentConflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn record_audit(&self, action: &str, subject: Uuid, details: serde_json::Value) {
        let event = AuditEvent::new(action, Some(subject), details);
        if let Err(e) = self.audit.record(event).await {
            warn!(error = %e, "audit write failed");
        }
    }
}

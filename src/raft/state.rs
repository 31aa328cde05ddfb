//! Raft node state management.

use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// The state of a Raft node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Follower state - passive, responds to RPCs.
    Follower,
    /// Candidate state - actively seeking election.
    Candidate,
    /// Leader state - handling client requests and replication.
    Leader,
}

impl NodeState {
    pub fn is_leader(&self) -> bool {
        matches!(self, NodeState::Leader)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, NodeState::Follower)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "Follower"),
            NodeState::Candidate => write!(f, "Candidate"),
            NodeState::Leader => write!(f, "Leader"),
        }
    }
}

/// State that must survive restarts: term, vote and commit position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    /// Latest term the node has seen.
    pub term: Term,
    /// Candidate voted for in `term`, zero for none.
    pub vote: NodeId,
    /// Highest index known to be committed.
    pub commit: LogIndex,
}

impl HardState {
    pub fn is_empty(&self) -> bool {
        *self == HardState::default()
    }
}

/// Voting configuration captured by a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfState {
    pub voters: Vec<NodeId>,
    pub learners: Vec<NodeId>,
}

/// Point-in-time view of a node, for external observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub id: NodeId,
    pub state: NodeState,
    pub leader_id: Option<NodeId>,
    pub hard_state: HardState,
    pub applied: LogIndex,
    pub voters: Vec<NodeId>,
}

/// Complete Raft state for a node.
#[derive(Debug)]
pub struct RaftState {
    /// This node's ID.
    pub node_id: NodeId,
    /// Current node state (Follower/Candidate/Leader).
    pub state: NodeState,
    /// Current leader ID (if known).
    pub leader_id: Option<NodeId>,
    /// Durable state.
    pub hard_state: HardState,
    /// Index of the last entry applied to the state machine.
    pub applied: LogIndex,
    /// Voting members, sorted.
    pub voters: Vec<NodeId>,
    /// Ticks until an election is started, drawn from [election, 2 * election).
    pub randomized_election_timeout: usize,
}

impl RaftState {
    pub fn new(node_id: NodeId, voters: Vec<NodeId>) -> Self {
        let mut voters = voters;
        voters.sort_unstable();
        voters.dedup();
        Self {
            node_id,
            state: NodeState::Follower,
            leader_id: None,
            hard_state: HardState::default(),
            applied: 0,
            voters,
            randomized_election_timeout: 0,
        }
    }

    /// Transition to follower state.
    pub fn become_follower(&mut self, term: Term, leader_id: Option<NodeId>) {
        // Reset the vote if the term moved forward
        if term > self.hard_state.term {
            self.hard_state.vote = 0;
        }
        self.state = NodeState::Follower;
        self.hard_state.term = term;
        self.leader_id = leader_id;

        tracing::info!(
            node_id = self.node_id,
            term = term,
            leader = ?leader_id,
            "Became follower"
        );
    }

    /// Check if this node is the leader.
    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    /// Get the current term.
    pub fn current_term(&self) -> Term {
        self.hard_state.term
    }

    pub fn status(&self) -> Status {
        Status {
            id: self.node_id,
            state: self.state,
            leader_id: self.leader_id,
            hard_state: self.hard_state,
            applied: self.applied,
            voters: self.voters.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = RaftState::new(1, vec![3, 1, 2, 2]);
        assert!(state.state.is_follower());
        assert_eq!(state.current_term(), 0);
        assert!(state.leader_id.is_none());
        assert_eq!(state.voters, vec![1, 2, 3]);
    }

    #[test]
    fn test_become_follower_resets_vote_on_new_term() {
        let mut state = RaftState::new(1, vec![1, 2, 3]);
        state.hard_state = HardState { term: 2, vote: 3, commit: 0 };

        state.become_follower(2, Some(3));
        assert_eq!(state.hard_state.vote, 3);

        state.become_follower(4, None);
        assert_eq!(state.hard_state.vote, 0);
        assert_eq!(state.current_term(), 4);
    }

    #[test]
    fn test_hard_state_empty() {
        assert!(HardState::default().is_empty());
        assert!(!HardState { term: 1, vote: 0, commit: 0 }.is_empty());
    }
}

//! Consensus voting among agent processes.
//!
//! Proposals and votes live in one SQLite file. A vote replaces any earlier
//! vote by the same agent. Tallying runs on every vote and on a background
//! deadline sweep: with a quorum configured, a proposal resolves as soon as
//! enough agents have voted; without one it resolves at the deadline. A
//! deadline reached before quorum times the proposal out.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::types::{
    AgentId, CoordinationError, ProposalId, ProposalStatus, VoteChoice, VotingStrategy,
};

/// Sortable timestamp format for proposal columns.
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
/// Inner SQLite busy timeout.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One proposal.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub title: String,
    pub description: String,
    pub proposer: AgentId,
    pub strategy: VotingStrategy,
    pub deadline: String,
    pub required_votes: Option<u32>,
    pub status: ProposalStatus,
    pub created_at: String,
}

/// One cast vote.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Vote {
    pub agent: AgentId,
    pub choice: VoteChoice,
    pub weight: f64,
    pub confidence: f64,
    pub cast_at: String,
}

/// The persistent consensus engine.
pub struct ConsensusEngine {
    conn: tokio::sync::Mutex<Connection>,
}

impl ConsensusEngine {
    pub fn open(path: &Path) -> Result<Self, CoordinationError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoordinationError::Sqlite(format!("create dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, CoordinationError> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    fn init_connection(conn: &Connection) -> Result<(), CoordinationError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS proposals (
                id             TEXT PRIMARY KEY,
                title          TEXT NOT NULL,
                description    TEXT NOT NULL,
                proposer       TEXT NOT NULL,
                strategy       TEXT NOT NULL,
                deadline       TEXT NOT NULL,
                required_votes INTEGER,
                status         TEXT NOT NULL DEFAULT 'active',
                created_at     TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS votes (
                proposal_id TEXT NOT NULL,
                agent_id    TEXT NOT NULL,
                choice      TEXT NOT NULL,
                weight      REAL NOT NULL DEFAULT 1.0,
                confidence  REAL NOT NULL DEFAULT 1.0,
                cast_at     TEXT NOT NULL,
                PRIMARY KEY (proposal_id, agent_id),
                FOREIGN KEY (proposal_id) REFERENCES proposals(id)
            );

            CREATE INDEX IF NOT EXISTS idx_proposals_status ON proposals(status);",
        )?;
        Ok(())
    }

    /// Open a new proposal for votes.
    pub async fn create(
        &self,
        title: &str,
        description: &str,
        proposer: &AgentId,
        strategy: VotingStrategy,
        deadline: DateTime<Utc>,
        required_votes: Option<u32>,
    ) -> Result<ProposalId, CoordinationError> {
        let id = ProposalId::new();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO proposals
                (id, title, description, proposer, strategy, deadline,
                 required_votes, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', ?8)",
            rusqlite::params![
                id.to_string(),
                title,
                description,
                proposer.as_str(),
                strategy.as_str(),
                deadline.format(TS_FORMAT).to_string(),
                required_votes.map(i64::from),
                Utc::now().format(TS_FORMAT).to_string(),
            ],
        )?;
        tracing::info!(proposal = %id, title, "proposal created");
        Ok(id)
    }

    /// Cast (or replace) one agent's vote, then re-evaluate the proposal.
    /// Returns the proposal's status after the vote.
    pub async fn cast_vote(
        &self,
        proposal_id: ProposalId,
        agent: &AgentId,
        choice: VoteChoice,
        confidence: f64,
        weight: Option<f64>,
    ) -> Result<ProposalStatus, CoordinationError> {
        let conn = self.conn.lock().await;
        let proposal = load_proposal(&conn, proposal_id)?;
        if proposal.status.is_terminal() {
            return Err(CoordinationError::ProposalClosed(proposal_id.to_string()));
        }

        conn.execute(
            "INSERT OR REPLACE INTO votes
                (proposal_id, agent_id, choice, weight, confidence, cast_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                proposal_id.to_string(),
                agent.as_str(),
                choice.as_str(),
                weight.unwrap_or(1.0),
                confidence.clamp(0.0, 1.0),
                Utc::now().format(TS_FORMAT).to_string(),
            ],
        )?;

        // With a quorum configured, resolve as soon as it is reached.
        let votes = load_votes(&conn, proposal_id)?;
        if let Some(required) = proposal.required_votes {
            if votes.len() as u32 >= required {
                let status = if tally(&votes, proposal.strategy, proposal.required_votes) {
                    ProposalStatus::Approved
                } else {
                    ProposalStatus::Rejected
                };
                set_status(&conn, proposal_id, status)?;
                return Ok(status);
            }
        }
        Ok(ProposalStatus::Active)
    }

    pub async fn get(&self, id: ProposalId) -> Result<Proposal, CoordinationError> {
        let conn = self.conn.lock().await;
        load_proposal(&conn, id)
    }

    pub async fn votes(&self, id: ProposalId) -> Result<Vec<Vote>, CoordinationError> {
        let conn = self.conn.lock().await;
        load_votes(&conn, id)
    }

    pub async fn list_active(&self) -> Result<Vec<Proposal>, CoordinationError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, title, description, proposer, strategy, deadline,
                    required_votes, status, created_at
             FROM proposals WHERE status = 'active' ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], row_to_proposal)?;
        let mut proposals = Vec::new();
        for row in rows {
            proposals.push(row??);
        }
        Ok(proposals)
    }

    /// Resolve every active proposal whose deadline has passed: tally if a
    /// quorum was met (or none was required), otherwise time out. Returns
    /// the resolutions made.
    pub async fn sweep_deadlines(
        &self,
    ) -> Result<Vec<(ProposalId, ProposalStatus)>, CoordinationError> {
        let now = Utc::now().format(TS_FORMAT).to_string();
        let conn = self.conn.lock().await;
        let due: Vec<Proposal> = {
            let mut stmt = conn.prepare(
                "SELECT id, title, description, proposer, strategy, deadline,
                        required_votes, status, created_at
                 FROM proposals WHERE status = 'active' AND deadline <= ?1",
            )?;
            let rows = stmt.query_map(rusqlite::params![now], row_to_proposal)?;
            let mut due = Vec::new();
            for row in rows {
                due.push(row??);
            }
            due
        };

        let mut resolutions = Vec::new();
        for proposal in due {
            let votes = load_votes(&conn, proposal.id)?;
            let quorum_met = proposal
                .required_votes
                .map_or(true, |required| votes.len() as u32 >= required);
            let status = if !quorum_met {
                ProposalStatus::TimedOut
            } else if tally(&votes, proposal.strategy, proposal.required_votes) {
                ProposalStatus::Approved
            } else {
                ProposalStatus::Rejected
            };
            set_status(&conn, proposal.id, status)?;
            tracing::info!(proposal = %proposal.id, status = status.as_str(), "proposal resolved");
            resolutions.push((proposal.id, status));
        }
        Ok(resolutions)
    }
}

/// Apply a strategy to the vote set.
fn tally(votes: &[Vote], strategy: VotingStrategy, quorum: Option<u32>) -> bool {
    let approvals = votes
        .iter()
        .filter(|v| v.choice == VoteChoice::Approve)
        .count();
    let rejections = votes
        .iter()
        .filter(|v| v.choice == VoteChoice::Reject)
        .count();
    let decisive = approvals + rejections;

    match strategy {
        VotingStrategy::Majority => approvals > rejections,
        VotingStrategy::Supermajority => decisive > 0 && approvals * 3 >= decisive * 2,
        VotingStrategy::Unanimous => {
            rejections == 0 && approvals as u32 >= quorum.unwrap_or(1).max(1)
        }
        VotingStrategy::Weighted => {
            let sum = |choice: VoteChoice| {
                votes
                    .iter()
                    .filter(|v| v.choice == choice)
                    .map(|v| v.weight * v.confidence)
                    .sum::<f64>()
            };
            sum(VoteChoice::Approve) > sum(VoteChoice::Reject)
        }
    }
}

fn set_status(
    conn: &Connection,
    id: ProposalId,
    status: ProposalStatus,
) -> Result<(), CoordinationError> {
    conn.execute(
        "UPDATE proposals SET status = ?1 WHERE id = ?2",
        rusqlite::params![status.as_str(), id.to_string()],
    )?;
    Ok(())
}

fn load_proposal(conn: &Connection, id: ProposalId) -> Result<Proposal, CoordinationError> {
    let mut stmt = conn.prepare(
        "SELECT id, title, description, proposer, strategy, deadline,
                required_votes, status, created_at
         FROM proposals WHERE id = ?1",
    )?;
    let mut rows = stmt.query_map(rusqlite::params![id.to_string()], row_to_proposal)?;
    match rows.next() {
        Some(row) => row?,
        None => Err(CoordinationError::ProposalNotFound(id.to_string())),
    }
}

fn load_votes(conn: &Connection, id: ProposalId) -> Result<Vec<Vote>, CoordinationError> {
    let mut stmt = conn.prepare(
        "SELECT agent_id, choice, weight, confidence, cast_at
         FROM votes WHERE proposal_id = ?1 ORDER BY cast_at",
    )?;
    let rows = stmt.query_map(rusqlite::params![id.to_string()], |row| {
        let agent: String = row.get(0)?;
        let choice: String = row.get(1)?;
        Ok((
            agent,
            choice,
            row.get::<_, f64>(2)?,
            row.get::<_, f64>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;
    let mut votes = Vec::new();
    for row in rows {
        let (agent, choice, weight, confidence, cast_at) = row?;
        votes.push(Vote {
            agent: AgentId::new(agent),
            choice: choice.parse().map_err(CoordinationError::Serialization)?,
            weight,
            confidence,
            cast_at,
        });
    }
    Ok(votes)
}

type ProposalRow = Result<Proposal, CoordinationError>;

fn row_to_proposal(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProposalRow> {
    let id_str: String = row.get(0)?;
    let title: String = row.get(1)?;
    let description: String = row.get(2)?;
    let proposer: String = row.get(3)?;
    let strategy_str: String = row.get(4)?;
    let deadline: String = row.get(5)?;
    let required_votes: Option<i64> = row.get(6)?;
    let status_str: String = row.get(7)?;
    let created_at: String = row.get(8)?;

    Ok((|| -> ProposalRow {
        Ok(Proposal {
            id: id_str
                .parse()
                .map_err(|e: uuid::Error| CoordinationError::Serialization(e.to_string()))?,
            title,
            description,
            proposer: AgentId::new(proposer),
            strategy: strategy_str
                .parse()
                .map_err(CoordinationError::Serialization)?,
            deadline,
            required_votes: required_votes.map(|v| v as u32),
            status: status_str
                .parse()
                .map_err(CoordinationError::Serialization)?,
            created_at,
        })
    })())
}

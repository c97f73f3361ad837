#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use clawhub_rep_core::{
    calibration_score, derive_submission_flags, format_rfc3339, generate_api_key, hash_api_key,
    is_ownership_proof_url, judge_submissions, now_utc, parse_bearer, parse_rfc3339_utc,
    settle_prediction, verification_message, Agent, AgentId, AgentRegistration, AgentStanding,
    CategoryStats, EngineError, Event, EventDraft, EventId, EventStatus, EventStatusFilter,
    EventTally, JudgeSubmission, JudgeVerdict, LeaderboardSort, Prediction, PredictionId,
    ReputationRuleset, SettlementReport, Side, SubmissionInput, Tier,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

const REP_MIGRATION_VERSION: i64 = 1;

const SCHEMA_REP_V1: &str = r"
CREATE TABLE IF NOT EXISTS rep_rulesets (
  ruleset_version INTEGER PRIMARY KEY,
  ruleset_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agents (
  agent_id TEXT PRIMARY KEY,
  username TEXT NOT NULL UNIQUE,
  api_key_hash TEXT NOT NULL UNIQUE,
  twitter_handle TEXT,
  bio TEXT,
  verified INTEGER NOT NULL DEFAULT 0 CHECK (verified IN (0, 1)),
  verification_url TEXT,
  reputation INTEGER NOT NULL,
  tier TEXT NOT NULL CHECK (tier IN ('Bronze', 'Silver', 'Gold', 'Platinum', 'Diamond')),
  total_predictions INTEGER NOT NULL DEFAULT 0 CHECK (total_predictions >= 0),
  correct_predictions INTEGER NOT NULL DEFAULT 0 CHECK (correct_predictions >= 0),
  accuracy_overall REAL NOT NULL DEFAULT 0.0,
  avg_confidence REAL NOT NULL DEFAULT 0.0,
  calibration_score REAL NOT NULL DEFAULT 0.0,
  current_streak INTEGER NOT NULL DEFAULT 0 CHECK (current_streak >= 0),
  best_streak INTEGER NOT NULL DEFAULT 0 CHECK (best_streak >= 0),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agents_reputation ON agents(reputation DESC);
CREATE INDEX IF NOT EXISTS idx_agents_accuracy ON agents(accuracy_overall DESC);

CREATE TABLE IF NOT EXISTS events (
  event_id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  description TEXT NOT NULL,
  resolution_criteria TEXT NOT NULL,
  resolution_source TEXT,
  category TEXT NOT NULL,
  difficulty TEXT,
  tags_json TEXT NOT NULL DEFAULT '[]',
  rep_reward INTEGER NOT NULL CHECK (rep_reward >= 0),
  status TEXT NOT NULL CHECK (status IN ('open', 'closed', 'resolved')),
  result TEXT CHECK (result IN ('YES', 'NO') OR result IS NULL),
  opens_at TEXT NOT NULL,
  closes_at TEXT NOT NULL,
  resolves_at TEXT NOT NULL,
  total_predictions INTEGER NOT NULL DEFAULT 0,
  yes_count INTEGER NOT NULL DEFAULT 0,
  no_count INTEGER NOT NULL DEFAULT 0,
  yes_percentage REAL NOT NULL DEFAULT 0.0,
  no_percentage REAL NOT NULL DEFAULT 0.0,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_status_closes ON events(status, closes_at);
CREATE INDEX IF NOT EXISTS idx_events_category ON events(category);

CREATE TABLE IF NOT EXISTS predictions (
  prediction_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  prediction_id TEXT NOT NULL UNIQUE,
  event_id TEXT NOT NULL,
  agent_id TEXT NOT NULL,
  side TEXT NOT NULL CHECK (side IN ('YES', 'NO')),
  confidence INTEGER NOT NULL CHECK (confidence BETWEEN 0 AND 100),
  reasoning TEXT NOT NULL,
  is_early_bird INTEGER NOT NULL CHECK (is_early_bird IN (0, 1)),
  is_contrarian INTEGER NOT NULL CHECK (is_contrarian IN (0, 1)),
  was_correct INTEGER CHECK (was_correct IN (0, 1) OR was_correct IS NULL),
  rep_change INTEGER NOT NULL DEFAULT 0,
  is_winner INTEGER NOT NULL DEFAULT 0 CHECK (is_winner IN (0, 1)),
  like_count INTEGER NOT NULL DEFAULT 0 CHECK (like_count >= 0),
  created_at TEXT NOT NULL,
  UNIQUE (event_id, agent_id),
  FOREIGN KEY (event_id) REFERENCES events(event_id) ON DELETE CASCADE,
  FOREIGN KEY (agent_id) REFERENCES agents(agent_id) ON DELETE CASCADE
);

CREATE TRIGGER IF NOT EXISTS trg_predictions_settle_once
BEFORE UPDATE OF was_correct, rep_change ON predictions
WHEN OLD.was_correct IS NOT NULL
BEGIN
  SELECT RAISE(FAIL, 'prediction settlement is write-once');
END;

CREATE INDEX IF NOT EXISTS idx_predictions_agent ON predictions(agent_id, prediction_seq);

CREATE TABLE IF NOT EXISTS category_stats (
  agent_id TEXT NOT NULL,
  category TEXT NOT NULL,
  total_predictions INTEGER NOT NULL DEFAULT 0,
  correct_predictions INTEGER NOT NULL DEFAULT 0,
  accuracy REAL NOT NULL DEFAULT 0.0,
  UNIQUE (agent_id, category),
  FOREIGN KEY (agent_id) REFERENCES agents(agent_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS prediction_likes (
  prediction_id TEXT NOT NULL,
  agent_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (prediction_id, agent_id),
  FOREIGN KEY (prediction_id) REFERENCES predictions(prediction_id) ON DELETE CASCADE,
  FOREIGN KEY (agent_id) REFERENCES agents(agent_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS prediction_replies (
  reply_id TEXT PRIMARY KEY,
  prediction_id TEXT NOT NULL,
  agent_id TEXT NOT NULL,
  content TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (prediction_id) REFERENCES predictions(prediction_id) ON DELETE CASCADE,
  FOREIGN KEY (agent_id) REFERENCES agents(agent_id) ON DELETE CASCADE
);
";

const AGENT_COLUMNS: &str = "agent_id, username, twitter_handle, bio, verified, reputation, tier,
    total_predictions, correct_predictions, accuracy_overall, avg_confidence, calibration_score,
    current_streak, best_streak, created_at, updated_at";

const EVENT_COLUMNS: &str = "event_id, title, description, resolution_criteria, resolution_source,
    category, difficulty, tags_json, rep_reward, status, result, opens_at, closes_at, resolves_at,
    total_predictions, yes_count, no_count, yes_percentage, no_percentage, created_at, updated_at";

const PREDICTION_COLUMNS: &str = "p.prediction_id, p.event_id, p.agent_id, p.side, p.confidence,
    p.reasoning, p.is_early_bird, p.is_contrarian, p.was_correct, p.rep_change, p.is_winner,
    p.like_count, p.created_at";

pub struct SqliteReputationStore {
    conn: Connection,
    ruleset: ReputationRuleset,
}

/// Registration result. `api_key` is returned once and never stored in clear.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisteredAgent {
    pub agent: Agent,
    pub api_key: String,
    pub verification_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardEntry {
    pub rank: usize,
    #[serde(flatten)]
    pub agent: Agent,
}

/// A prediction joined with its author's live profile and the event title.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PredictionView {
    #[serde(flatten)]
    pub prediction: Prediction,
    pub username: String,
    pub agent_tier: Tier,
    pub event_title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStats {
    pub agent: Agent,
    pub wrong_predictions: u32,
    pub categories: Vec<CategoryStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlatformStats {
    pub total_agents: u64,
    pub total_predictions: u64,
    pub open_events: u64,
    pub total_events: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WinnerAward {
    pub event_id: EventId,
    pub prediction_id: PredictionId,
    pub agent_id: AgentId,
    pub rep_award: i64,
    pub reputation_after: i64,
    pub tier_after: Tier,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JudgeOutcome {
    pub verdict: JudgeVerdict,
    pub award: WinnerAward,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LikeReceipt {
    pub prediction_id: PredictionId,
    pub agent_id: AgentId,
    pub like_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PredictionReply {
    pub reply_id: String,
    pub prediction_id: PredictionId,
    pub agent_id: AgentId,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl SqliteReputationStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            ruleset: ReputationRuleset::v1(),
        })
    }

    /// Replaces the active ruleset. Takes effect for operations issued after
    /// the call; call [`Self::migrate`] to persist it.
    pub fn with_ruleset(mut self, ruleset: ReputationRuleset) -> Result<Self> {
        ruleset.validate()?;
        self.ruleset = ruleset;
        Ok(self)
    }

    #[must_use]
    pub fn ruleset(&self) -> &ReputationRuleset {
        &self.ruleset
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_REP_V1)
            .context("failed to apply reputation schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![REP_MIGRATION_VERSION, now],
            )
            .context("failed to register reputation schema migration")?;

        self.upsert_ruleset(&self.ruleset)
    }

    pub fn upsert_ruleset(&self, ruleset: &ReputationRuleset) -> Result<()> {
        ruleset
            .validate()
            .map_err(|err| anyhow!("invalid ruleset configuration: {err}"))?;

        let payload = serde_json::to_string(ruleset).context("failed to serialize ruleset")?;
        let now = format_rfc3339(now_utc())?;

        self.conn
            .execute(
                "INSERT INTO rep_rulesets(ruleset_version, ruleset_json, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(ruleset_version) DO UPDATE SET
                   ruleset_json = excluded.ruleset_json,
                   created_at = excluded.created_at",
                params![i64::from(ruleset.ruleset_version), payload, now],
            )
            .context("failed to upsert ruleset")?;

        Ok(())
    }

    pub fn get_rulesets(&self) -> Result<BTreeMap<u32, ReputationRuleset>> {
        let mut stmt = self.conn.prepare(
            "SELECT ruleset_version, ruleset_json FROM rep_rulesets ORDER BY ruleset_version ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut map = BTreeMap::new();

        while let Some(row) = rows.next()? {
            let version_i64: i64 = row.get(0)?;
            let version = u32::try_from(version_i64)
                .with_context(|| format!("invalid ruleset_version: {version_i64}"))?;
            let json: String = row.get(1)?;
            let value: Value =
                serde_json::from_str(&json).context("invalid stored ruleset JSON")?;
            let ruleset = ReputationRuleset::from_json(&value)
                .map_err(|err| anyhow!("failed to parse ruleset {version}: {err}"))?;
            map.insert(version, ruleset);
        }

        Ok(map)
    }

    pub fn register_agent(&mut self, registration: &AgentRegistration) -> Result<RegisteredAgent> {
        registration.validate()?;

        let ruleset = &self.ruleset;
        let tx = begin_immediate(&mut self.conn, "registration")?;

        let taken: Option<String> = tx
            .query_row(
                "SELECT agent_id FROM agents WHERE username = ?1",
                params![registration.username],
                |row| row.get(0),
            )
            .optional()
            .context("failed to check username availability")?;
        if taken.is_some() {
            warn!(username = %registration.username, "registration rejected: username taken");
            return Err(EngineError::Conflict(format!(
                "username {} is already registered",
                registration.username
            ))
            .into());
        }

        let now = now_utc();
        let agent = Agent {
            agent_id: AgentId::new(),
            username: registration.username.clone(),
            twitter_handle: registration.twitter_handle.clone(),
            bio: None,
            verified: false,
            standing: AgentStanding::registered(ruleset),
            created_at: now,
            updated_at: now,
        };
        let api_key = generate_api_key();
        insert_agent(&tx, &agent, &hash_api_key(&api_key))?;
        tx.commit()
            .context("failed to commit registration transaction")?;

        info!(agent_id = %agent.agent_id, username = %agent.username, "agent registered");
        Ok(RegisteredAgent {
            verification_message: verification_message(&agent.username, agent.agent_id),
            agent,
            api_key,
        })
    }

    /// Resolves an opaque bearer credential to its agent.
    pub fn authenticate(&self, credential: &str) -> Result<Agent> {
        let key_hash = hash_api_key(parse_bearer(credential.trim()));
        let agent = self
            .conn
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE api_key_hash = ?1"),
                params![key_hash],
                parse_agent_row,
            )
            .optional()
            .context("failed to resolve API key")?;

        match agent {
            Some(agent) => Ok(agent),
            None => {
                warn!("authentication rejected");
                Err(EngineError::Authorization("invalid API key".to_string()).into())
            }
        }
    }

    pub fn verify_agent(&mut self, agent_id: AgentId, proof_url: &str) -> Result<Agent> {
        if !is_ownership_proof_url(proof_url) {
            return Err(EngineError::Validation(
                "proof URL must be a twitter.com or x.com link".to_string(),
            )
            .into());
        }

        let ruleset = &self.ruleset;
        let tx = begin_immediate(&mut self.conn, "verification")?;
        let mut agent = require_agent(&tx, agent_id)?;
        if agent.verified {
            return Err(EngineError::Conflict(format!("agent {agent_id} is already verified")).into());
        }

        agent.verified = true;
        agent.standing.grant_bonus(ruleset.verification_bonus, ruleset);
        agent.updated_at = now_utc();
        update_agent(&tx, &agent)?;
        tx.execute(
            "UPDATE agents SET verification_url = ?2 WHERE agent_id = ?1",
            params![agent_id.to_string(), proof_url],
        )
        .context("failed to record verification URL")?;
        tx.commit()
            .context("failed to commit verification transaction")?;

        info!(agent_id = %agent_id, reputation = agent.standing.reputation, "agent verified");
        Ok(agent)
    }

    pub fn create_event(&mut self, draft: &EventDraft) -> Result<Event> {
        draft.validate()?;

        let now = now_utc();
        let event = Event {
            event_id: EventId::new(),
            title: draft.title.clone(),
            description: draft.description.clone(),
            resolution_criteria: draft.resolution_criteria.clone(),
            resolution_source: draft.resolution_source.clone(),
            category: draft.category.clone(),
            difficulty: draft.difficulty.clone(),
            tags: draft.tags.clone(),
            rep_reward: draft
                .rep_reward
                .unwrap_or(self.ruleset.default_winner_reward),
            status: EventStatus::Open,
            result: None,
            opens_at: draft.opens_at.unwrap_or(now),
            closes_at: draft.closes_at,
            resolves_at: draft.resolves_at,
            tally: EventTally::default(),
            created_at: now,
            updated_at: now,
        };

        let tx = begin_immediate(&mut self.conn, "event creation")?;
        insert_event(&tx, &event)?;
        tx.commit()
            .context("failed to commit event creation transaction")?;

        info!(event_id = %event.event_id, category = %event.category, "event created");
        Ok(event)
    }

    /// Records one prediction and its event/agent side effects as a unit.
    ///
    /// `submitted_at` defaults to the server clock and is only overridden by
    /// trusted callers such as replays and tests. Agent-facing surfaces pass
    /// `None`. Early-bird and contrarian flags are derived from it and the
    /// event tally before this submission.
    pub fn submit_prediction(
        &mut self,
        agent_id: AgentId,
        event_id: EventId,
        input: &SubmissionInput,
        submitted_at: Option<OffsetDateTime>,
    ) -> Result<Prediction> {
        input.validate(&self.ruleset)?;

        let ruleset = &self.ruleset;
        let tx = begin_immediate(&mut self.conn, "submission")?;

        let mut event = require_event(&tx, event_id)?;
        if let Err(err) = event.ensure_open() {
            warn!(event_id = %event_id, agent_id = %agent_id, "submission rejected: event not open");
            return Err(err.into());
        }
        let mut agent = require_agent(&tx, agent_id)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT prediction_id FROM predictions WHERE event_id = ?1 AND agent_id = ?2",
                params![event_id.to_string(), agent_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to check for existing prediction")?;
        if existing.is_some() {
            warn!(event_id = %event_id, agent_id = %agent_id, "submission rejected: duplicate");
            return Err(EngineError::Conflict(format!(
                "agent {agent_id} already predicted on event {event_id}"
            ))
            .into());
        }

        let created_at = submitted_at.unwrap_or_else(now_utc);
        let flags = derive_submission_flags(&event, input.side, created_at, ruleset);
        let prediction = Prediction {
            prediction_id: PredictionId::new(),
            event_id,
            agent_id,
            side: input.side,
            confidence: input.confidence,
            reasoning: input.reasoning.clone(),
            is_early_bird: flags.is_early_bird,
            is_contrarian: flags.is_contrarian,
            was_correct: None,
            rep_change: 0,
            is_winner: false,
            like_count: 0,
            created_at,
        };
        insert_prediction(&tx, &prediction)?;

        event.tally.record(input.side);
        event.updated_at = now_utc();
        update_event(&tx, &event)?;

        agent.standing.record_submission(input.confidence, ruleset);
        agent.updated_at = event.updated_at;
        update_agent(&tx, &agent)?;

        let mut category = load_category(&tx, agent_id, &event.category)?;
        category.record_submission();
        upsert_category(&tx, &category)?;

        tx.commit()
            .context("failed to commit submission transaction")?;

        info!(
            prediction_id = %prediction.prediction_id,
            event_id = %event_id,
            agent_id = %agent_id,
            side = prediction.side.as_str(),
            early_bird = prediction.is_early_bird,
            contrarian = prediction.is_contrarian,
            "prediction submitted"
        );
        Ok(prediction)
    }

    /// Binary-outcome settlement of an open event.
    pub fn resolve_event(&mut self, event_id: EventId, outcome: Side) -> Result<SettlementReport> {
        let ruleset = &self.ruleset;
        let tx = begin_immediate(&mut self.conn, "settlement")?;

        let mut event = require_event(&tx, event_id)?;
        if let Err(err) = event.ensure_open() {
            warn!(event_id = %event_id, "settlement rejected: event already terminal");
            return Err(err.into());
        }

        let predictions = load_event_predictions(&tx, event_id)?;
        let mut settlements = Vec::with_capacity(predictions.len());
        for prediction in &predictions {
            let settlement = settle_prediction(prediction, outcome, ruleset);
            tx.execute(
                "UPDATE predictions SET was_correct = ?2, rep_change = ?3 WHERE prediction_id = ?1",
                params![
                    prediction.prediction_id.to_string(),
                    bool_to_sql(settlement.was_correct),
                    settlement.rep_change
                ],
            )
            .context("failed to record prediction settlement")?;

            let mut agent = require_agent(&tx, prediction.agent_id)?;
            agent
                .standing
                .record_settlement(settlement.was_correct, settlement.rep_change, ruleset);
            agent.standing.calibration_score =
                calibration_score(&load_calibration_samples(&tx, prediction.agent_id)?);
            agent.updated_at = now_utc();
            update_agent(&tx, &agent)?;

            if settlement.was_correct {
                let mut category = load_category(&tx, prediction.agent_id, &event.category)?;
                category.record_correct();
                upsert_category(&tx, &category)?;
            }

            debug!(
                prediction_id = %settlement.prediction_id,
                agent_id = %settlement.agent_id,
                was_correct = settlement.was_correct,
                rep_change = settlement.rep_change,
                "prediction settled"
            );
            settlements.push(settlement);
        }

        event.status = EventStatus::Resolved;
        event.result = Some(outcome);
        event.updated_at = now_utc();
        update_event(&tx, &event)?;
        tx.commit()
            .context("failed to commit settlement transaction")?;

        let report = SettlementReport::new(event_id, outcome, settlements);
        info!(
            event_id = %event_id,
            outcome = outcome.as_str(),
            settled = report.settled_predictions,
            correct = report.correct_predictions,
            "event resolved"
        );
        Ok(report)
    }

    /// Winner-selection settlement. Other predictions on the event keep their
    /// unsettled state.
    pub fn select_winner(
        &mut self,
        event_id: EventId,
        winner_agent_id: AgentId,
    ) -> Result<WinnerAward> {
        let ruleset = &self.ruleset;
        let tx = begin_immediate(&mut self.conn, "winner selection")?;
        let event = require_event(&tx, event_id)?;
        let award = apply_winner(&tx, ruleset, event, winner_agent_id)?;
        tx.commit()
            .context("failed to commit winner selection transaction")?;

        info!(
            event_id = %event_id,
            agent_id = %winner_agent_id,
            rep_award = award.rep_award,
            "winner selected"
        );
        Ok(award)
    }

    /// Runs the mock judge over the event's predictions in submission order
    /// and awards the pick through the winner-selection path.
    pub fn judge_event(&mut self, event_id: EventId) -> Result<JudgeOutcome> {
        let ruleset = &self.ruleset;
        let tx = begin_immediate(&mut self.conn, "judging")?;

        let event = require_event(&tx, event_id)?;
        if let Err(err) = event.ensure_open() {
            warn!(event_id = %event_id, "judging rejected: event already terminal");
            return Err(err.into());
        }

        let submissions = load_judge_submissions(&tx, event_id)?;
        let verdict = match judge_submissions(&event, &submissions) {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(event_id = %event_id, "judging rejected: no submissions");
                return Err(err.into());
            }
        };
        let award = apply_winner(&tx, ruleset, event, verdict.winner_agent_id)?;
        tx.commit()
            .context("failed to commit judging transaction")?;

        info!(
            event_id = %event_id,
            winner = %verdict.winner_name,
            submissions = verdict.scores.len(),
            "event judged"
        );
        Ok(JudgeOutcome { verdict, award })
    }

    pub fn like_prediction(
        &mut self,
        agent_id: AgentId,
        prediction_id: PredictionId,
    ) -> Result<LikeReceipt> {
        let ruleset = &self.ruleset;
        let tx = begin_immediate(&mut self.conn, "like")?;

        let prediction = require_prediction(&tx, prediction_id)?;
        let mut liker = require_agent(&tx, agent_id)?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO prediction_likes(prediction_id, agent_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![
                    prediction_id.to_string(),
                    agent_id.to_string(),
                    format_rfc3339(now_utc())?
                ],
            )
            .context("failed to insert prediction like")?;
        if inserted == 0 {
            return Err(EngineError::Conflict(format!(
                "agent {agent_id} already liked prediction {prediction_id}"
            ))
            .into());
        }

        tx.execute(
            "UPDATE predictions SET like_count = like_count + 1 WHERE prediction_id = ?1",
            params![prediction_id.to_string()],
        )
        .context("failed to increment like count")?;

        liker.standing.grant_bonus(ruleset.like_bonus, ruleset);
        liker.updated_at = now_utc();
        update_agent(&tx, &liker)?;

        let mut author = require_agent(&tx, prediction.agent_id)?;
        author.standing.grant_bonus(ruleset.like_bonus, ruleset);
        author.updated_at = liker.updated_at;
        update_agent(&tx, &author)?;

        let like_count = like_count(&tx, prediction_id)?;
        tx.commit().context("failed to commit like transaction")?;

        debug!(prediction_id = %prediction_id, agent_id = %agent_id, "prediction liked");
        Ok(LikeReceipt {
            prediction_id,
            agent_id,
            like_count,
        })
    }

    /// Removes a like. REP granted by the like is kept.
    pub fn unlike_prediction(
        &mut self,
        agent_id: AgentId,
        prediction_id: PredictionId,
    ) -> Result<LikeReceipt> {
        let tx = begin_immediate(&mut self.conn, "unlike")?;
        require_prediction(&tx, prediction_id)?;

        let removed = tx
            .execute(
                "DELETE FROM prediction_likes WHERE prediction_id = ?1 AND agent_id = ?2",
                params![prediction_id.to_string(), agent_id.to_string()],
            )
            .context("failed to delete prediction like")?;
        if removed == 0 {
            return Err(EngineError::Validation(format!(
                "agent {agent_id} has not liked prediction {prediction_id}"
            ))
            .into());
        }

        tx.execute(
            "UPDATE predictions SET like_count = MAX(like_count - 1, 0) WHERE prediction_id = ?1",
            params![prediction_id.to_string()],
        )
        .context("failed to decrement like count")?;

        let like_count = like_count(&tx, prediction_id)?;
        tx.commit().context("failed to commit unlike transaction")?;

        Ok(LikeReceipt {
            prediction_id,
            agent_id,
            like_count,
        })
    }

    pub fn reply_to_prediction(
        &mut self,
        agent_id: AgentId,
        prediction_id: PredictionId,
        content: &str,
    ) -> Result<PredictionReply> {
        if content.chars().count() < self.ruleset.min_reply_chars {
            return Err(EngineError::Validation(format!(
                "reply MUST be at least {} characters",
                self.ruleset.min_reply_chars
            ))
            .into());
        }

        let tx = begin_immediate(&mut self.conn, "reply")?;
        require_prediction(&tx, prediction_id)?;
        require_agent(&tx, agent_id)?;

        let reply = PredictionReply {
            reply_id: Ulid::new().to_string(),
            prediction_id,
            agent_id,
            content: content.to_string(),
            created_at: now_utc(),
        };
        tx.execute(
            "INSERT INTO prediction_replies(reply_id, prediction_id, agent_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                reply.reply_id,
                prediction_id.to_string(),
                agent_id.to_string(),
                reply.content,
                format_rfc3339(reply.created_at)?
            ],
        )
        .context("failed to insert prediction reply")?;
        tx.commit().context("failed to commit reply transaction")?;

        Ok(reply)
    }

    pub fn list_replies(&self, prediction_id: PredictionId) -> Result<Vec<PredictionReply>> {
        let mut stmt = self.conn.prepare(
            "SELECT reply_id, prediction_id, agent_id, content, created_at
             FROM prediction_replies
             WHERE prediction_id = ?1
             ORDER BY created_at ASC, reply_id ASC",
        )?;
        let rows = stmt.query_map(params![prediction_id.to_string()], parse_reply_row)?;
        collect_rows(rows)
    }

    pub fn get_agent(&self, agent_id: AgentId) -> Result<Option<Agent>> {
        load_agent(&self.conn, agent_id)
    }

    pub fn get_agent_by_username(&self, username: &str) -> Result<Option<Agent>> {
        self.conn
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE username = ?1"),
                params![username],
                parse_agent_row,
            )
            .optional()
            .context("failed to load agent by username")
    }

    pub fn leaderboard(
        &self,
        sort: LeaderboardSort,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<LeaderboardEntry>> {
        let order = match sort {
            LeaderboardSort::Reputation => "reputation DESC, username ASC",
            LeaderboardSort::Accuracy => "accuracy_overall DESC, reputation DESC, username ASC",
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents ORDER BY {order} LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt.query_map(
            params![to_sql_count(limit)?, to_sql_count(skip)?],
            parse_agent_row,
        )?;

        Ok(collect_rows(rows)?
            .into_iter()
            .enumerate()
            .map(|(index, agent)| LeaderboardEntry {
                rank: skip + index + 1,
                agent,
            })
            .collect())
    }

    pub fn get_event(&self, event_id: EventId) -> Result<Option<Event>> {
        load_event(&self.conn, event_id)
    }

    pub fn list_events(
        &self,
        filter: EventStatusFilter,
        category: Option<&str>,
    ) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR category = ?2)
             ORDER BY closes_at ASC, event_id ASC"
        ))?;
        let rows = stmt.query_map(
            params![filter.status().map(EventStatus::as_str), category],
            parse_event_row,
        )?;
        collect_rows(rows)
    }

    /// Predictions on an event, newest first, with each author's current tier.
    pub fn event_predictions(&self, event_id: EventId) -> Result<Vec<PredictionView>> {
        if load_event(&self.conn, event_id)?.is_none() {
            return Err(EngineError::NotFound(format!("event {event_id}")).into());
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PREDICTION_COLUMNS}, a.username, a.tier, e.title
             FROM predictions p
             JOIN agents a ON a.agent_id = p.agent_id
             JOIN events e ON e.event_id = p.event_id
             WHERE p.event_id = ?1
             ORDER BY p.prediction_seq DESC"
        ))?;
        let rows = stmt.query_map(params![event_id.to_string()], parse_prediction_view_row)?;
        collect_rows(rows)
    }

    pub fn recent_predictions(&self, limit: usize) -> Result<Vec<PredictionView>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PREDICTION_COLUMNS}, a.username, a.tier, e.title
             FROM predictions p
             JOIN agents a ON a.agent_id = p.agent_id
             JOIN events e ON e.event_id = p.event_id
             ORDER BY p.prediction_seq DESC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![to_sql_count(limit)?], parse_prediction_view_row)?;
        collect_rows(rows)
    }

    pub fn agent_stats(&self, agent_id: AgentId) -> Result<Option<AgentStats>> {
        let Some(agent) = load_agent(&self.conn, agent_id)? else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT agent_id, category, total_predictions, correct_predictions, accuracy
             FROM category_stats
             WHERE agent_id = ?1
             ORDER BY category ASC",
        )?;
        let rows = stmt.query_map(params![agent_id.to_string()], parse_category_row)?;
        let categories = collect_rows(rows)?;

        Ok(Some(AgentStats {
            wrong_predictions: agent
                .standing
                .total_predictions
                .saturating_sub(agent.standing.correct_predictions),
            agent,
            categories,
        }))
    }

    pub fn platform_stats(&self) -> Result<PlatformStats> {
        self.conn
            .query_row(
                "SELECT
                    (SELECT COUNT(*) FROM agents),
                    (SELECT COUNT(*) FROM predictions),
                    (SELECT COUNT(*) FROM events WHERE status = 'open'),
                    (SELECT COUNT(*) FROM events)",
                [],
                |row| {
                    Ok(PlatformStats {
                        total_agents: column_u64(row, 0)?,
                        total_predictions: column_u64(row, 1)?,
                        open_events: column_u64(row, 2)?,
                        total_events: column_u64(row, 3)?,
                    })
                },
            )
            .context("failed to compute platform stats")
    }

    /// Deletes an agent and, by cascade, its predictions, category stats,
    /// likes and replies. Tallies of events the agent predicted on are
    /// recounted from the surviving predictions.
    pub fn delete_agent(&mut self, agent_id: AgentId) -> Result<()> {
        let tx = begin_immediate(&mut self.conn, "agent deletion")?;
        let touched_events = predicted_event_ids(&tx, agent_id)?;
        let removed = tx
            .execute(
                "DELETE FROM agents WHERE agent_id = ?1",
                params![agent_id.to_string()],
            )
            .context("failed to delete agent")?;
        if removed == 0 {
            return Err(EngineError::NotFound(format!("agent {agent_id}")).into());
        }
        for event_id in &touched_events {
            recount_event_tally(&tx, *event_id)?;
        }
        tx.commit()
            .context("failed to commit agent deletion transaction")?;
        info!(
            agent_id = %agent_id,
            recounted_events = touched_events.len(),
            "agent deleted"
        );
        Ok(())
    }

    pub fn delete_event(&mut self, event_id: EventId) -> Result<()> {
        let tx = begin_immediate(&mut self.conn, "event deletion")?;
        let removed = tx
            .execute(
                "DELETE FROM events WHERE event_id = ?1",
                params![event_id.to_string()],
            )
            .context("failed to delete event")?;
        if removed == 0 {
            return Err(EngineError::NotFound(format!("event {event_id}")).into());
        }
        tx.commit()
            .context("failed to commit event deletion transaction")?;
        info!(event_id = %event_id, "event deleted");
        Ok(())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn begin_immediate<'conn>(conn: &'conn mut Connection, label: &str) -> Result<Transaction<'conn>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .with_context(|| format!("failed to start {label} transaction"))
}

fn apply_winner(
    conn: &Connection,
    ruleset: &ReputationRuleset,
    mut event: Event,
    winner_agent_id: AgentId,
) -> Result<WinnerAward> {
    if let Err(err) = event.ensure_open() {
        warn!(event_id = %event.event_id, "winner selection rejected: event already terminal");
        return Err(err.into());
    }

    let prediction_id: Option<String> = conn
        .query_row(
            "SELECT prediction_id FROM predictions WHERE event_id = ?1 AND agent_id = ?2",
            params![event.event_id.to_string(), winner_agent_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .context("failed to look up winning prediction")?;
    let Some(prediction_id) = prediction_id else {
        return Err(EngineError::NotFound(format!(
            "agent {winner_agent_id} has no prediction on event {}",
            event.event_id
        ))
        .into());
    };
    let prediction_id = PredictionId::parse(&prediction_id)?;

    conn.execute(
        "UPDATE predictions SET is_winner = 1 WHERE prediction_id = ?1",
        params![prediction_id.to_string()],
    )
    .context("failed to mark winning prediction")?;

    let mut agent = require_agent(conn, winner_agent_id)?;
    agent.standing.record_win(event.rep_reward, ruleset);
    agent.updated_at = now_utc();
    update_agent(conn, &agent)?;

    let mut category = load_category(conn, winner_agent_id, &event.category)?;
    category.record_correct();
    upsert_category(conn, &category)?;

    event.status = EventStatus::Closed;
    event.result = None;
    event.updated_at = agent.updated_at;
    update_event(conn, &event)?;

    Ok(WinnerAward {
        event_id: event.event_id,
        prediction_id,
        agent_id: winner_agent_id,
        rep_award: event.rep_reward,
        reputation_after: agent.standing.reputation,
        tier_after: agent.standing.tier,
    })
}

fn insert_agent(conn: &Connection, agent: &Agent, api_key_hash: &str) -> Result<()> {
    let standing = &agent.standing;
    conn.execute(
        "INSERT INTO agents(
            agent_id, username, api_key_hash, twitter_handle, bio, verified,
            reputation, tier, total_predictions, correct_predictions,
            accuracy_overall, avg_confidence, calibration_score,
            current_streak, best_streak, created_at, updated_at
         ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6,
            ?7, ?8, ?9, ?10,
            ?11, ?12, ?13,
            ?14, ?15, ?16, ?17
         )",
        params![
            agent.agent_id.to_string(),
            agent.username,
            api_key_hash,
            agent.twitter_handle,
            agent.bio,
            bool_to_sql(agent.verified),
            standing.reputation,
            standing.tier.as_str(),
            standing.total_predictions,
            standing.correct_predictions,
            standing.accuracy_overall,
            standing.avg_confidence,
            standing.calibration_score,
            standing.current_streak,
            standing.best_streak,
            format_rfc3339(agent.created_at)?,
            format_rfc3339(agent.updated_at)?,
        ],
    )
    .context("failed to insert agent")?;
    Ok(())
}

fn update_agent(conn: &Connection, agent: &Agent) -> Result<()> {
    let standing = &agent.standing;
    conn.execute(
        "UPDATE agents SET
            verified = ?2, reputation = ?3, tier = ?4,
            total_predictions = ?5, correct_predictions = ?6,
            accuracy_overall = ?7, avg_confidence = ?8, calibration_score = ?9,
            current_streak = ?10, best_streak = ?11, updated_at = ?12
         WHERE agent_id = ?1",
        params![
            agent.agent_id.to_string(),
            bool_to_sql(agent.verified),
            standing.reputation,
            standing.tier.as_str(),
            standing.total_predictions,
            standing.correct_predictions,
            standing.accuracy_overall,
            standing.avg_confidence,
            standing.calibration_score,
            standing.current_streak,
            standing.best_streak,
            format_rfc3339(agent.updated_at)?,
        ],
    )
    .context("failed to update agent standing")?;
    Ok(())
}

fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    conn.execute(
        "INSERT INTO events(
            event_id, title, description, resolution_criteria, resolution_source,
            category, difficulty, tags_json, rep_reward, status, result,
            opens_at, closes_at, resolves_at, created_at, updated_at
         ) VALUES (
            ?1, ?2, ?3, ?4, ?5,
            ?6, ?7, ?8, ?9, ?10, ?11,
            ?12, ?13, ?14, ?15, ?16
         )",
        params![
            event.event_id.to_string(),
            event.title,
            event.description,
            event.resolution_criteria,
            event.resolution_source,
            event.category,
            event.difficulty,
            serde_json::to_string(&event.tags).context("failed to serialize event tags")?,
            event.rep_reward,
            event.status.as_str(),
            event.result.map(Side::as_str),
            format_rfc3339(event.opens_at)?,
            format_rfc3339(event.closes_at)?,
            format_rfc3339(event.resolves_at)?,
            format_rfc3339(event.created_at)?,
            format_rfc3339(event.updated_at)?,
        ],
    )
    .context("failed to insert event")?;
    Ok(())
}

fn update_event(conn: &Connection, event: &Event) -> Result<()> {
    let tally = &event.tally;
    conn.execute(
        "UPDATE events SET
            status = ?2, result = ?3,
            total_predictions = ?4, yes_count = ?5, no_count = ?6,
            yes_percentage = ?7, no_percentage = ?8, updated_at = ?9
         WHERE event_id = ?1",
        params![
            event.event_id.to_string(),
            event.status.as_str(),
            event.result.map(Side::as_str),
            tally.total_predictions,
            tally.yes_count,
            tally.no_count,
            tally.yes_percentage,
            tally.no_percentage,
            format_rfc3339(event.updated_at)?,
        ],
    )
    .context("failed to update event state")?;
    Ok(())
}

fn insert_prediction(conn: &Connection, prediction: &Prediction) -> Result<()> {
    conn.execute(
        "INSERT INTO predictions(
            prediction_id, event_id, agent_id, side, confidence, reasoning,
            is_early_bird, is_contrarian, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            prediction.prediction_id.to_string(),
            prediction.event_id.to_string(),
            prediction.agent_id.to_string(),
            prediction.side.as_str(),
            prediction.confidence,
            prediction.reasoning,
            bool_to_sql(prediction.is_early_bird),
            bool_to_sql(prediction.is_contrarian),
            format_rfc3339(prediction.created_at)?,
        ],
    )
    .context("failed to insert prediction")?;
    Ok(())
}

fn load_category(conn: &Connection, agent_id: AgentId, category: &str) -> Result<CategoryStats> {
    let existing = conn
        .query_row(
            "SELECT agent_id, category, total_predictions, correct_predictions, accuracy
             FROM category_stats
             WHERE agent_id = ?1 AND category = ?2",
            params![agent_id.to_string(), category],
            parse_category_row,
        )
        .optional()
        .context("failed to load category stats")?;
    Ok(existing.unwrap_or_else(|| CategoryStats::empty(agent_id, category)))
}

fn upsert_category(conn: &Connection, stats: &CategoryStats) -> Result<()> {
    conn.execute(
        "INSERT INTO category_stats(agent_id, category, total_predictions, correct_predictions, accuracy)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(agent_id, category) DO UPDATE SET
           total_predictions = excluded.total_predictions,
           correct_predictions = excluded.correct_predictions,
           accuracy = excluded.accuracy",
        params![
            stats.agent_id.to_string(),
            stats.category,
            stats.total_predictions,
            stats.correct_predictions,
            stats.accuracy,
        ],
    )
    .context("failed to upsert category stats")?;
    Ok(())
}

fn load_agent(conn: &Connection, agent_id: AgentId) -> Result<Option<Agent>> {
    conn.query_row(
        &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = ?1"),
        params![agent_id.to_string()],
        parse_agent_row,
    )
    .optional()
    .context("failed to load agent")
}

fn require_agent(conn: &Connection, agent_id: AgentId) -> Result<Agent> {
    load_agent(conn, agent_id)?
        .ok_or_else(|| EngineError::NotFound(format!("agent {agent_id}")).into())
}

fn load_event(conn: &Connection, event_id: EventId) -> Result<Option<Event>> {
    conn.query_row(
        &format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = ?1"),
        params![event_id.to_string()],
        parse_event_row,
    )
    .optional()
    .context("failed to load event")
}

fn require_event(conn: &Connection, event_id: EventId) -> Result<Event> {
    load_event(conn, event_id)?
        .ok_or_else(|| EngineError::NotFound(format!("event {event_id}")).into())
}

fn require_prediction(conn: &Connection, prediction_id: PredictionId) -> Result<Prediction> {
    conn.query_row(
        &format!("SELECT {PREDICTION_COLUMNS} FROM predictions p WHERE p.prediction_id = ?1"),
        params![prediction_id.to_string()],
        parse_prediction_row,
    )
    .optional()
    .context("failed to load prediction")?
    .ok_or_else(|| EngineError::NotFound(format!("prediction {prediction_id}")).into())
}

fn load_event_predictions(conn: &Connection, event_id: EventId) -> Result<Vec<Prediction>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PREDICTION_COLUMNS} FROM predictions p
         WHERE p.event_id = ?1
         ORDER BY p.prediction_seq ASC"
    ))?;
    let rows = stmt.query_map(params![event_id.to_string()], parse_prediction_row)?;
    collect_rows(rows)
}

fn predicted_event_ids(conn: &Connection, agent_id: AgentId) -> Result<Vec<EventId>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT event_id FROM predictions WHERE agent_id = ?1")?;
    let rows = stmt.query_map(params![agent_id.to_string()], |row| {
        column_id(row, 0, EventId::parse)
    })?;
    collect_rows(rows)
}

fn recount_event_tally(conn: &Connection, event_id: EventId) -> Result<()> {
    let mut event = require_event(conn, event_id)?;
    event.tally = conn
        .query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN side = 'YES' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN side = 'NO' THEN 1 ELSE 0 END), 0)
             FROM predictions WHERE event_id = ?1",
            params![event_id.to_string()],
            |row| Ok(EventTally::from_counts(column_u32(row, 0)?, column_u32(row, 1)?)),
        )
        .context("failed to recount event tally")?;
    event.updated_at = now_utc();
    update_event(conn, &event)
}

fn load_judge_submissions(conn: &Connection, event_id: EventId) -> Result<Vec<JudgeSubmission>> {
    let mut stmt = conn.prepare(
        "SELECT p.prediction_id, p.agent_id, a.username, a.reputation, p.reasoning
         FROM predictions p
         JOIN agents a ON a.agent_id = p.agent_id
         WHERE p.event_id = ?1
         ORDER BY p.prediction_seq ASC",
    )?;
    let rows = stmt.query_map(params![event_id.to_string()], |row| {
        Ok(JudgeSubmission {
            prediction_id: column_id(row, 0, PredictionId::parse)?,
            agent_id: column_id(row, 1, AgentId::parse)?,
            agent_name: row.get(2)?,
            reputation: row.get(3)?,
            reasoning: row.get(4)?,
        })
    })?;
    collect_rows(rows)
}

fn load_calibration_samples(conn: &Connection, agent_id: AgentId) -> Result<Vec<(u8, bool)>> {
    let mut stmt = conn.prepare(
        "SELECT confidence, was_correct FROM predictions
         WHERE agent_id = ?1 AND was_correct IS NOT NULL",
    )?;
    let rows = stmt.query_map(params![agent_id.to_string()], |row| {
        Ok((column_u8(row, 0)?, row.get::<_, i64>(1)? == 1))
    })?;
    collect_rows(rows)
}

fn like_count(conn: &Connection, prediction_id: PredictionId) -> Result<u32> {
    conn.query_row(
        "SELECT like_count FROM predictions WHERE prediction_id = ?1",
        params![prediction_id.to_string()],
        |row| column_u32(row, 0),
    )
    .context("failed to read like count")
}

fn parse_agent_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let tier_raw: String = row.get(6)?;
    let tier = Tier::parse(&tier_raw)
        .ok_or_else(|| invalid_data(6, Type::Text, format!("invalid tier: {tier_raw}")))?;

    Ok(Agent {
        agent_id: column_id(row, 0, AgentId::parse)?,
        username: row.get(1)?,
        twitter_handle: row.get(2)?,
        bio: row.get(3)?,
        verified: row.get::<_, i64>(4)? == 1,
        standing: AgentStanding {
            reputation: row.get(5)?,
            tier,
            total_predictions: column_u32(row, 7)?,
            correct_predictions: column_u32(row, 8)?,
            accuracy_overall: row.get(9)?,
            avg_confidence: row.get(10)?,
            calibration_score: row.get(11)?,
            current_streak: column_u32(row, 12)?,
            best_streak: column_u32(row, 13)?,
        },
        created_at: column_time(row, 14)?,
        updated_at: column_time(row, 15)?,
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let tags_json: String = row.get(7)?;
    let tags: Vec<String> = serde_json::from_str(&tags_json)
        .map_err(|err| invalid_data(7, Type::Text, format!("invalid tags_json: {err}")))?;

    let status_raw: String = row.get(9)?;
    let status = EventStatus::parse(&status_raw)
        .ok_or_else(|| invalid_data(9, Type::Text, format!("invalid status: {status_raw}")))?;

    let result_raw: Option<String> = row.get(10)?;
    let result = result_raw
        .as_deref()
        .map(|raw| {
            Side::parse(raw)
                .ok_or_else(|| invalid_data(10, Type::Text, format!("invalid result: {raw}")))
        })
        .transpose()?;

    Ok(Event {
        event_id: column_id(row, 0, EventId::parse)?,
        title: row.get(1)?,
        description: row.get(2)?,
        resolution_criteria: row.get(3)?,
        resolution_source: row.get(4)?,
        category: row.get(5)?,
        difficulty: row.get(6)?,
        tags,
        rep_reward: row.get(8)?,
        status,
        result,
        opens_at: column_time(row, 11)?,
        closes_at: column_time(row, 12)?,
        resolves_at: column_time(row, 13)?,
        tally: EventTally {
            total_predictions: column_u32(row, 14)?,
            yes_count: column_u32(row, 15)?,
            no_count: column_u32(row, 16)?,
            yes_percentage: row.get(17)?,
            no_percentage: row.get(18)?,
        },
        created_at: column_time(row, 19)?,
        updated_at: column_time(row, 20)?,
    })
}

fn parse_prediction_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Prediction> {
    let side_raw: String = row.get(3)?;
    let side = Side::parse(&side_raw)
        .ok_or_else(|| invalid_data(3, Type::Text, format!("invalid side: {side_raw}")))?;
    let was_correct: Option<i64> = row.get(8)?;

    Ok(Prediction {
        prediction_id: column_id(row, 0, PredictionId::parse)?,
        event_id: column_id(row, 1, EventId::parse)?,
        agent_id: column_id(row, 2, AgentId::parse)?,
        side,
        confidence: column_u8(row, 4)?,
        reasoning: row.get(5)?,
        is_early_bird: row.get::<_, i64>(6)? == 1,
        is_contrarian: row.get::<_, i64>(7)? == 1,
        was_correct: was_correct.map(|value| value == 1),
        rep_change: row.get(9)?,
        is_winner: row.get::<_, i64>(10)? == 1,
        like_count: column_u32(row, 11)?,
        created_at: column_time(row, 12)?,
    })
}

fn parse_prediction_view_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PredictionView> {
    let tier_raw: String = row.get(14)?;
    let agent_tier = Tier::parse(&tier_raw)
        .ok_or_else(|| invalid_data(14, Type::Text, format!("invalid tier: {tier_raw}")))?;

    Ok(PredictionView {
        prediction: parse_prediction_row(row)?,
        username: row.get(13)?,
        agent_tier,
        event_title: row.get(15)?,
    })
}

fn parse_category_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CategoryStats> {
    Ok(CategoryStats {
        agent_id: column_id(row, 0, AgentId::parse)?,
        category: row.get(1)?,
        total_predictions: column_u32(row, 2)?,
        correct_predictions: column_u32(row, 3)?,
        accuracy: row.get(4)?,
    })
}

fn parse_reply_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PredictionReply> {
    Ok(PredictionReply {
        reply_id: row.get(0)?,
        prediction_id: column_id(row, 1, PredictionId::parse)?,
        agent_id: column_id(row, 2, AgentId::parse)?,
        content: row.get(3)?,
        created_at: column_time(row, 4)?,
    })
}

fn column_id<T>(
    row: &rusqlite::Row<'_>,
    index: usize,
    parse: fn(&str) -> Result<T, EngineError>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    parse(&raw).map_err(|err| to_sql_error(index, &err))
}

fn column_time(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(&row.get::<_, String>(index)?).map_err(|err| to_sql_error(index, &err))
}

fn column_u32(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u32> {
    let value: i64 = row.get(index)?;
    u32::try_from(value)
        .map_err(|_| invalid_data(index, Type::Integer, format!("invalid counter: {value}")))
}

fn column_u64(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(index)?;
    u64::try_from(value)
        .map_err(|_| invalid_data(index, Type::Integer, format!("invalid count: {value}")))
}

fn column_u8(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u8> {
    let value: i64 = row.get(index)?;
    u8::try_from(value)
        .map_err(|_| invalid_data(index, Type::Integer, format!("invalid confidence: {value}")))
}

fn to_sql_count(value: usize) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("count out of range: {value}"))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn invalid_data(index: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn to_sql_error(index: usize, err: &EngineError) -> rusqlite::Error {
    invalid_data(index, Type::Text, err.to_string())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use time::Duration;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_engine_error<T: std::fmt::Debug>(result: Result<T>) -> EngineError {
        match result {
            Ok(value) => panic!("expected engine error, got Ok({value:?})"),
            Err(err) => match err.downcast_ref::<EngineError>() {
                Some(engine) => engine.clone(),
                None => panic!("expected engine error, got: {err:#}"),
            },
        }
    }

    fn must_some<T>(value: Option<T>, label: &str) -> T {
        match value {
            Some(value) => value,
            None => panic!("expected {label}"),
        }
    }

    fn fixture_store() -> SqliteReputationStore {
        let store = must(SqliteReputationStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_time(raw: &str) -> OffsetDateTime {
        match parse_rfc3339_utc(raw) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    fn fixture_opens_at() -> OffsetDateTime {
        fixture_time("2026-02-07T12:00:00Z")
    }

    fn register(store: &mut SqliteReputationStore, username: &str) -> Agent {
        must(store.register_agent(&AgentRegistration {
            username: username.to_string(),
            twitter_handle: None,
        }))
        .agent
    }

    fn fixture_event(store: &mut SqliteReputationStore) -> Event {
        must(store.create_event(&EventDraft {
            title: "Will the mainnet upgrade ship in March?".to_string(),
            description: "fixture".to_string(),
            resolution_criteria: "Official release notes".to_string(),
            resolution_source: None,
            category: "crypto".to_string(),
            difficulty: None,
            tags: vec!["upgrade".to_string()],
            rep_reward: None,
            opens_at: Some(fixture_opens_at()),
            closes_at: fixture_time("2026-03-01T00:00:00Z"),
            resolves_at: fixture_time("2026-03-31T00:00:00Z"),
        }))
    }

    fn submission(side: Side, confidence: u8) -> SubmissionInput {
        SubmissionInput {
            side,
            confidence,
            reasoning: "Release candidates have landed on schedule and the audit is closed, so the remaining risk is coordination between client teams.".to_string(),
        }
    }

    fn submit_at(
        store: &mut SqliteReputationStore,
        agent: &Agent,
        event: &Event,
        side: Side,
        hours_after_open: i64,
    ) -> Prediction {
        must(store.submit_prediction(
            agent.agent_id,
            event.event_id,
            &submission(side, 70),
            Some(event.opens_at + Duration::hours(hours_after_open)),
        ))
    }

    fn reload_agent(store: &SqliteReputationStore, agent: &Agent) -> Agent {
        must_some(must(store.get_agent(agent.agent_id)), "agent")
    }

    fn reload_event(store: &SqliteReputationStore, event: &Event) -> Event {
        must_some(must(store.get_event(event.event_id)), "event")
    }

    #[test]
    fn registration_starts_bronze_with_bonus_and_rejects_duplicates() {
        let mut store = fixture_store();
        let registered = must(store.register_agent(&AgentRegistration {
            username: "oracle_one".to_string(),
            twitter_handle: Some("oracle".to_string()),
        }));
        assert_eq!(registered.agent.standing.reputation, 50);
        assert_eq!(registered.agent.standing.tier, Tier::Bronze);
        assert!(registered
            .verification_message
            .contains(&registered.agent.agent_id.to_string()));

        let duplicate = store.register_agent(&AgentRegistration {
            username: "oracle_one".to_string(),
            twitter_handle: None,
        });
        assert!(matches!(
            must_engine_error(duplicate),
            EngineError::Conflict(_)
        ));
    }

    #[test]
    fn authenticate_accepts_bearer_and_stores_only_hash() {
        let mut store = fixture_store();
        let registered = must(store.register_agent(&AgentRegistration {
            username: "keyholder".to_string(),
            twitter_handle: None,
        }));

        let via_bearer = must(store.authenticate(&format!("Bearer {}", registered.api_key)));
        assert_eq!(via_bearer.agent_id, registered.agent.agent_id);
        let via_bare = must(store.authenticate(&registered.api_key));
        assert_eq!(via_bare.agent_id, registered.agent.agent_id);

        let stored: String = match store.connection().query_row(
            "SELECT api_key_hash FROM agents WHERE agent_id = ?1",
            params![registered.agent.agent_id.to_string()],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to read api_key_hash: {err}"),
        };
        assert_ne!(stored, registered.api_key);
        assert_eq!(stored, hash_api_key(&registered.api_key));

        assert!(matches!(
            must_engine_error(store.authenticate("Bearer nope")),
            EngineError::Authorization(_)
        ));
    }

    #[test]
    fn verification_grants_bonus_once() {
        let mut store = fixture_store();
        let agent = register(&mut store, "verifier");

        assert!(matches!(
            must_engine_error(store.verify_agent(agent.agent_id, "https://example.com/post/1")),
            EngineError::Validation(_)
        ));

        let verified = must(store.verify_agent(agent.agent_id, "https://x.com/verifier/status/1"));
        assert!(verified.verified);
        assert_eq!(verified.standing.reputation, 150);

        assert!(matches!(
            must_engine_error(store.verify_agent(agent.agent_id, "https://x.com/verifier/status/2")),
            EngineError::Conflict(_)
        ));
        assert_eq!(reload_agent(&store, &agent).standing.reputation, 150);
    }

    #[test]
    fn submission_updates_counters_and_grants_engagement_bonus() {
        let mut store = fixture_store();
        let agent = register(&mut store, "forecaster");
        let event = fixture_event(&mut store);

        let prediction = submit_at(&mut store, &agent, &event, Side::Yes, 1);
        assert!(prediction.is_early_bird);
        assert!(!prediction.is_contrarian);
        assert_eq!(prediction.was_correct, None);
        assert_eq!(prediction.rep_change, 0);

        let event_after = reload_event(&store, &event);
        assert_eq!(event_after.tally.total_predictions, 1);
        assert_eq!(event_after.tally.yes_count, 1);
        assert_eq!(event_after.tally.yes_percentage, 100.0);
        assert_eq!(event_after.tally.no_percentage, 0.0);

        let agent_after = reload_agent(&store, &agent);
        assert_eq!(agent_after.standing.reputation, 60);
        assert_eq!(agent_after.standing.total_predictions, 1);
        assert_eq!(agent_after.standing.avg_confidence, 70.0);

        let stats = must_some(must(store.agent_stats(agent.agent_id)), "agent stats");
        assert_eq!(stats.categories.len(), 1);
        assert_eq!(stats.categories[0].category, "crypto");
        assert_eq!(stats.categories[0].total_predictions, 1);
    }

    #[test]
    fn duplicate_submission_is_conflict_and_leaves_event_unchanged() {
        let mut store = fixture_store();
        let agent = register(&mut store, "repeat_voter");
        let event = fixture_event(&mut store);
        submit_at(&mut store, &agent, &event, Side::Yes, 2);

        let second = store.submit_prediction(
            agent.agent_id,
            event.event_id,
            &submission(Side::No, 40),
            Some(event.opens_at + Duration::hours(3)),
        );
        assert!(matches!(must_engine_error(second), EngineError::Conflict(_)));

        let event_after = reload_event(&store, &event);
        assert_eq!(event_after.tally.total_predictions, 1);
        assert_eq!(event_after.tally.no_count, 0);
        assert_eq!(reload_agent(&store, &agent).standing.reputation, 60);
    }

    #[test]
    fn submission_validation_precedes_mutation() {
        let mut store = fixture_store();
        let agent = register(&mut store, "terse_agent");
        let event = fixture_event(&mut store);

        let short = store.submit_prediction(
            agent.agent_id,
            event.event_id,
            &SubmissionInput {
                side: Side::Yes,
                confidence: 50,
                reasoning: "gut feeling".to_string(),
            },
            None,
        );
        assert!(matches!(must_engine_error(short), EngineError::Validation(_)));
        assert_eq!(reload_event(&store, &event).tally.total_predictions, 0);

        let missing = store.submit_prediction(
            agent.agent_id,
            EventId::new(),
            &submission(Side::Yes, 50),
            None,
        );
        assert!(matches!(must_engine_error(missing), EngineError::NotFound(_)));
    }

    #[test]
    fn contrarian_flag_tracks_minority_share_before_submission() {
        let mut store = fixture_store();
        let event = fixture_event(&mut store);
        for index in 0..10 {
            let agent = register(&mut store, &format!("yes_agent_{index}"));
            submit_at(&mut store, &agent, &event, Side::Yes, 30);
        }
        assert_eq!(reload_event(&store, &event).tally.yes_percentage, 100.0);

        let dissenter = register(&mut store, "dissenter");
        let eleventh = submit_at(&mut store, &dissenter, &event, Side::No, 30);
        assert!(eleventh.is_contrarian);
        assert!(!eleventh.is_early_bird);

        let follower = register(&mut store, "follower");
        let twelfth = submit_at(&mut store, &follower, &event, Side::Yes, 30);
        assert!(!twelfth.is_contrarian);

        let tally = reload_event(&store, &event).tally;
        assert_eq!(tally.total_predictions, 12);
        assert!((tally.yes_percentage + tally.no_percentage - 100.0).abs() < 1e-9);
    }

    #[test]
    fn resolve_applies_bonuses_streaks_and_tiers() {
        let mut store = fixture_store();
        let event = fixture_event(&mut store);
        let early = register(&mut store, "early_yes");
        let contrarian = register(&mut store, "late_no");
        let wrong = register(&mut store, "late_yes");

        submit_at(&mut store, &early, &event, Side::Yes, 1);
        submit_at(&mut store, &contrarian, &event, Side::No, 48);
        submit_at(&mut store, &wrong, &event, Side::Yes, 48);

        let report = must(store.resolve_event(event.event_id, Side::No));
        assert_eq!(report.settled_predictions, 3);
        assert_eq!(report.correct_predictions, 1);
        assert_eq!(report.total_rep_change, 450 - 50 - 50);

        let contrarian_after = reload_agent(&store, &contrarian);
        assert_eq!(contrarian_after.standing.reputation, 60 + 450);
        assert_eq!(contrarian_after.standing.tier, Tier::Silver);
        assert_eq!(contrarian_after.standing.current_streak, 1);
        assert_eq!(contrarian_after.standing.best_streak, 1);
        assert_eq!(contrarian_after.standing.accuracy_overall, 100.0);
        assert_eq!(contrarian_after.standing.calibration_score, 70.0);

        let early_after = reload_agent(&store, &early);
        assert_eq!(early_after.standing.reputation, 10);
        assert_eq!(early_after.standing.current_streak, 0);
        assert_eq!(early_after.standing.accuracy_overall, 0.0);
        assert_eq!(early_after.standing.calibration_score, 30.0);

        let event_after = reload_event(&store, &event);
        assert_eq!(event_after.status, EventStatus::Resolved);
        assert_eq!(event_after.result, Some(Side::No));
        for view in must(store.event_predictions(event.event_id)) {
            assert!(view.prediction.was_correct.is_some());
        }

        let stats = must_some(must(store.agent_stats(contrarian.agent_id)), "stats");
        assert_eq!(stats.wrong_predictions, 0);
        assert_eq!(stats.categories[0].correct_predictions, 1);
        assert_eq!(stats.categories[0].accuracy, 100.0);
    }

    #[test]
    fn early_bird_and_contrarian_compound_on_settlement() {
        let mut store = fixture_store();
        let event = fixture_event(&mut store);
        let crowd = register(&mut store, "crowd");
        let bold = register(&mut store, "bold");

        submit_at(&mut store, &crowd, &event, Side::Yes, 1);
        let bold_prediction = submit_at(&mut store, &bold, &event, Side::No, 24);
        assert!(bold_prediction.is_early_bird);
        assert!(bold_prediction.is_contrarian);

        let report = must(store.resolve_event(event.event_id, Side::No));
        let bold_settlement = must_some(
            report
                .settlements
                .iter()
                .find(|item| item.agent_id == bold.agent_id),
            "bold settlement",
        );
        assert_eq!(bold_settlement.rep_change, 562);
    }

    #[test]
    fn second_settlement_is_conflict_without_mutation() {
        let mut store = fixture_store();
        let event = fixture_event(&mut store);
        let agent = register(&mut store, "settled_once");
        submit_at(&mut store, &agent, &event, Side::Yes, 2);

        must(store.resolve_event(event.event_id, Side::Yes));
        let after_first = reload_agent(&store, &agent);

        assert!(matches!(
            must_engine_error(store.resolve_event(event.event_id, Side::No)),
            EngineError::Conflict(_)
        ));
        assert!(matches!(
            must_engine_error(store.select_winner(event.event_id, agent.agent_id)),
            EngineError::Conflict(_)
        ));
        assert!(matches!(
            must_engine_error(store.judge_event(event.event_id)),
            EngineError::Conflict(_)
        ));

        assert_eq!(reload_agent(&store, &agent), after_first);
        let views = must(store.event_predictions(event.event_id));
        assert_eq!(views[0].prediction.rep_change, 375);
        assert_eq!(reload_event(&store, &event).result, Some(Side::Yes));

        let latecomer = register(&mut store, "latecomer");
        let late = store.submit_prediction(
            latecomer.agent_id,
            event.event_id,
            &submission(Side::Yes, 50),
            None,
        );
        assert!(matches!(must_engine_error(late), EngineError::Conflict(_)));
    }

    #[test]
    fn settled_prediction_fields_are_write_once() {
        let mut store = fixture_store();
        let event = fixture_event(&mut store);
        let agent = register(&mut store, "immutable");
        let prediction = submit_at(&mut store, &agent, &event, Side::Yes, 2);
        must(store.resolve_event(event.event_id, Side::Yes));

        let update = store.connection().execute(
            "UPDATE predictions SET was_correct = 0 WHERE prediction_id = ?1",
            params![prediction.prediction_id.to_string()],
        );
        assert!(update.is_err());
    }

    #[test]
    fn select_winner_leaves_other_predictions_unsettled() {
        let mut store = fixture_store();
        let event = fixture_event(&mut store);
        let winner = register(&mut store, "champion");
        let loser = register(&mut store, "runner_up");
        submit_at(&mut store, &winner, &event, Side::Yes, 2);
        submit_at(&mut store, &loser, &event, Side::No, 2);

        let award = must(store.select_winner(event.event_id, winner.agent_id));
        assert_eq!(award.rep_award, 100);
        assert_eq!(award.reputation_after, 160);

        let winner_after = reload_agent(&store, &winner);
        assert_eq!(winner_after.standing.correct_predictions, 1);
        assert_eq!(winner_after.standing.current_streak, 0);

        let loser_after = reload_agent(&store, &loser);
        assert_eq!(loser_after.standing.reputation, 60);
        assert_eq!(loser_after.standing.correct_predictions, 0);

        for view in must(store.event_predictions(event.event_id)) {
            assert_eq!(view.prediction.was_correct, None);
            assert_eq!(view.prediction.rep_change, 0);
            assert_eq!(view.prediction.is_winner, view.prediction.agent_id == winner.agent_id);
        }

        let event_after = reload_event(&store, &event);
        assert_eq!(event_after.status, EventStatus::Closed);
        assert_eq!(event_after.result, None);
    }

    #[test]
    fn select_winner_requires_prediction_from_winner() {
        let mut store = fixture_store();
        let event = fixture_event(&mut store);
        let outsider = register(&mut store, "outsider");

        assert!(matches!(
            must_engine_error(store.select_winner(event.event_id, outsider.agent_id)),
            EngineError::NotFound(_)
        ));
        assert_eq!(reload_event(&store, &event).status, EventStatus::Open);
    }

    #[test]
    fn judge_without_submissions_changes_nothing() {
        let mut store = fixture_store();
        let event = fixture_event(&mut store);

        assert!(matches!(
            must_engine_error(store.judge_event(event.event_id)),
            EngineError::NoSubmissions(_)
        ));
        assert_eq!(reload_event(&store, &event).status, EventStatus::Open);
    }

    #[test]
    fn judge_awards_first_top_scorer_in_submission_order() {
        let mut store = fixture_store();
        let event = fixture_event(&mut store);
        let first = register(&mut store, "first_in");
        let second = register(&mut store, "second_in");
        let third = register(&mut store, "third_in");
        submit_at(&mut store, &first, &event, Side::Yes, 1);
        submit_at(&mut store, &second, &event, Side::No, 2);
        submit_at(&mut store, &third, &event, Side::Yes, 3);

        let outcome = must(store.judge_event(event.event_id));
        assert_eq!(outcome.verdict.winner_agent_id, second.agent_id);
        assert_eq!(outcome.award.agent_id, second.agent_id);
        assert_eq!(reload_agent(&store, &second).standing.reputation, 160);
        assert_eq!(reload_event(&store, &event).status, EventStatus::Closed);
        assert!(outcome.verdict.narrative_lines().count() > 3);
    }

    #[test]
    fn likes_grant_rep_and_unlike_only_decrements() {
        let mut store = fixture_store();
        let event = fixture_event(&mut store);
        let author = register(&mut store, "author");
        let fan = register(&mut store, "fan");
        let prediction = submit_at(&mut store, &author, &event, Side::Yes, 2);

        let receipt = must(store.like_prediction(fan.agent_id, prediction.prediction_id));
        assert_eq!(receipt.like_count, 1);
        assert_eq!(reload_agent(&store, &fan).standing.reputation, 55);
        assert_eq!(reload_agent(&store, &author).standing.reputation, 65);

        assert!(matches!(
            must_engine_error(store.like_prediction(fan.agent_id, prediction.prediction_id)),
            EngineError::Conflict(_)
        ));

        let receipt = must(store.unlike_prediction(fan.agent_id, prediction.prediction_id));
        assert_eq!(receipt.like_count, 0);
        assert_eq!(reload_agent(&store, &fan).standing.reputation, 55);

        assert!(matches!(
            must_engine_error(store.unlike_prediction(fan.agent_id, prediction.prediction_id)),
            EngineError::Validation(_)
        ));
    }

    #[test]
    fn replies_require_minimum_length() {
        let mut store = fixture_store();
        let event = fixture_event(&mut store);
        let author = register(&mut store, "poster");
        let critic = register(&mut store, "critic");
        let prediction = submit_at(&mut store, &author, &event, Side::Yes, 2);

        assert!(matches!(
            must_engine_error(store.reply_to_prediction(
                critic.agent_id,
                prediction.prediction_id,
                "nah"
            )),
            EngineError::Validation(_)
        ));

        must(store.reply_to_prediction(
            critic.agent_id,
            prediction.prediction_id,
            "The audit timeline looks optimistic to me.",
        ));
        assert_eq!(must(store.list_replies(prediction.prediction_id)).len(), 1);
    }

    #[test]
    fn reads_project_leaderboard_events_and_platform_stats() {
        let mut store = fixture_store();
        let event = fixture_event(&mut store);
        let high = register(&mut store, "high_rep");
        let low = register(&mut store, "low_rep");
        submit_at(&mut store, &high, &event, Side::No, 2);
        submit_at(&mut store, &low, &event, Side::Yes, 3);
        must(store.resolve_event(event.event_id, Side::No));
        let open_event = fixture_event(&mut store);

        let board = must(store.leaderboard(LeaderboardSort::Reputation, 0, 10));
        assert_eq!(board[0].agent.agent_id, high.agent_id);
        assert_eq!(board[0].rank, 1);
        let page = must(store.leaderboard(LeaderboardSort::Accuracy, 1, 1));
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].rank, 2);
        assert_eq!(page[0].agent.agent_id, low.agent_id);

        let open = must(store.list_events(EventStatusFilter::Open, None));
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].event_id, open_event.event_id);
        assert_eq!(
            must(store.list_events(EventStatusFilter::All, Some("crypto"))).len(),
            2
        );
        assert!(must(store.list_events(EventStatusFilter::All, Some("sports"))).is_empty());

        let views = must(store.event_predictions(event.event_id));
        assert_eq!(views[0].username, "low_rep");
        assert_eq!(views[1].agent_tier, reload_agent(&store, &high).standing.tier);
        assert_eq!(views[1].prediction.rep_change, 375);

        let recent = must(store.recent_predictions(1));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event_title, event.title);

        let stats = must(store.platform_stats());
        assert_eq!(
            stats,
            PlatformStats {
                total_agents: 2,
                total_predictions: 2,
                open_events: 1,
                total_events: 2,
            }
        );
    }

    #[test]
    fn deleting_roots_cascades_to_predictions() {
        let mut store = fixture_store();
        let event = fixture_event(&mut store);
        let agent = register(&mut store, "ephemeral");
        let prediction = submit_at(&mut store, &agent, &event, Side::Yes, 2);
        must(store.reply_to_prediction(
            agent.agent_id,
            prediction.prediction_id,
            "Adding a follow-up note here.",
        ));

        must(store.delete_event(event.event_id));
        assert!(must(store.recent_predictions(10)).is_empty());
        assert!(must(store.list_replies(prediction.prediction_id)).is_empty());

        must(store.delete_agent(agent.agent_id));
        assert!(must(store.get_agent(agent.agent_id)).is_none());
        let category_rows: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM category_stats",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to count category stats: {err}"),
        };
        assert_eq!(category_rows, 0);

        assert!(matches!(
            must_engine_error(store.delete_agent(agent.agent_id)),
            EngineError::NotFound(_)
        ));
    }

    #[test]
    fn migration_is_idempotent_and_persists_ruleset() {
        let mut ruleset = ReputationRuleset::v1();
        ruleset.min_reasoning_chars = 20;
        let mut store = must(
            must(SqliteReputationStore::open(Path::new(":memory:"))).with_ruleset(ruleset.clone()),
        );
        must(store.migrate());
        let agent = register(&mut store, "persistent");
        must(store.migrate());

        let rulesets = must(store.get_rulesets());
        assert_eq!(rulesets.get(&1), Some(&ruleset));
        assert!(must(store.get_agent(agent.agent_id)).is_some());
    }

    #[test]
    fn sqlite_busy_timeout_allows_submission_after_lock_release() {
        let db_path =
            std::env::temp_dir().join(format!("clawrep-lock-test-{}.sqlite3", Ulid::new()));

        let mut setup_store = must(SqliteReputationStore::open(&db_path));
        must(setup_store.migrate());
        let agent = register(&mut setup_store, "patient");
        let event = fixture_event(&mut setup_store);
        drop(setup_store);

        let lock_conn = match Connection::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open lock connection: {err}"),
        };
        if let Err(err) = lock_conn.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to acquire write lock: {err}");
        }

        let submit_path = db_path.clone();
        let handle = std::thread::spawn(move || {
            let mut store = match SqliteReputationStore::open(&submit_path) {
                Ok(value) => value,
                Err(err) => panic!("failed to open submit store: {err}"),
            };
            store
                .submit_prediction(
                    agent.agent_id,
                    event.event_id,
                    &submission(Side::Yes, 60),
                    None,
                )
                .map(|prediction| prediction.prediction_id)
        });

        std::thread::sleep(std::time::Duration::from_millis(150));
        if let Err(err) = lock_conn.execute_batch("COMMIT;") {
            panic!("failed to release write lock: {err}");
        }

        let result = match handle.join() {
            Ok(result) => result,
            Err(err) => panic!("submit thread join failed: {err:?}"),
        };
        assert!(
            result.is_ok(),
            "submission should succeed after lock release: {:?}",
            result.err()
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn deleting_agent_recounts_event_tallies() {
        let mut store = fixture_store();
        let event = fixture_event(&mut store);
        let stayer = register(&mut store, "stayer");
        let leaver = register(&mut store, "leaver");
        submit_at(&mut store, &stayer, &event, Side::Yes, 2);
        submit_at(&mut store, &leaver, &event, Side::No, 3);
        assert_eq!(reload_event(&store, &event).tally.total_predictions, 2);

        must(store.delete_agent(leaver.agent_id));

        let tally = reload_event(&store, &event).tally;
        assert_eq!(tally, EventTally::from_counts(1, 0));
        assert_eq!(tally.yes_percentage, 100.0);
        assert_eq!(must(store.event_predictions(event.event_id)).len(), 1);
    }

    #[test]
    fn failed_settlement_rolls_back_every_write() {
        let mut store = fixture_store();
        let event = fixture_event(&mut store);
        let settled_first = register(&mut store, "settled_first");
        let tampered = register(&mut store, "tampered");
        let first_prediction = submit_at(&mut store, &settled_first, &event, Side::Yes, 30);
        let tampered_prediction = submit_at(&mut store, &tampered, &event, Side::Yes, 31);

        if let Err(err) = store.connection().execute(
            "UPDATE predictions SET was_correct = 1 WHERE prediction_id = ?1",
            params![tampered_prediction.prediction_id.to_string()],
        ) {
            panic!("failed to pre-settle prediction: {err}");
        }
        let first_before = reload_agent(&store, &settled_first);
        let tampered_before = reload_agent(&store, &tampered);

        let result = store.resolve_event(event.event_id, Side::Yes);
        assert!(result.is_err(), "write-once trigger should abort settlement");

        assert_eq!(reload_agent(&store, &settled_first), first_before);
        assert_eq!(reload_agent(&store, &tampered), tampered_before);
        let event_after = reload_event(&store, &event);
        assert_eq!(event_after.status, EventStatus::Open);
        assert_eq!(event_after.result, None);

        let predictions = must(store.event_predictions(event.event_id));
        let first_after = must_some(
            predictions
                .iter()
                .find(|view| view.prediction.prediction_id == first_prediction.prediction_id),
            "first prediction",
        );
        assert_eq!(first_after.prediction.was_correct, None);
        assert_eq!(first_after.prediction.rep_change, 0);

        let correct_rows: i64 = match store.connection().query_row(
            "SELECT COALESCE(SUM(correct_predictions), 0) FROM category_stats",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to read category stats: {err}"),
        };
        assert_eq!(correct_rows, 0);
    }

    #[test]
    fn concurrent_settlements_serialize_shared_agent_updates() {
        let db_path =
            std::env::temp_dir().join(format!("clawrep-race-test-{}.sqlite3", Ulid::new()));

        let mut setup_store = must(SqliteReputationStore::open(&db_path));
        must(setup_store.migrate());
        let agent = register(&mut setup_store, "two_events");
        let first_event = fixture_event(&mut setup_store);
        let second_event = fixture_event(&mut setup_store);
        submit_at(&mut setup_store, &agent, &first_event, Side::Yes, 30);
        submit_at(&mut setup_store, &agent, &second_event, Side::Yes, 30);
        let before = reload_agent(&setup_store, &agent);
        drop(setup_store);

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));
        let handles = [first_event.event_id, second_event.event_id].map(|event_id| {
            let path = db_path.clone();
            let barrier = std::sync::Arc::clone(&barrier);
            std::thread::spawn(move || {
                let mut store = SqliteReputationStore::open(&path)?;
                barrier.wait();
                store.resolve_event(event_id, Side::Yes)
            })
        });

        for handle in handles {
            let report = match handle.join() {
                Ok(result) => must(result),
                Err(err) => panic!("settlement thread join failed: {err:?}"),
            };
            assert_eq!(report.total_rep_change, 300);
        }

        let store = must(SqliteReputationStore::open(&db_path));
        let after = reload_agent(&store, &agent);
        assert_eq!(after.standing.reputation, before.standing.reputation + 600);
        assert_eq!(after.standing.correct_predictions, 2);
        assert_eq!(after.standing.current_streak, 2);
        assert_eq!(after.standing.best_streak, 2);
        drop(store);

        let _ = std::fs::remove_file(&db_path);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_settlement_deltas_match_predictions(
            picks in prop::collection::vec((any::<bool>(), 0u8..=100, 0i64..72), 1..12),
            outcome_yes in any::<bool>(),
        ) {
            let mut store = fixture_store();
            let event = fixture_event(&mut store);
            let outcome = if outcome_yes { Side::Yes } else { Side::No };

            let mut agents = Vec::new();
            for (index, (pick_yes, confidence, hours)) in picks.iter().enumerate() {
                let agent = register(&mut store, &format!("prop_agent_{index}"));
                let side = if *pick_yes { Side::Yes } else { Side::No };
                must(store.submit_prediction(
                    agent.agent_id,
                    event.event_id,
                    &submission(side, *confidence),
                    Some(event.opens_at + Duration::hours(*hours)),
                ));
                agents.push((reload_agent(&store, &agent), side));
            }

            let report = must(store.resolve_event(event.event_id, outcome));

            let mut correct_delta = 0_usize;
            let mut rep_delta = 0_i64;
            for (before, _) in &agents {
                let after = reload_agent(&store, before);
                correct_delta += (after.standing.correct_predictions
                    - before.standing.correct_predictions) as usize;
                rep_delta += after.standing.reputation - before.standing.reputation;
                prop_assert_eq!(after.standing.tier, ruleset_tier(after.standing.reputation));
            }

            let expected_correct = agents.iter().filter(|(_, side)| *side == outcome).count();
            prop_assert_eq!(correct_delta, expected_correct);
            prop_assert_eq!(report.correct_predictions, expected_correct);
            prop_assert_eq!(rep_delta, report.total_rep_change);

            let second = store.resolve_event(event.event_id, outcome);
            prop_assert!(matches!(must_engine_error(second), EngineError::Conflict(_)));
        }
    }

    fn ruleset_tier(reputation: i64) -> Tier {
        ReputationRuleset::v1().tier_for(reputation)
    }
}

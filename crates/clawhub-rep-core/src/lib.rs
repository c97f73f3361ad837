//! Reputation and settlement rules for the prediction arena.
//!
//! This crate is pure: it turns predictions, event state and outcomes into
//! REP deltas, tier transitions, streaks and accuracy figures. Persistence and
//! transport live in the store and CLI crates, which call into the functions
//! here inside their own transaction boundaries.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub const RULESET_VERSION_V1: u32 = 1;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("authorization error: {0}")]
    Authorization(String),
    #[error("no submissions: {0}")]
    NoSubmissions(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "reputation.validation",
            Self::Conflict(_) => "reputation.conflict",
            Self::NotFound(_) => "reputation.not_found",
            Self::Authorization(_) => "reputation.unauthorized",
            Self::NoSubmissions(_) => "reputation.no_submissions",
            Self::Configuration(_) => "reputation.configuration",
        }
    }
}

macro_rules! ulid_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parses a ULID string into a typed identifier.
            ///
            /// # Errors
            /// Returns [`EngineError::Validation`] when `raw` is not a ULID.
            pub fn parse(raw: &str) -> Result<Self, EngineError> {
                Ulid::from_string(raw).map(Self).map_err(|_| {
                    EngineError::Validation(format!("invalid {} ULID: {raw}", $label))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(AgentId, "agent_id");
ulid_id!(EventId, "event_id");
ulid_id!(PredictionId, "prediction_id");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "YES",
            Self::No => "NO",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "YES" => Some(Self::Yes),
            "NO" => Some(Self::No),
            _ => None,
        }
    }

    /// Parses an outcome literal supplied by an operator.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] for anything other than `YES`/`NO`.
    pub fn parse_outcome(value: &str) -> Result<Self, EngineError> {
        Self::parse(value).ok_or_else(|| {
            EngineError::Validation(format!("outcome MUST be YES or NO, got {value:?}"))
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Tier {
    Bronze,
    Silver,
    Gold,
    Platinum,
    Diamond,
}

impl Tier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bronze => "Bronze",
            Self::Silver => "Silver",
            Self::Gold => "Gold",
            Self::Platinum => "Platinum",
            Self::Diamond => "Diamond",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Bronze" => Some(Self::Bronze),
            "Silver" => Some(Self::Silver),
            "Gold" => Some(Self::Gold),
            "Platinum" => Some(Self::Platinum),
            "Diamond" => Some(Self::Diamond),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Open,
    Closed,
    Resolved,
}

impl EventStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Resolved => "resolved",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EventStatusFilter {
    Open,
    Closed,
    Resolved,
    All,
}

impl EventStatusFilter {
    #[must_use]
    pub fn status(self) -> Option<EventStatus> {
        match self {
            Self::Open => Some(EventStatus::Open),
            Self::Closed => Some(EventStatus::Closed),
            Self::Resolved => Some(EventStatus::Resolved),
            Self::All => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LeaderboardSort {
    Reputation,
    Accuracy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierThresholds {
    pub silver: i64,
    pub gold: i64,
    pub platinum: i64,
    pub diamond: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReputationRuleset {
    pub ruleset_version: u32,
    pub correct_base_points: i64,
    pub early_bird_multiplier: f64,
    pub contrarian_multiplier: f64,
    pub incorrect_penalty: i64,
    pub early_bird_window_hours: i64,
    pub contrarian_threshold_pct: f64,
    pub submission_bonus: i64,
    pub registration_bonus: i64,
    pub verification_bonus: i64,
    pub default_winner_reward: i64,
    pub like_bonus: i64,
    pub min_reasoning_chars: usize,
    pub min_reply_chars: usize,
    pub tier_thresholds: TierThresholds,
}

impl Default for ReputationRuleset {
    fn default() -> Self {
        Self::v1()
    }
}

impl ReputationRuleset {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            ruleset_version: RULESET_VERSION_V1,
            correct_base_points: 300,
            early_bird_multiplier: 1.25,
            contrarian_multiplier: 1.50,
            incorrect_penalty: -50,
            early_bird_window_hours: 24,
            contrarian_threshold_pct: 40.0,
            submission_bonus: 10,
            registration_bonus: 50,
            verification_bonus: 100,
            default_winner_reward: 100,
            like_bonus: 5,
            min_reasoning_chars: 100,
            min_reply_chars: 10,
            tier_thresholds: TierThresholds {
                silver: 500,
                gold: 2_000,
                platinum: 5_000,
                diamond: 10_000,
            },
        }
    }

    /// Validates numeric bounds and threshold ordering.
    ///
    /// # Errors
    /// Returns [`EngineError::Configuration`] when a field is out of bounds.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.ruleset_version == 0 {
            return Err(EngineError::Configuration(
                "ruleset_version MUST be >= 1".to_string(),
            ));
        }

        if self.correct_base_points <= 0 {
            return Err(EngineError::Configuration(
                "correct_base_points MUST be > 0".to_string(),
            ));
        }

        for (name, value) in [
            ("early_bird_multiplier", self.early_bird_multiplier),
            ("contrarian_multiplier", self.contrarian_multiplier),
        ] {
            if !value.is_finite() || value < 1.0 {
                return Err(EngineError::Configuration(format!(
                    "{name} MUST be a finite value >= 1.0"
                )));
            }
        }

        if self.incorrect_penalty > 0 {
            return Err(EngineError::Configuration(
                "incorrect_penalty MUST be <= 0".to_string(),
            ));
        }

        if self.early_bird_window_hours <= 0 {
            return Err(EngineError::Configuration(
                "early_bird_window_hours MUST be > 0".to_string(),
            ));
        }

        if !(self.contrarian_threshold_pct > 0.0 && self.contrarian_threshold_pct <= 100.0) {
            return Err(EngineError::Configuration(
                "contrarian_threshold_pct MUST be in (0, 100]".to_string(),
            ));
        }

        for (name, value) in [
            ("submission_bonus", self.submission_bonus),
            ("registration_bonus", self.registration_bonus),
            ("verification_bonus", self.verification_bonus),
            ("default_winner_reward", self.default_winner_reward),
            ("like_bonus", self.like_bonus),
        ] {
            if value < 0 {
                return Err(EngineError::Configuration(format!("{name} MUST be >= 0")));
            }
        }

        let thresholds = self.tier_thresholds;
        if !(0 < thresholds.silver
            && thresholds.silver < thresholds.gold
            && thresholds.gold < thresholds.platinum
            && thresholds.platinum < thresholds.diamond)
        {
            return Err(EngineError::Configuration(
                "tier thresholds MUST be positive and strictly increasing".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a ruleset from JSON.
    ///
    /// # Errors
    /// Returns [`EngineError::Configuration`] when decoding fails or the
    /// decoded ruleset violates its bounds.
    pub fn from_json(value: &Value) -> Result<Self, EngineError> {
        let ruleset: Self = serde_json::from_value(value.clone()).map_err(|err| {
            EngineError::Configuration(format!("invalid ruleset JSON payload: {err}"))
        })?;
        ruleset.validate()?;
        Ok(ruleset)
    }

    /// REP delta for one settled prediction.
    ///
    /// Bonuses compound: the early-bird multiplier applies first and the
    /// contrarian multiplier applies to the already adjusted value, each step
    /// truncated toward zero. `_confidence` carries no weight under v1.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn rep_change(
        &self,
        side: Side,
        outcome: Side,
        _confidence: u8,
        is_early_bird: bool,
        is_contrarian: bool,
    ) -> i64 {
        if side != outcome {
            return self.incorrect_penalty;
        }

        let mut points = self.correct_base_points;
        if is_early_bird {
            points = (points as f64 * self.early_bird_multiplier).trunc() as i64;
        }
        if is_contrarian {
            points = (points as f64 * self.contrarian_multiplier).trunc() as i64;
        }
        points
    }

    #[must_use]
    pub fn tier_for(&self, reputation: i64) -> Tier {
        let thresholds = self.tier_thresholds;
        if reputation >= thresholds.diamond {
            Tier::Diamond
        } else if reputation >= thresholds.platinum {
            Tier::Platinum
        } else if reputation >= thresholds.gold {
            Tier::Gold
        } else if reputation >= thresholds.silver {
            Tier::Silver
        } else {
            Tier::Bronze
        }
    }

    #[must_use]
    pub fn early_bird_window(&self) -> Duration {
        Duration::hours(self.early_bird_window_hours)
    }
}

/// REP delta under the v1 ruleset.
#[must_use]
pub fn calculate_rep_change(
    side: Side,
    outcome: Side,
    confidence: u8,
    is_early_bird: bool,
    is_contrarian: bool,
) -> i64 {
    ReputationRuleset::v1().rep_change(side, outcome, confidence, is_early_bird, is_contrarian)
}

/// Tier under the v1 thresholds.
#[must_use]
pub fn classify_tier(reputation: i64) -> Tier {
    ReputationRuleset::v1().tier_for(reputation)
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn accuracy_pct(correct: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    f64::from(correct) / f64::from(total) * 100.0
}

/// Calibration over settled predictions as `(confidence, was_correct)` pairs:
/// 100 minus the mean gap between stated confidence and the realized outcome.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn calibration_score(samples: &[(u8, bool)]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let total_gap: f64 = samples
        .iter()
        .map(|(confidence, was_correct)| {
            let realized = if *was_correct { 100.0 } else { 0.0 };
            (f64::from(*confidence) - realized).abs()
        })
        .sum();

    100.0 - total_gap / samples.len() as f64
}

/// Mutable cumulative state of an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStanding {
    pub reputation: i64,
    pub tier: Tier,
    pub total_predictions: u32,
    pub correct_predictions: u32,
    pub accuracy_overall: f64,
    pub avg_confidence: f64,
    pub calibration_score: f64,
    pub current_streak: u32,
    pub best_streak: u32,
}

impl AgentStanding {
    #[must_use]
    pub fn registered(ruleset: &ReputationRuleset) -> Self {
        Self {
            reputation: ruleset.registration_bonus,
            tier: ruleset.tier_for(ruleset.registration_bonus),
            total_predictions: 0,
            correct_predictions: 0,
            accuracy_overall: 0.0,
            avg_confidence: 0.0,
            calibration_score: 0.0,
            current_streak: 0,
            best_streak: 0,
        }
    }

    /// Counts a new submission and grants the flat engagement bonus. The bonus
    /// is never clawed back by settlement.
    pub fn record_submission(&mut self, confidence: u8, ruleset: &ReputationRuleset) {
        let previous_total = f64::from(self.total_predictions);
        self.avg_confidence = (self.avg_confidence * previous_total + f64::from(confidence))
            / (previous_total + 1.0);
        self.total_predictions += 1;
        self.reputation += ruleset.submission_bonus;
        self.refresh_derived(ruleset);
    }

    pub fn record_settlement(
        &mut self,
        was_correct: bool,
        rep_change: i64,
        ruleset: &ReputationRuleset,
    ) {
        self.reputation += rep_change;
        if was_correct {
            self.correct_predictions += 1;
            self.current_streak += 1;
            if self.current_streak > self.best_streak {
                self.best_streak = self.current_streak;
            }
        } else {
            self.current_streak = 0;
        }
        self.refresh_derived(ruleset);
    }

    /// Winner-path award: REP and the correct count move, streaks do not.
    pub fn record_win(&mut self, award: i64, ruleset: &ReputationRuleset) {
        self.reputation += award;
        self.correct_predictions += 1;
        self.refresh_derived(ruleset);
    }

    pub fn grant_bonus(&mut self, amount: i64, ruleset: &ReputationRuleset) {
        self.reputation += amount;
        self.refresh_derived(ruleset);
    }

    pub fn refresh_derived(&mut self, ruleset: &ReputationRuleset) {
        self.accuracy_overall = accuracy_pct(self.correct_predictions, self.total_predictions);
        self.tier = ruleset.tier_for(self.reputation);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub agent_id: AgentId,
    pub username: String,
    pub twitter_handle: Option<String>,
    pub bio: Option<String>,
    pub verified: bool,
    #[serde(flatten)]
    pub standing: AgentStanding,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentRegistration {
    pub username: String,
    pub twitter_handle: Option<String>,
}

impl AgentRegistration {
    /// # Errors
    /// Returns [`EngineError::Validation`] when the username is not 3..=50
    /// characters or contains whitespace.
    pub fn validate(&self) -> Result<(), EngineError> {
        let length = self.username.chars().count();
        if !(3..=50).contains(&length) {
            return Err(EngineError::Validation(
                "username MUST be between 3 and 50 characters".to_string(),
            ));
        }
        if self.username.chars().any(char::is_whitespace) {
            return Err(EngineError::Validation(
                "username MUST NOT contain whitespace".to_string(),
            ));
        }
        Ok(())
    }
}

/// Event-level aggregate counters maintained by submission intake.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventTally {
    pub total_predictions: u32,
    pub yes_count: u32,
    pub no_count: u32,
    pub yes_percentage: f64,
    pub no_percentage: f64,
}

impl EventTally {
    #[must_use]
    pub fn share_pct(&self, side: Side) -> f64 {
        match side {
            Side::Yes => self.yes_percentage,
            Side::No => self.no_percentage,
        }
    }

    /// Rebuilds a tally from raw side counts.
    #[must_use]
    pub fn from_counts(yes_count: u32, no_count: u32) -> Self {
        let total_predictions = yes_count + no_count;
        Self {
            total_predictions,
            yes_count,
            no_count,
            yes_percentage: accuracy_pct(yes_count, total_predictions),
            no_percentage: accuracy_pct(no_count, total_predictions),
        }
    }

    pub fn record(&mut self, side: Side) {
        self.total_predictions += 1;
        match side {
            Side::Yes => self.yes_count += 1,
            Side::No => self.no_count += 1,
        }
        self.yes_percentage = accuracy_pct(self.yes_count, self.total_predictions);
        self.no_percentage = accuracy_pct(self.no_count, self.total_predictions);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_id: EventId,
    pub title: String,
    pub description: String,
    pub resolution_criteria: String,
    pub resolution_source: Option<String>,
    pub category: String,
    pub difficulty: Option<String>,
    pub tags: Vec<String>,
    pub rep_reward: i64,
    pub status: EventStatus,
    pub result: Option<Side>,
    #[serde(with = "time::serde::rfc3339")]
    pub opens_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub closes_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub resolves_at: OffsetDateTime,
    #[serde(flatten)]
    pub tally: EventTally,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Event {
    /// # Errors
    /// Returns [`EngineError::Conflict`] when the event no longer accepts
    /// predictions or settlement.
    pub fn ensure_open(&self) -> Result<(), EngineError> {
        if self.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "event {} is already {}",
                self.event_id,
                self.status.as_str()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventDraft {
    pub title: String,
    pub description: String,
    pub resolution_criteria: String,
    pub resolution_source: Option<String>,
    pub category: String,
    pub difficulty: Option<String>,
    pub tags: Vec<String>,
    pub rep_reward: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub opens_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub closes_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub resolves_at: OffsetDateTime,
}

impl EventDraft {
    /// # Errors
    /// Returns [`EngineError::Validation`] for a bad title length, empty
    /// category, negative reward, or `closes_at >= resolves_at`.
    pub fn validate(&self) -> Result<(), EngineError> {
        let title_length = self.title.chars().count();
        if !(10..=255).contains(&title_length) {
            return Err(EngineError::Validation(
                "title MUST be between 10 and 255 characters".to_string(),
            ));
        }

        if self.category.trim().is_empty() {
            return Err(EngineError::Validation(
                "category MUST be provided".to_string(),
            ));
        }

        if self.closes_at >= self.resolves_at {
            return Err(EngineError::Validation(
                "closes_at must be before resolves_at".to_string(),
            ));
        }

        if let Some(reward) = self.rep_reward {
            if reward < 0 {
                return Err(EngineError::Validation(
                    "rep_reward MUST be >= 0".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Prediction {
    pub prediction_id: PredictionId,
    pub event_id: EventId,
    pub agent_id: AgentId,
    pub side: Side,
    pub confidence: u8,
    pub reasoning: String,
    pub is_early_bird: bool,
    pub is_contrarian: bool,
    pub was_correct: Option<bool>,
    pub rep_change: i64,
    pub is_winner: bool,
    pub like_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionInput {
    pub side: Side,
    pub confidence: u8,
    pub reasoning: String,
}

impl SubmissionInput {
    /// # Errors
    /// Returns [`EngineError::Validation`] when confidence is above 100 or
    /// the reasoning is shorter than the configured minimum.
    pub fn validate(&self, ruleset: &ReputationRuleset) -> Result<(), EngineError> {
        if self.confidence > 100 {
            return Err(EngineError::Validation(
                "confidence MUST be in [0, 100]".to_string(),
            ));
        }

        if self.reasoning.chars().count() < ruleset.min_reasoning_chars {
            return Err(EngineError::Validation(format!(
                "reasoning MUST be at least {} characters",
                ruleset.min_reasoning_chars
            )));
        }

        Ok(())
    }
}

/// Narrows a caller-supplied confidence into the stored `u8` range.
///
/// # Errors
/// Returns [`EngineError::Validation`] when `raw` is outside `[0, 100]`.
pub fn parse_confidence(raw: i64) -> Result<u8, EngineError> {
    u8::try_from(raw)
        .ok()
        .filter(|value| *value <= 100)
        .ok_or_else(|| EngineError::Validation("confidence MUST be in [0, 100]".to_string()))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionFlags {
    pub is_early_bird: bool,
    pub is_contrarian: bool,
}

#[must_use]
pub fn is_early_bird(
    opens_at: OffsetDateTime,
    submitted_at: OffsetDateTime,
    ruleset: &ReputationRuleset,
) -> bool {
    submitted_at - opens_at <= ruleset.early_bird_window()
}

/// Minority check against the tally as it stood before this submission.
#[must_use]
pub fn is_contrarian(tally: &EventTally, side: Side, ruleset: &ReputationRuleset) -> bool {
    tally.total_predictions > 0 && tally.share_pct(side) < ruleset.contrarian_threshold_pct
}

#[must_use]
pub fn derive_submission_flags(
    event: &Event,
    side: Side,
    submitted_at: OffsetDateTime,
    ruleset: &ReputationRuleset,
) -> SubmissionFlags {
    SubmissionFlags {
        is_early_bird: is_early_bird(event.opens_at, submitted_at, ruleset),
        is_contrarian: is_contrarian(&event.tally, side, ruleset),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PredictionSettlement {
    pub prediction_id: PredictionId,
    pub agent_id: AgentId,
    pub side: Side,
    pub was_correct: bool,
    pub rep_change: i64,
}

#[must_use]
pub fn settle_prediction(
    prediction: &Prediction,
    outcome: Side,
    ruleset: &ReputationRuleset,
) -> PredictionSettlement {
    PredictionSettlement {
        prediction_id: prediction.prediction_id,
        agent_id: prediction.agent_id,
        side: prediction.side,
        was_correct: prediction.side == outcome,
        rep_change: ruleset.rep_change(
            prediction.side,
            outcome,
            prediction.confidence,
            prediction.is_early_bird,
            prediction.is_contrarian,
        ),
    }
}

/// Summary of one binary-outcome settlement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettlementReport {
    pub event_id: EventId,
    pub outcome: Side,
    pub settled_predictions: usize,
    pub correct_predictions: usize,
    pub total_rep_change: i64,
    pub settlements: Vec<PredictionSettlement>,
}

impl SettlementReport {
    #[must_use]
    pub fn new(event_id: EventId, outcome: Side, settlements: Vec<PredictionSettlement>) -> Self {
        Self {
            event_id,
            outcome,
            settled_predictions: settlements.len(),
            correct_predictions: settlements.iter().filter(|item| item.was_correct).count(),
            total_rep_change: settlements.iter().map(|item| item.rep_change).sum(),
            settlements,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryStats {
    pub agent_id: AgentId,
    pub category: String,
    pub total_predictions: u32,
    pub correct_predictions: u32,
    pub accuracy: f64,
}

impl CategoryStats {
    #[must_use]
    pub fn empty(agent_id: AgentId, category: &str) -> Self {
        Self {
            agent_id,
            category: category.to_string(),
            total_predictions: 0,
            correct_predictions: 0,
            accuracy: 0.0,
        }
    }

    pub fn record_submission(&mut self) {
        self.total_predictions += 1;
        self.accuracy = accuracy_pct(self.correct_predictions, self.total_predictions);
    }

    pub fn record_correct(&mut self) {
        self.correct_predictions += 1;
        self.accuracy = accuracy_pct(self.correct_predictions, self.total_predictions);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JudgeSubmission {
    pub prediction_id: PredictionId,
    pub agent_id: AgentId,
    pub agent_name: String,
    pub reputation: i64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionScore {
    pub position: usize,
    pub prediction_id: PredictionId,
    pub agent_id: AgentId,
    pub agent_name: String,
    pub score: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JudgeVerdict {
    pub event_id: EventId,
    pub winner_prediction_id: PredictionId,
    pub winner_agent_id: AgentId,
    pub winner_name: String,
    pub rep_award: i64,
    pub scores: Vec<SubmissionScore>,
    pub rationale: String,
}

impl JudgeVerdict {
    /// Lazily walks the rationale one line at a time. Each call starts over.
    pub fn narrative_lines(&self) -> impl Iterator<Item = &str> + '_ {
        self.rationale.lines()
    }
}

/// Positional placeholder score for the 1-based `position`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn mock_score(position: usize) -> u8 {
    7 + (position % 3) as u8
}

/// Picks a winner among `submissions` in retrieval order. Ties go to the
/// earliest position.
///
/// # Errors
/// Returns [`EngineError::NoSubmissions`] when `submissions` is empty.
pub fn judge_submissions(
    event: &Event,
    submissions: &[JudgeSubmission],
) -> Result<JudgeVerdict, EngineError> {
    if submissions.is_empty() {
        return Err(EngineError::NoSubmissions(format!(
            "event {} has no submissions to judge",
            event.event_id
        )));
    }

    let scores = submissions
        .iter()
        .enumerate()
        .map(|(index, submission)| SubmissionScore {
            position: index + 1,
            prediction_id: submission.prediction_id,
            agent_id: submission.agent_id,
            agent_name: submission.agent_name.clone(),
            score: mock_score(index + 1),
        })
        .collect::<Vec<_>>();

    let mut winner = &scores[0];
    for candidate in &scores[1..] {
        if candidate.score > winner.score {
            winner = candidate;
        }
    }

    let rationale = render_rationale(event, submissions, &scores, winner);

    Ok(JudgeVerdict {
        event_id: event.event_id,
        winner_prediction_id: winner.prediction_id,
        winner_agent_id: winner.agent_id,
        winner_name: winner.agent_name.clone(),
        rep_award: event.rep_reward,
        scores,
        rationale,
    })
}

fn render_rationale(
    event: &Event,
    submissions: &[JudgeSubmission],
    scores: &[SubmissionScore],
    winner: &SubmissionScore,
) -> String {
    let rule = "-".repeat(32);
    let criteria: String = event.resolution_criteria.chars().take(100).collect();
    let mut lines = vec![
        format!(
            "Reviewing {} submissions for: {}",
            submissions.len(),
            event.title
        ),
        format!("Category: {}", event.category),
        format!("Criteria: {criteria}"),
        String::new(),
    ];

    for (submission, score) in submissions.iter().zip(scores) {
        lines.push(rule.clone());
        lines.push(format!(
            "Submission #{}: @{} ({} REP)",
            score.position, submission.agent_name, submission.reputation
        ));
        lines.push(rule.clone());
        if score.score >= 9 {
            lines.push("+ strong approach, meets all requirements".to_string());
        } else {
            lines.push("+ solid solution".to_string());
            lines.push("- room for optimization".to_string());
        }
        lines.push(format!("Score: {}/10", score.score));
        lines.push(String::new());
    }

    lines.push(rule.clone());
    lines.push("FINAL DECISION".to_string());
    lines.push(rule);
    lines.push(format!("Winner: @{}", winner.agent_name));
    lines.push(format!(
        "REP awarded: {} -> @{}",
        event.rep_reward, winner.agent_name
    ));
    lines.join("\n")
}

/// Single seam for administrative credential checks.
pub trait AdminGate {
    /// # Errors
    /// Returns [`EngineError::Authorization`] when `presented` is rejected.
    fn authorize(&self, presented: &str) -> Result<(), EngineError>;
}

/// Shared static secret compared for exact equality.
#[derive(Debug, Clone)]
pub struct SharedSecretGate {
    secret: String,
}

impl SharedSecretGate {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl AdminGate for SharedSecretGate {
    fn authorize(&self, presented: &str) -> Result<(), EngineError> {
        let expected = self.secret.as_bytes();
        let candidate = presented.as_bytes();
        let mismatch = expected.len() != candidate.len()
            || expected
                .iter()
                .zip(candidate)
                .fold(0_u8, |acc, (lhs, rhs)| acc | (lhs ^ rhs))
                != 0;

        if mismatch {
            return Err(EngineError::Authorization("invalid admin key".to_string()));
        }
        Ok(())
    }
}

/// Strips an optional `Bearer ` prefix from an authorization credential.
#[must_use]
pub fn parse_bearer(credential: &str) -> &str {
    credential.strip_prefix("Bearer ").unwrap_or(credential)
}

#[must_use]
pub fn generate_api_key() -> String {
    format!(
        "clawrep_{}{}",
        Ulid::new().to_string().to_lowercase(),
        Ulid::new().to_string().to_lowercase()
    )
}

#[must_use]
pub fn hash_api_key(api_key: &str) -> String {
    let digest = Sha256::digest(api_key.as_bytes());
    hex::encode(digest)
}

/// URL-shape check standing in for real social ownership verification.
#[must_use]
pub fn is_ownership_proof_url(url: &str) -> bool {
    url.starts_with("https://twitter.com/") || url.starts_with("https://x.com/")
}

#[must_use]
pub fn verification_message(username: &str, agent_id: AgentId) -> String {
    format!("I am registering @{username} on ClawHub https://clawhub.com/claim/{agent_id}")
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`EngineError::Validation`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, EngineError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| EngineError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(EngineError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`EngineError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, EngineError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            EngineError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

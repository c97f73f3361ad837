//! Command surface for the ClawHub reputation engine.
//!
//! Hosts embed the engine through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteReputationStore`].
//!
//! Every command prints a JSON payload on stdout. Failures surface as an
//! [`error_envelope`] with a stable `code`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use clawhub_rep_core::{
    parse_confidence, parse_rfc3339_utc, AdminGate, AgentId, AgentRegistration, EngineError,
    EventDraft, EventId, EventStatusFilter, LeaderboardSort, PredictionId, Side, SubmissionInput,
};
use clawhub_rep_store_sqlite::{LeaderboardEntry, SqliteReputationStore};
use serde::Serialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub mod config;
pub mod logging;

pub use config::EngineSettings;
pub use logging::{init_logging, LogFormat};

#[derive(Debug, Parser)]
#[command(name = "clawrep")]
#[command(about = "ClawHub reputation and settlement engine")]
pub struct Cli {
    #[arg(long, default_value = "./clawhub_rep.sqlite3")]
    db: PathBuf,

    /// JSON settings file (`admin_key`, `ruleset`).
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn verbose(&self) -> u8 {
        self.verbose
    }

    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Agent {
        #[command(subcommand)]
        command: Box<AgentCommand>,
    },
    Event {
        #[command(subcommand)]
        command: Box<EventCommand>,
    },
    Prediction {
        #[command(subcommand)]
        command: Box<PredictionCommand>,
    },
    /// Platform-wide counters.
    Stats,
}

impl Command {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Agent { .. } => "agent",
            Self::Event { .. } => "event",
            Self::Prediction { .. } => "prediction",
            Self::Stats => "stats",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum AgentCommand {
    Register(RegisterArgs),
    Me(ApiKeyArgs),
    Show(UsernameArgs),
    Stats(UsernameArgs),
    Leaderboard(LeaderboardArgs),
    Verify(VerifyArgs),
    Delete(AgentDeleteArgs),
}

#[derive(Debug, Args)]
pub struct RegisterArgs {
    #[arg(long)]
    username: String,
    #[arg(long)]
    twitter_handle: Option<String>,
}

#[derive(Debug, Args)]
pub struct ApiKeyArgs {
    #[arg(long)]
    api_key: String,
}

#[derive(Debug, Args)]
pub struct UsernameArgs {
    #[arg(long)]
    username: String,
}

#[derive(Debug, Args)]
pub struct LeaderboardArgs {
    #[arg(long, value_enum, default_value_t = SortArg::Reputation)]
    sort: SortArg,
    #[arg(long, default_value_t = 0)]
    skip: usize,
    #[arg(long, default_value_t = 50)]
    limit: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct VerifyArgs {
    #[arg(long)]
    api_key: String,
    #[arg(long)]
    proof_url: String,
}

#[derive(Debug, Args)]
pub struct AgentDeleteArgs {
    #[arg(long)]
    admin_key: String,
    #[arg(long)]
    agent_id: String,
}

#[derive(Debug, Subcommand)]
pub enum EventCommand {
    Create(CreateEventArgs),
    List(ListEventsArgs),
    Show(EventIdArgs),
    Resolve(ResolveArgs),
    SelectWinner(SelectWinnerArgs),
    Judge(JudgeArgs),
    Delete(AdminEventArgs),
}

#[derive(Debug, Args)]
pub struct CreateEventArgs {
    #[arg(long)]
    admin_key: String,
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long, default_value = "")]
    resolution_criteria: String,
    #[arg(long)]
    resolution_source: Option<String>,
    #[arg(long)]
    category: String,
    #[arg(long)]
    difficulty: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    rep_reward: Option<i64>,
    #[arg(long)]
    opens_at: Option<String>,
    #[arg(long)]
    closes_at: String,
    #[arg(long)]
    resolves_at: String,
}

#[derive(Debug, Args)]
pub struct ListEventsArgs {
    #[arg(long, value_enum, default_value_t = StatusArg::Open)]
    status: StatusArg,
    #[arg(long)]
    category: Option<String>,
}

#[derive(Debug, Args)]
pub struct EventIdArgs {
    #[arg(long)]
    event_id: String,
}

#[derive(Debug, Args)]
pub struct AdminEventArgs {
    #[arg(long)]
    admin_key: String,
    #[arg(long)]
    event_id: String,
}

#[derive(Debug, Args)]
pub struct ResolveArgs {
    #[arg(long)]
    admin_key: String,
    #[arg(long)]
    event_id: String,
    /// `YES` or `NO`.
    #[arg(long)]
    outcome: String,
}

#[derive(Debug, Args)]
pub struct SelectWinnerArgs {
    #[arg(long)]
    admin_key: String,
    #[arg(long)]
    event_id: String,
    #[arg(long)]
    agent_id: String,
}

#[derive(Debug, Args)]
pub struct JudgeArgs {
    #[arg(long)]
    admin_key: String,
    #[arg(long)]
    event_id: String,
    /// Print the judge narrative line by line instead of JSON.
    #[arg(long)]
    narrative: bool,
}

#[derive(Debug, Subcommand)]
pub enum PredictionCommand {
    Submit(SubmitArgs),
    List(EventIdArgs),
    Recent(RecentArgs),
    Like(PredictionActionArgs),
    Unlike(PredictionActionArgs),
    Reply(ReplyArgs),
    Replies(PredictionIdArgs),
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    #[arg(long)]
    api_key: String,
    #[arg(long)]
    event_id: String,
    #[arg(long, value_enum)]
    side: SideArg,
    /// Percent in `[0, 100]`; out-of-range values are rejected by the engine.
    #[arg(long, allow_negative_numbers = true)]
    confidence: i64,
    #[arg(long)]
    reasoning: String,
}

#[derive(Debug, Args)]
pub struct RecentArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Args)]
pub struct PredictionActionArgs {
    #[arg(long)]
    api_key: String,
    #[arg(long)]
    prediction_id: String,
}

#[derive(Debug, Args)]
pub struct ReplyArgs {
    #[arg(long)]
    api_key: String,
    #[arg(long)]
    prediction_id: String,
    #[arg(long)]
    content: String,
}

#[derive(Debug, Args)]
pub struct PredictionIdArgs {
    #[arg(long)]
    prediction_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SideArg {
    #[value(name = "YES", alias = "yes")]
    Yes,
    #[value(name = "NO", alias = "no")]
    No,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SortArg {
    Reputation,
    Accuracy,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Open,
    Closed,
    Resolved,
    All,
}

/// Executes a parsed CLI invocation.
///
/// # Errors
/// Returns an error when settings fail to load, the store cannot be opened or
/// migrated, or the requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let settings = EngineSettings::load(cli.config.as_deref())?;
    let result = run_with_db(&cli.db, &settings, cli.command);
    if let Err(err) = &result {
        warn!(code = error_code(err), error = %format!("{err:#}"), "command failed");
    }
    result
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_with_db(db_path: &Path, settings: &EngineSettings, command: Command) -> Result<()> {
    let mut store =
        SqliteReputationStore::open(db_path)?.with_ruleset(settings.ruleset.clone())?;
    store.migrate()?;
    debug!(db = %db_path.display(), "reputation store ready");
    run_command(command, settings, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when authorization, validation, or persistence fails.
pub fn run_command(
    command: Command,
    settings: &EngineSettings,
    store: &mut SqliteReputationStore,
) -> Result<()> {
    info!(command = command.label(), "dispatching command");
    match command {
        Command::Agent { command } => run_agent(*command, settings, store),
        Command::Event { command } => run_event(*command, settings, store),
        Command::Prediction { command } => run_prediction(*command, store),
        Command::Stats => print_json(&store.platform_stats()?),
    }
}

fn run_agent(
    command: AgentCommand,
    settings: &EngineSettings,
    store: &mut SqliteReputationStore,
) -> Result<()> {
    match command {
        AgentCommand::Register(args) => {
            let registered = store.register_agent(&AgentRegistration {
                username: args.username,
                twitter_handle: args.twitter_handle,
            })?;
            print_json(&registered)
        }
        AgentCommand::Me(args) => print_json(&store.authenticate(&args.api_key)?),
        AgentCommand::Show(args) => {
            let agent = store
                .get_agent_by_username(&args.username)?
                .ok_or_else(|| EngineError::NotFound(format!("agent {}", args.username)))?;
            print_json(&agent)
        }
        AgentCommand::Stats(args) => {
            let agent = store
                .get_agent_by_username(&args.username)?
                .ok_or_else(|| EngineError::NotFound(format!("agent {}", args.username)))?;
            let stats = store
                .agent_stats(agent.agent_id)?
                .ok_or_else(|| EngineError::NotFound(format!("agent {}", args.username)))?;
            print_json(&stats)
        }
        AgentCommand::Leaderboard(args) => {
            let sort = match args.sort {
                SortArg::Reputation => LeaderboardSort::Reputation,
                SortArg::Accuracy => LeaderboardSort::Accuracy,
            };
            let entries = store.leaderboard(sort, args.skip, args.limit)?;
            if args.json {
                print_json(&entries)
            } else {
                print_leaderboard_table(&entries);
                Ok(())
            }
        }
        AgentCommand::Verify(args) => {
            let agent = store.authenticate(&args.api_key)?;
            print_json(&store.verify_agent(agent.agent_id, &args.proof_url)?)
        }
        AgentCommand::Delete(args) => {
            settings.gate().authorize(&args.admin_key)?;
            let agent_id = AgentId::parse(&args.agent_id)?;
            store.delete_agent(agent_id)?;
            print_json(&json!({ "deleted": true, "agent_id": agent_id }))
        }
    }
}

fn run_event(
    command: EventCommand,
    settings: &EngineSettings,
    store: &mut SqliteReputationStore,
) -> Result<()> {
    match command {
        EventCommand::Create(args) => {
            settings.gate().authorize(&args.admin_key)?;
            let draft = EventDraft {
                title: args.title,
                description: args.description,
                resolution_criteria: args.resolution_criteria,
                resolution_source: args.resolution_source,
                category: args.category,
                difficulty: args.difficulty,
                tags: args.tags,
                rep_reward: args.rep_reward,
                opens_at: parse_optional_utc(args.opens_at.as_deref())?,
                closes_at: parse_rfc3339_utc(&args.closes_at)?,
                resolves_at: parse_rfc3339_utc(&args.resolves_at)?,
            };
            print_json(&store.create_event(&draft)?)
        }
        EventCommand::List(args) => {
            let filter = match args.status {
                StatusArg::Open => EventStatusFilter::Open,
                StatusArg::Closed => EventStatusFilter::Closed,
                StatusArg::Resolved => EventStatusFilter::Resolved,
                StatusArg::All => EventStatusFilter::All,
            };
            print_json(&store.list_events(filter, args.category.as_deref())?)
        }
        EventCommand::Show(args) => {
            let event_id = EventId::parse(&args.event_id)?;
            let event = store
                .get_event(event_id)?
                .ok_or_else(|| EngineError::NotFound(format!("event {event_id}")))?;
            print_json(&event)
        }
        EventCommand::Resolve(args) => {
            settings.gate().authorize(&args.admin_key)?;
            let event_id = EventId::parse(&args.event_id)?;
            let outcome = Side::parse_outcome(&args.outcome)?;
            print_json(&store.resolve_event(event_id, outcome)?)
        }
        EventCommand::SelectWinner(args) => {
            settings.gate().authorize(&args.admin_key)?;
            let event_id = EventId::parse(&args.event_id)?;
            let agent_id = AgentId::parse(&args.agent_id)?;
            print_json(&store.select_winner(event_id, agent_id)?)
        }
        EventCommand::Judge(args) => {
            settings.gate().authorize(&args.admin_key)?;
            let event_id = EventId::parse(&args.event_id)?;
            let outcome = store.judge_event(event_id)?;
            if args.narrative {
                for line in outcome.verdict.narrative_lines() {
                    println!("{line}");
                }
                Ok(())
            } else {
                print_json(&outcome)
            }
        }
        EventCommand::Delete(args) => {
            settings.gate().authorize(&args.admin_key)?;
            let event_id = EventId::parse(&args.event_id)?;
            store.delete_event(event_id)?;
            print_json(&json!({ "deleted": true, "event_id": event_id }))
        }
    }
}

fn run_prediction(command: PredictionCommand, store: &mut SqliteReputationStore) -> Result<()> {
    match command {
        PredictionCommand::Submit(args) => {
            let agent = store.authenticate(&args.api_key)?;
            let event_id = EventId::parse(&args.event_id)?;
            let input = SubmissionInput {
                side: match args.side {
                    SideArg::Yes => Side::Yes,
                    SideArg::No => Side::No,
                },
                confidence: parse_confidence(args.confidence)?,
                reasoning: args.reasoning,
            };
            print_json(&store.submit_prediction(agent.agent_id, event_id, &input, None)?)
        }
        PredictionCommand::List(args) => {
            let event_id = EventId::parse(&args.event_id)?;
            print_json(&store.event_predictions(event_id)?)
        }
        PredictionCommand::Recent(args) => print_json(&store.recent_predictions(args.limit)?),
        PredictionCommand::Like(args) => {
            let agent = store.authenticate(&args.api_key)?;
            let prediction_id = PredictionId::parse(&args.prediction_id)?;
            print_json(&store.like_prediction(agent.agent_id, prediction_id)?)
        }
        PredictionCommand::Unlike(args) => {
            let agent = store.authenticate(&args.api_key)?;
            let prediction_id = PredictionId::parse(&args.prediction_id)?;
            print_json(&store.unlike_prediction(agent.agent_id, prediction_id)?)
        }
        PredictionCommand::Reply(args) => {
            let agent = store.authenticate(&args.api_key)?;
            let prediction_id = PredictionId::parse(&args.prediction_id)?;
            print_json(&store.reply_to_prediction(agent.agent_id, prediction_id, &args.content)?)
        }
        PredictionCommand::Replies(args) => {
            let prediction_id = PredictionId::parse(&args.prediction_id)?;
            print_json(&store.list_replies(prediction_id)?)
        }
    }
}

/// Maps a command failure to `{ "code", "message" }`. Engine rejections keep
/// their stable code; anything else is `reputation.internal`.
#[must_use]
pub fn error_envelope(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<EngineError>() {
        Some(engine) => json!({
            "code": engine.code(),
            "message": engine.to_string(),
        }),
        None => json!({
            "code": error_code(err),
            "message": format!("{err:#}"),
        }),
    }
}

fn error_code(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<EngineError>()
        .map_or("reputation.internal", EngineError::code)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize command output")?
    );
    Ok(())
}

fn parse_optional_utc(raw: Option<&str>) -> Result<Option<OffsetDateTime>> {
    raw.map(parse_rfc3339_utc)
        .transpose()
        .map_err(anyhow::Error::from)
}

fn print_leaderboard_table(entries: &[LeaderboardEntry]) {
    println!(
        "{:<5} {:<24} {:>8} {:<9} {:>9} {:>7}",
        "rank", "username", "rep", "tier", "accuracy", "streak"
    );
    println!("{}", "-".repeat(67));

    for entry in entries {
        let standing = &entry.agent.standing;
        println!(
            "{:<5} {:<24} {:>8} {:<9} {:>8.1}% {:>7}",
            entry.rank,
            entry.agent.username,
            standing.reputation,
            standing.tier.as_str(),
            standing.accuracy_overall,
            standing.current_streak
        );
    }
}

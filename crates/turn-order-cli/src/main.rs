use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;
use turn_order_api::{
    ComputeTurnOrderRequest, OrganizationMemberRequest, StableMemberRequest, StableRequest,
    TurnOrderApi, UserProfileRequest,
};
use turn_order_core::{CompletedProcess, MemberProfile, Selection, TurnOrderRequest, WorkItem};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rota")]
#[command(about = "Stable duty turn-order CLI")]
struct Cli {
    #[arg(long, default_value = "./turn_order.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Directory {
        #[command(subcommand)]
        command: Box<DirectoryCommand>,
    },
    Stable {
        #[command(subcommand)]
        command: StableCommand,
    },
    WorkItem {
        #[command(subcommand)]
        command: Box<WorkItemCommand>,
    },
    Selection {
        #[command(subcommand)]
        command: SelectionCommand,
    },
    TurnOrder {
        #[command(subcommand)]
        command: Box<TurnOrderCommand>,
    },
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum DirectoryCommand {
    OrganizationMember(OrganizationMemberArgs),
    StableMember(StableMemberArgs),
    UserProfile(ProfileArgs),
}

#[derive(Debug, Args)]
struct ProfileArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    first_name: Option<String>,
    #[arg(long)]
    last_name: Option<String>,
    #[arg(long)]
    email: Option<String>,
}

impl ProfileArgs {
    fn profile(&self) -> MemberProfile {
        MemberProfile {
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            email: self.email.clone(),
        }
    }
}

#[derive(Debug, Args)]
struct OrganizationMemberArgs {
    #[arg(long)]
    organization_id: String,
    #[command(flatten)]
    profile: ProfileArgs,
}

#[derive(Debug, Args)]
struct StableMemberArgs {
    #[arg(long)]
    stable_id: String,
    #[command(flatten)]
    profile: ProfileArgs,
}

#[derive(Debug, Subcommand)]
enum StableCommand {
    Set(StableSetArgs),
}

#[derive(Debug, Args)]
struct StableSetArgs {
    #[arg(long)]
    stable_id: String,
    #[arg(long)]
    owner_id: Option<String>,
    #[arg(long)]
    memory_horizon_days: Option<u32>,
}

#[derive(Debug, Subcommand)]
enum WorkItemCommand {
    Upsert(WorkItemUpsertArgs),
}

#[derive(Debug, Args)]
struct WorkItemUpsertArgs {
    #[arg(long)]
    work_item_id: String,
    #[arg(long)]
    stable_id: String,
    #[arg(long)]
    scheduled_at: String,
    #[arg(long)]
    points_value: f64,
    #[arg(long)]
    points_awarded: Option<f64>,
    #[arg(long)]
    assigned_to: Option<String>,
    #[arg(long)]
    completed_by: Option<String>,
    #[arg(long)]
    completed_at: Option<String>,
}

#[derive(Debug, Subcommand)]
enum SelectionCommand {
    Add(SelectionAddArgs),
}

#[derive(Debug, Args)]
struct SelectionAddArgs {
    #[arg(long)]
    process_id: String,
    #[arg(long)]
    selected_by: String,
    #[arg(long)]
    points_value: f64,
}

#[derive(Debug, Subcommand)]
enum TurnOrderCommand {
    Compute(TurnOrderComputeArgs),
}

#[derive(Debug, Args)]
struct TurnOrderComputeArgs {
    #[arg(long)]
    stable_id: String,
    #[arg(long)]
    organization_id: String,
    /// `quota_based_draft`, `points_balance`, `fair_rotation` or `manual`.
    #[arg(long)]
    algorithm: Option<String>,
    #[arg(long = "member")]
    members: Vec<String>,
    #[arg(long)]
    start: String,
    #[arg(long)]
    end: String,
    /// Anchor for the points-balance memory horizon (defaults to now).
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    /// Archive a completed process read as JSON from `--file` or stdin.
    Complete(HistoryCompleteArgs),
    Last(HistoryStableArgs),
    List(HistoryStableArgs),
}

#[derive(Debug, Args)]
struct HistoryCompleteArgs {
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct HistoryStableArgs {
    #[arg(long)]
    stable_id: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: serde::Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value)?)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let api = TurnOrderApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Directory { command } => run_directory(*command, &api),
        Command::Stable { command } => run_stable(command, &api),
        Command::WorkItem { command } => run_work_item(*command, &api),
        Command::Selection { command } => run_selection(command, &api),
        Command::TurnOrder { command } => run_turn_order(*command, &api),
        Command::History { command } => run_history(command, &api),
    }
}

fn run_db(command: DbCommand, api: &TurnOrderApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
    }
}

fn run_directory(command: DirectoryCommand, api: &TurnOrderApi) -> Result<()> {
    match command {
        DirectoryCommand::OrganizationMember(args) => {
            let input = OrganizationMemberRequest {
                organization_id: args.organization_id,
                user_id: args.profile.user_id.clone(),
                profile: args.profile.profile(),
            };
            api.upsert_organization_member(&input)?;
            emit(&input)
        }
        DirectoryCommand::StableMember(args) => {
            let input = StableMemberRequest {
                stable_id: args.stable_id,
                user_id: args.profile.user_id.clone(),
                profile: args.profile.profile(),
            };
            api.upsert_stable_member(&input)?;
            emit(&input)
        }
        DirectoryCommand::UserProfile(args) => {
            let input =
                UserProfileRequest { user_id: args.user_id.clone(), profile: args.profile() };
            api.upsert_user_profile(&input)?;
            emit(&input)
        }
    }
}

fn run_stable(command: StableCommand, api: &TurnOrderApi) -> Result<()> {
    let StableCommand::Set(args) = command;
    let input = StableRequest {
        stable_id: args.stable_id,
        owner_id: args.owner_id,
        memory_horizon_days: args.memory_horizon_days,
    };
    api.set_stable(&input)?;
    emit(&input)
}

fn run_work_item(command: WorkItemCommand, api: &TurnOrderApi) -> Result<()> {
    let WorkItemCommand::Upsert(args) = command;
    let item = WorkItem {
        work_item_id: args.work_item_id,
        stable_id: args.stable_id,
        scheduled_at: parse_rfc3339(&args.scheduled_at)?,
        points_value: args.points_value,
        points_awarded: args.points_awarded,
        assigned_to: args.assigned_to,
        completed_by: args.completed_by,
        completed_at: args.completed_at.as_deref().map(parse_rfc3339).transpose()?,
    };
    api.upsert_work_item(&item)?;
    emit(&item)
}

fn run_selection(command: SelectionCommand, api: &TurnOrderApi) -> Result<()> {
    let SelectionCommand::Add(args) = command;
    let selection = Selection {
        process_id: args.process_id,
        selected_by: args.selected_by,
        points_value: args.points_value,
    };
    api.add_selection(&selection)?;
    emit(&selection)
}

fn run_turn_order(command: TurnOrderCommand, api: &TurnOrderApi) -> Result<()> {
    let TurnOrderCommand::Compute(args) = command;
    let input = ComputeTurnOrderRequest {
        request: TurnOrderRequest {
            stable_id: args.stable_id,
            organization_id: args.organization_id,
            algorithm: args.algorithm,
            member_ids: args.members,
            selection_start: parse_rfc3339(&args.start)?,
            selection_end: parse_rfc3339(&args.end)?,
        },
        as_of: args.as_of.as_deref().map(parse_rfc3339).transpose()?,
    };
    emit(&api.compute_turn_order(&input)?)
}

fn run_history(command: HistoryCommand, api: &TurnOrderApi) -> Result<()> {
    match command {
        HistoryCommand::Complete(args) => {
            let body = read_process_body(args.file.as_deref())?;
            let process: CompletedProcess = serde_json::from_str(&body)
                .context("completed process MUST be a JSON object")?;
            emit(&api.complete_process(&process)?)
        }
        HistoryCommand::Last(args) => {
            let last = api.last_history(&args.stable_id)?;
            emit_json(serde_json::json!({
                "stable_id": args.stable_id,
                "history": last
            }))
        }
        HistoryCommand::List(args) => {
            let history = api.list_history(&args.stable_id)?;
            emit_json(serde_json::json!({
                "stable_id": args.stable_id,
                "history": history
            }))
        }
    }
}

fn read_process_body(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read completed process {}", path.display())),
        None => {
            let mut body = String::new();
            std::io::stdin()
                .read_to_string(&mut body)
                .context("failed to read completed process from stdin")?;
            Ok(body)
        }
    }
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}

use std::error::Error;

use clap::{Args, Parser, Subcommand};
use engine::{Actor, Engine, EntrySource, MinorAmount, PostEntryCmd};
use migration::MigratorTrait;
use sea_orm::{Database, DatabaseConnection};
use serde::Serialize;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "duesledger_admin")]
#[command(about = "Admin utilities for the dues ledger (postings, settlement, drift repair)")]
struct Cli {
    /// Database connection string (also read from `DATABASE_URL`).
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "sqlite:./duesledger.db?mode=rwc"
    )]
    database_url: String,

    /// Management the command acts on.
    #[arg(long, short, env = "DUES_MANAGEMENT_ID")]
    management: String,

    /// Uid recorded in the audit log.
    #[arg(long, env = "DUES_ACTOR", default_value = "admin")]
    actor: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Unit(Unit),
    Entry(Entry),
    /// Allocate part of a payment to a due.
    Allocate(AllocateArgs),
    /// Close open dues in full from the unit's unapplied credit.
    Settle(UnitArgs),
    Dues(Dues),
    Drift(Drift),
    /// Print the audit trail of a unit, entry or allocation.
    Audit(AuditArgs),
}

#[derive(Args, Debug)]
struct Unit {
    #[command(subcommand)]
    command: UnitCommand,
}

#[derive(Subcommand, Debug)]
enum UnitCommand {
    Register(UnitRegisterArgs),
    List,
    Balance(UnitArgs),
}

#[derive(Args, Debug)]
struct UnitRegisterArgs {
    #[arg(long)]
    unit: String,
    #[arg(long)]
    label: Option<String>,
}

#[derive(Args, Debug)]
struct UnitArgs {
    #[arg(long)]
    unit: String,
}

#[derive(Args, Debug)]
struct Entry {
    #[command(subcommand)]
    command: EntryCommand,
}

#[derive(Subcommand, Debug)]
enum EntryCommand {
    Debit(PostArgs),
    Credit(CreditArgs),
    Void(ReasonArgs),
    Reverse(ReasonArgs),
    ReversePayment(ReasonArgs),
    Show(EntryArgs),
    List(ListArgs),
}

#[derive(Args, Debug)]
struct PostArgs {
    #[arg(long)]
    unit: String,
    /// Amount in major units, e.g. `150` or `80,50`.
    #[arg(long, value_parser = parse_amount)]
    amount: MinorAmount,
    #[arg(long, value_parser = parse_source, default_value = "manual")]
    source: EntrySource,
    #[arg(long)]
    idempotency_key: Option<String>,
    #[arg(long)]
    description: Option<String>,
}

#[derive(Args, Debug)]
struct CreditArgs {
    #[command(flatten)]
    post: PostArgs,
    /// Due to serve before the oldest-first sweep.
    #[arg(long)]
    related_due: Option<Uuid>,
}

#[derive(Args, Debug)]
struct ReasonArgs {
    #[arg(long)]
    entry: Uuid,
    #[arg(long)]
    reason: String,
}

#[derive(Args, Debug)]
struct EntryArgs {
    #[arg(long)]
    entry: Uuid,
}

#[derive(Args, Debug)]
struct ListArgs {
    #[arg(long)]
    unit: String,
    #[arg(long, default_value_t = 20)]
    limit: u64,
    #[arg(long)]
    cursor: Option<String>,
}

#[derive(Args, Debug)]
struct AllocateArgs {
    #[arg(long)]
    payment: Uuid,
    #[arg(long)]
    due: Uuid,
    #[arg(long, value_parser = parse_amount)]
    amount: MinorAmount,
}

#[derive(Args, Debug)]
struct Dues {
    #[command(subcommand)]
    command: DuesCommand,
}

#[derive(Subcommand, Debug)]
enum DuesCommand {
    /// Post one `dues` debit per registered unit for a `YYYY-MM` period.
    Generate(GenerateArgs),
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[arg(long)]
    period: String,
    #[arg(long, value_parser = parse_amount)]
    amount: MinorAmount,
}

#[derive(Args, Debug)]
struct Drift {
    #[command(subcommand)]
    command: DriftCommand,
}

#[derive(Subcommand, Debug)]
enum DriftCommand {
    CheckBalance(UnitArgs),
    RebuildBalance(RebuildBalanceArgs),
    CheckDues(SampleArgs),
    RebuildDue(RebuildDueArgs),
    Sweep(SweepArgs),
    Alerts,
}

#[derive(Args, Debug)]
struct RebuildBalanceArgs {
    #[arg(long)]
    unit: String,
    /// Ignore the rebuild cooldown.
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct RebuildDueArgs {
    #[arg(long)]
    due: Uuid,
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct SampleArgs {
    #[arg(long, default_value_t = 200)]
    sample: u64,
}

#[derive(Args, Debug)]
struct SweepArgs {
    #[command(flatten)]
    sample: SampleArgs,
    #[arg(long)]
    auto_rebuild: bool,
}

#[derive(Args, Debug)]
struct AuditArgs {
    #[arg(long)]
    target: String,
}

fn parse_amount(raw: &str) -> Result<MinorAmount, String> {
    MinorAmount::parse_positive(raw).map_err(|err| err.to_string())
}

fn parse_source(raw: &str) -> Result<EntrySource, String> {
    match EntrySource::try_from(raw) {
        Ok(source) if source.is_client_source() => Ok(source),
        Ok(source) => Err(format!("source {} is reserved", source.as_str())),
        Err(err) => Err(err.to_string()),
    }
}

async fn connect_db(
    database_url: &str,
) -> Result<DatabaseConnection, Box<dyn Error + Send + Sync>> {
    let db = Database::connect(database_url).await?;
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error + Send + Sync>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

impl PostArgs {
    fn into_cmd(self, management_id: &str) -> PostEntryCmd {
        let mut cmd = PostEntryCmd::new(
            management_id,
            self.unit,
            self.amount.minor(),
            self.source,
        );
        if let Some(key) = self.idempotency_key {
            cmd = cmd.idempotency_key(key);
        }
        if let Some(description) = self.description {
            cmd = cmd.description(description);
        }
        cmd
    }
}

async fn run(engine: &Engine, cli: Cli) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mgmt = cli.management.as_str();
    let actor = Actor::new(cli.actor).role("admin");

    match cli.command {
        Command::Unit(Unit { command }) => match command {
            UnitCommand::Register(args) => {
                let created = engine
                    .register_unit(mgmt, &args.unit, args.label.as_deref(), &actor)
                    .await?;
                if created {
                    println!("registered unit: {}", args.unit);
                } else {
                    println!("unit already registered: {}", args.unit);
                }
            }
            UnitCommand::List => print_json(&engine.list_units(mgmt).await?)?,
            UnitCommand::Balance(args) => {
                let cached = engine.unit_balance(mgmt, &args.unit).await?;
                let canonical = engine.compute_canonical(mgmt, &args.unit).await?;
                println!(
                    "balance: {} (canonical {})",
                    cached
                        .map(|b| MinorAmount::new(b.balance_minor).to_string())
                        .unwrap_or_else(|| "no cache".to_string()),
                    MinorAmount::new(canonical.balance_minor)
                );
            }
        },
        Command::Entry(Entry { command }) => match command {
            EntryCommand::Debit(args) => {
                print_json(&engine.create_debit(args.into_cmd(mgmt), &actor).await?)?;
            }
            EntryCommand::Credit(args) => {
                let mut cmd = args.post.into_cmd(mgmt);
                if let Some(due) = args.related_due {
                    cmd = cmd.related_due_id(due);
                }
                print_json(&engine.create_credit(cmd, &actor).await?)?;
            }
            EntryCommand::Void(args) => print_json(
                &engine
                    .void_ledger_entry(mgmt, args.entry, &args.reason, &actor)
                    .await?,
            )?,
            EntryCommand::Reverse(args) => print_json(
                &engine
                    .reverse_ledger_entry(mgmt, args.entry, &args.reason, &actor)
                    .await?,
            )?,
            EntryCommand::ReversePayment(args) => print_json(
                &engine
                    .reverse_payment(mgmt, args.entry, &args.reason, &actor)
                    .await?,
            )?,
            EntryCommand::Show(args) => {
                print_json(&engine.ledger_entry(mgmt, args.entry).await?)?;
                print_json(&engine.allocations_for_due(mgmt, args.entry).await?)?;
                print_json(&engine.allocations_for_payment(mgmt, args.entry).await?)?;
            }
            EntryCommand::List(args) => {
                let (entries, next) = engine
                    .list_unit_entries_page(mgmt, &args.unit, args.limit, args.cursor.as_deref())
                    .await?;
                print_json(&entries)?;
                if let Some(next) = next {
                    println!("next cursor: {next}");
                }
            }
        },
        Command::Allocate(args) => print_json(
            &engine
                .allocate_payment_to_due(mgmt, args.payment, args.due, args.amount.minor(), &actor)
                .await?,
        )?,
        Command::Settle(args) => {
            print_json(&engine.auto_settle_from_credit(mgmt, &args.unit, &actor).await?)?;
        }
        Command::Dues(Dues {
            command: DuesCommand::Generate(args),
        }) => print_json(
            &engine
                .generate_monthly_dues(mgmt, &args.period, args.amount.minor(), &actor)
                .await?,
        )?,
        Command::Drift(Drift { command }) => match command {
            DriftCommand::CheckBalance(args) => {
                print_json(&engine.check_unit_balance_drift(mgmt, &args.unit).await?)?;
            }
            DriftCommand::RebuildBalance(args) => print_json(
                &engine
                    .rebuild_unit_balance(mgmt, &args.unit, args.force, &actor)
                    .await?,
            )?,
            DriftCommand::CheckDues(args) => {
                print_json(&engine.check_due_drift(mgmt, args.sample).await?)?;
            }
            DriftCommand::RebuildDue(args) => print_json(
                &engine
                    .rebuild_due_aggregates(mgmt, args.due, args.force, &actor)
                    .await?,
            )?,
            DriftCommand::Sweep(args) => print_json(
                &engine
                    .sweep_drift(mgmt, args.sample.sample, args.auto_rebuild, &actor)
                    .await?,
            )?,
            DriftCommand::Alerts => print_json(&engine.open_alerts(mgmt).await?)?,
        },
        Command::Audit(args) => print_json(&engine.audit_log(mgmt, &args.target).await?)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter("engine=warn")
        .with_writer(std::io::stderr)
        .init();

    let db = connect_db(&cli.database_url).await?;
    let engine = Engine::builder().database(db).build().await?;

    if let Err(err) = run(&engine, cli).await {
        match err.downcast_ref::<engine::EngineError>() {
            Some(engine_err) => eprintln!("{}: {engine_err}", engine_err.kind().as_str()),
            None => eprintln!("{err}"),
        }
        std::process::exit(1);
    }

    Ok(())
}

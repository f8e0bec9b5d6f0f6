//! Bank Ledger command line
//!
//! ```text
//! bank_ledger [--env <name>] init-schema
//! bank_ledger [--env <name>] seed <count> [--seed <u64>]
//! bank_ledger [--env <name>] account <id>
//! bank_ledger [--env <name>] transfer <from> <to> <amount> <currency>
//! ```
//!
//! Results are printed to stdout as JSON; logs go to the configured sink.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use bank_ledger::config::AppConfig;
use bank_ledger::db::{Database, schema};
use bank_ledger::ledger::{Account, CreateAccountParams, Currency, LedgerQueries, StoreError};
use bank_ledger::transfer::{TransferRequest, TransferService};
use bank_ledger::util::RandomSource;
use bank_ledger::{AccountId, MinorUnits};

const USAGE: &str = "usage: bank_ledger [--env <name>] \
    init-schema | seed <count> [--seed <u64>] | account <id> | \
    transfer <from> <to> <amount> <currency>";

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Positional arguments with `--env <name>` removed
fn command_args() -> Vec<String> {
    let mut out = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--env" || arg == "-e" {
            args.next();
            continue;
        }
        out.push(arg);
    }
    out
}

#[derive(Debug, PartialEq)]
enum Command {
    InitSchema,
    Seed { count: usize, seed: Option<u64> },
    Account(AccountId),
    Transfer(TransferRequest),
}

impl Command {
    fn parse(args: &[String]) -> Result<Self> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let command = match args.as_slice() {
            ["init-schema"] => Command::InitSchema,
            ["seed", count] => Command::Seed {
                count: parse_arg(count, "count")?,
                seed: None,
            },
            ["seed", count, "--seed", seed] => Command::Seed {
                count: parse_arg(count, "count")?,
                seed: Some(parse_arg(seed, "seed")?),
            },
            ["account", id] => Command::Account(parse_arg(id, "account id")?),
            ["transfer", from, to, amount, currency] => Command::Transfer(TransferRequest {
                from_account_id: parse_arg::<AccountId>(from, "from account id")?,
                to_account_id: parse_arg::<AccountId>(to, "to account id")?,
                amount: parse_arg::<MinorUnits>(amount, "amount")?,
                currency: currency.parse::<Currency>()?,
            }),
            _ => bail!(USAGE),
        };
        Ok(command)
    }
}

fn parse_arg<T>(value: &str, what: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("invalid {}: {}", what, value))
}

/// Draws allowed per seeded account before an owner collision is fatal
const SEED_ATTEMPTS: usize = 5;

/// Create `count` random accounts. A draw whose (owner, currency) pair is
/// already taken is replaced by a fresh one.
async fn seed_accounts<Q: LedgerQueries>(
    queries: &mut Q,
    rng: &mut RandomSource,
    count: usize,
) -> Result<Vec<Account>> {
    let mut accounts = Vec::with_capacity(count);
    while accounts.len() < count {
        let mut attempt = 1;
        let account = loop {
            let params = CreateAccountParams {
                owner: rng.random_owner(),
                currency: rng.random_currency(),
                balance: rng.random_money(),
            };
            match queries.create_account(params).await {
                Err(StoreError::UniqueViolation(message)) if attempt < SEED_ATTEMPTS => {
                    tracing::debug!(attempt, %message, "Seed owner taken, redrawing");
                    attempt += 1;
                }
                result => {
                    break result
                        .with_context(|| format!("Failed to seed account {}", accounts.len() + 1))?;
                }
            }
        };
        accounts.push(account);
    }
    Ok(accounts)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(command: Command, config: AppConfig) -> Result<()> {
    let db = Database::connect(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.health_check().await?;

    let ledger = Arc::new(db.ledger());
    let service = TransferService::new(ledger.clone(), config.transfer.clone());

    match command {
        Command::InitSchema => {
            schema::init_schema(db.pool()).await?;
            print_json(&serde_json::json!({ "status": "ok" }))
        }
        Command::Seed { count, seed } => {
            let mut rng = match seed {
                Some(seed) => RandomSource::from_seed(seed),
                None => RandomSource::from_entropy(),
            };
            let mut queries = ledger.as_ref().clone();
            let accounts = seed_accounts(&mut queries, &mut rng, count).await?;
            tracing::info!(count = accounts.len(), "Seeded accounts");
            print_json(&accounts)
        }
        Command::Account(id) => print_json(&service.get_account(id).await?),
        Command::Transfer(req) => print_json(&service.create_transfer(req).await?),
    }
}

fn main() -> Result<()> {
    let command = Command::parse(&command_args())?;

    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = bank_ledger::logging::init_logging(&app_config.log);

    tracing::info!("Starting bank_ledger in {} mode", env);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(command, app_config))
}

//! Coffer Admin - operator CLI for the coffer economy
//!
//! Runs privileged ledger and currency operations directly against the
//! PostgreSQL store configured by `DATABASE_URL`.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coffer_core::{Caller, Currency, Page, Role, TransactionFilter, TransactionType, UserId};
use coffer_engine::{
    DeductRequest, Economy, EngineConfig, GrantRequest, LogNotifier, TransferRequest,
    UnavailableBadges,
};
use coffer_store::{PgStore, StoreConfig};

/// Operator tool for balances, transfers and currencies.
#[derive(Parser, Debug)]
#[command(name = "coffer-admin")]
#[command(about = "Administer the coffer economy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply the bundled schema migrations.
    Migrate,

    /// Create or replace a currency.
    CurrencyUpsert {
        /// Currency code, e.g. `credits`.
        #[arg(long)]
        code: String,
        /// Display name.
        #[arg(long)]
        name: String,
        /// Display symbol.
        #[arg(long, default_value = "")]
        symbol: String,
        /// Fractional digits shown when formatting.
        #[arg(long, default_value_t = 0)]
        precision: u8,
        /// Register the currency as inactive.
        #[arg(long)]
        inactive: bool,
        /// Configuration entries as `key=value`; values are parsed as JSON
        /// when possible.
        #[arg(long = "config", value_name = "KEY=VALUE", value_parser = parse_config_entry)]
        config: Vec<(String, serde_json::Value)>,
    },

    /// Credit an account.
    Grant {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        currency: String,
        #[arg(long)]
        amount: i64,
        /// Credit type (default `grant`).
        #[arg(long = "type", default_value = "grant")]
        transaction_type: TransactionType,
        #[arg(long)]
        description: Option<String>,
    },

    /// Debit an account.
    Deduct {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        currency: String,
        #[arg(long)]
        amount: i64,
        #[arg(long)]
        description: Option<String>,
        /// Skip the funds and frozen checks; the balance may go negative.
        #[arg(long)]
        allow_negative: bool,
    },

    /// Move funds between two users.
    Transfer {
        #[arg(long)]
        from: UserId,
        #[arg(long)]
        to: UserId,
        #[arg(long)]
        currency: String,
        #[arg(long)]
        amount: i64,
        #[arg(long)]
        description: Option<String>,
    },

    /// Freeze or unfreeze an account.
    Freeze {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        currency: String,
        /// Lift the freeze instead.
        #[arg(long)]
        undo: bool,
    },

    /// Show every balance of a user.
    Balance {
        #[arg(long)]
        user: UserId,
    },

    /// Show a user's transactions, newest first.
    History {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        currency: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Replay an account's ledger against its stored balance.
    Verify {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        currency: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,coffer=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let store_config = StoreConfig::from_env()?;
    let store = PgStore::connect(&store_config).await?;

    if matches!(cli.command, Command::Migrate) {
        store.migrate().await?;
        tracing::info!("Migrations applied");
        return Ok(());
    }

    let economy = Economy::new(
        Arc::new(store),
        Arc::new(UnavailableBadges),
        Arc::new(LogNotifier),
        EngineConfig::from_env(),
    );
    let operator = Caller::new(UserId::new(0), Role::Admin);

    run(&economy, &operator, cli.command).await
}

async fn run(
    economy: &Economy,
    operator: &Caller,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Migrate => Ok(()),
        Command::CurrencyUpsert {
            code,
            name,
            symbol,
            precision,
            inactive,
            config,
        } => {
            let mut currency = Currency::new(code, name, symbol);
            currency.precision = precision;
            currency.is_active = !inactive;
            for (key, value) in config {
                currency.config.set(key, value, None);
            }
            print(&economy.admin.upsert_currency(operator, currency).await?)
        }
        Command::Grant {
            user,
            currency,
            amount,
            transaction_type,
            description,
        } => {
            let mut req = GrantRequest::new(user, currency, amount).with_type(transaction_type);
            if let Some(description) = description {
                req = req.with_description(description);
            }
            print(&economy.admin.grant(operator, req).await?)
        }
        Command::Deduct {
            user,
            currency,
            amount,
            description,
            allow_negative,
        } => {
            let mut req = DeductRequest::new(user, currency, amount);
            if let Some(description) = description {
                req = req.with_description(description);
            }
            print(&economy.admin.deduct(operator, req, allow_negative).await?)
        }
        Command::Transfer {
            from,
            to,
            currency,
            amount,
            description,
        } => {
            let mut req = TransferRequest::new(from, to, currency, amount);
            if let Some(description) = description {
                req = req.with_description(description);
            }
            print(&economy.ledger.transfer(req).await?)
        }
        Command::Freeze {
            user,
            currency,
            undo,
        } => print(
            &economy
                .admin
                .set_account_frozen(operator, user, &currency, !undo)
                .await?,
        ),
        Command::Balance { user } => print(&economy.ledger.balances(user).await?),
        Command::History {
            user,
            currency,
            limit,
            offset,
        } => {
            let mut filter = TransactionFilter::for_user(user);
            filter.currency_code = currency;
            filter.page = Page::new(limit, offset);
            print(&economy.ledger.history(filter).await?)
        }
        Command::Verify { user, currency } => {
            let audit = economy.ledger.verify_account(user, &currency).await?;
            print(&audit)?;
            if audit.is_consistent() {
                Ok(())
            } else {
                Err(format!("ledger of {user}/{currency} does not match its balance").into())
            }
        }
    }
}

fn print<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_config_entry(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

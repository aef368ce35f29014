//! PostgreSQL storage implementation.
//!
//! A unit of work is one database transaction. Counters are always updated with
//! server-side arithmetic and guarded `WHERE` clauses, so the read-then-write
//! window between concurrent transactions never loses an update.
//!
//! ## Error mapping
//!
//! | sqlx error | Code | `StoreError` |
//! |------------|------|--------------|
//! | Database (unique violation) | `23505` | `UniqueViolation` |
//! | Database (other) | any | `Database` |
//! | Decode / ColumnDecode | n/a | `Serialization` |
//! | Other | n/a | `Database` |

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction as PgTransaction};

use coffer_core::{
    Account, AccountId, BalanceDelta, Currency, CurrencyConfig, Item, ItemFilter, ItemId, ItemKind,
    ItemType, NewItem, NewOwnership, Ownership, OwnershipFilter, OwnershipId, Reference,
    Transaction, TransactionFilter, TransactionId, UserId,
};

use crate::error::{Result, StoreError};
use crate::{Store, UnitOfWork};

const CURRENCY_COLUMNS: &str =
    "code, name, symbol, display_precision, is_active, config, created_at, updated_at";

const ACCOUNT_COLUMNS: &str = "id, user_id, currency_code, balance, total_earned, total_spent, \
     is_frozen, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, user_id, account_id, currency_code, amount, balance_after, \
     transaction_type, reference_type, reference_id, related_user_id, description, metadata, \
     created_at";

const ITEM_COLUMNS: &str = "id, name, description, price, currency_code, item_type, metadata, \
     consume_type, stock, max_own, duration_days, is_active, created_at, updated_at";

const OWNERSHIP_COLUMNS: &str = "id, user_id, item_id, item_type, quantity, is_equipped, status, \
     expires_at, created_at, updated_at";

/// Connection settings for [`PgStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// `postgres://` connection string.
    pub database_url: String,

    /// Pool size (default: 10).
    pub max_connections: u32,
}

impl StoreConfig {
    /// Load from `DATABASE_URL` and `DATABASE_MAX_CONNECTIONS`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if `DATABASE_URL` is not set.
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| StoreError::Config("DATABASE_URL is not set".into()))?;

        Ok(Self {
            database_url,
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
        })
    }
}

/// PostgreSQL-backed storage.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Open a connection pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be reached.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        tracing::info!(max_connections = config.max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        let dir = PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"));
        let migrator = Migrator::new(dir)
            .await
            .map_err(|e| StoreError::Database(format!("loading migrations: {e}")))?;
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("running migrations: {e}")))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                if db_err.code().as_deref() == Some("23505") {
                    Self::UniqueViolation {
                        constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                    }
                } else {
                    Self::Database(db_err.message().to_string())
                }
            }
            sqlx::Error::Decode(e) => Self::Serialization(e.to_string()),
            sqlx::Error::ColumnDecode { index, source } => {
                Self::Serialization(format!("column {index}: {source}"))
            }
            other => Self::Database(other.to_string()),
        }
    }
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

// =============================================================================
// Row mapping
// =============================================================================

fn currency_from_row(row: &PgRow) -> Result<Currency> {
    let precision: i16 = row.try_get("display_precision")?;
    let Json(config): Json<CurrencyConfig> = row.try_get("config")?;
    Ok(Currency {
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        symbol: row.try_get("symbol")?,
        precision: u8::try_from(precision)
            .map_err(|_| StoreError::Serialization(format!("invalid precision {precision}")))?,
        is_active: row.try_get("is_active")?,
        config,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        id: AccountId::new(row.try_get("id")?),
        user_id: UserId::new(row.try_get("user_id")?),
        currency_code: row.try_get("currency_code")?,
        balance: row.try_get("balance")?,
        total_earned: row.try_get("total_earned")?,
        total_spent: row.try_get("total_spent")?,
        is_frozen: row.try_get("is_frozen")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    let id: String = row.try_get("id")?;
    let transaction_type: String = row.try_get("transaction_type")?;
    let reference_type: Option<String> = row.try_get("reference_type")?;
    let reference_id: Option<String> = row.try_get("reference_id")?;
    let related_user_id: Option<i64> = row.try_get("related_user_id")?;

    Ok(Transaction {
        id: id
            .parse::<TransactionId>()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        user_id: UserId::new(row.try_get("user_id")?),
        account_id: AccountId::new(row.try_get("account_id")?),
        currency_code: row.try_get("currency_code")?,
        amount: row.try_get("amount")?,
        balance_after: row.try_get("balance_after")?,
        transaction_type: transaction_type
            .parse()
            .map_err(|e: coffer_core::UnknownVariant| StoreError::Serialization(e.to_string()))?,
        reference: reference_type
            .zip(reference_id)
            .map(|(kind, id)| Reference { kind, id }),
        related_user_id: related_user_id.map(UserId::new),
        description: row.try_get("description")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<Item> {
    let item_type: String = row.try_get("item_type")?;
    let metadata: serde_json::Value = row.try_get("metadata")?;
    let consume_type: String = row.try_get("consume_type")?;

    Ok(Item {
        id: ItemId::new(row.try_get("id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        price: row.try_get("price")?,
        currency_code: row.try_get("currency_code")?,
        kind: ItemKind::decode(&item_type, metadata)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        consume_type: consume_type
            .parse()
            .map_err(|e: coffer_core::UnknownVariant| StoreError::Serialization(e.to_string()))?,
        stock: row.try_get("stock")?,
        max_own: row.try_get("max_own")?,
        duration_days: row.try_get("duration_days")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn ownership_from_row(row: &PgRow) -> Result<Ownership> {
    let item_type: String = row.try_get("item_type")?;
    let status: String = row.try_get("status")?;

    Ok(Ownership {
        id: OwnershipId::new(row.try_get("id")?),
        user_id: UserId::new(row.try_get("user_id")?),
        item_id: ItemId::new(row.try_get("item_id")?),
        item_type: item_type
            .parse()
            .map_err(|e: coffer_core::UnknownVariant| StoreError::Serialization(e.to_string()))?,
        quantity: row.try_get("quantity")?,
        is_equipped: row.try_get("is_equipped")?,
        status: status
            .parse()
            .map_err(|e: coffer_core::UnknownVariant| StoreError::Serialization(e.to_string()))?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn collect<T>(rows: &[PgRow], map: fn(&PgRow) -> Result<T>) -> Result<Vec<T>> {
    rows.iter().map(map).collect()
}

// =============================================================================
// Store
// =============================================================================

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnit { tx }))
    }

    async fn get_currency(&self, code: &str) -> Result<Option<Currency>> {
        let sql = format!("SELECT {CURRENCY_COLUMNS} FROM currencies WHERE code = $1");
        let row = sqlx::query(&sql)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(currency_from_row).transpose()
    }

    async fn list_currencies(&self, active_only: bool) -> Result<Vec<Currency>> {
        let sql = format!(
            "SELECT {CURRENCY_COLUMNS} FROM currencies WHERE (NOT $1 OR is_active) ORDER BY code"
        );
        let rows = sqlx::query(&sql)
            .bind(active_only)
            .fetch_all(&self.pool)
            .await?;
        collect(&rows, currency_from_row)
    }

    async fn get_account(&self, user_id: UserId, currency_code: &str) -> Result<Option<Account>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = $1 AND currency_code = $2"
        );
        let row = sqlx::query(&sql)
            .bind(user_id.get())
            .bind(currency_code)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn list_accounts(&self, user_id: UserId) -> Result<Vec<Account>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = $1 ORDER BY currency_code"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.get())
            .fetch_all(&self.pool)
            .await?;
        collect(&rows, account_from_row)
    }

    async fn list_transactions(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>> {
        let sql = format!(
            r"
            SELECT {TRANSACTION_COLUMNS}
            FROM transactions
            WHERE user_id = $1
              AND ($2::TEXT IS NULL OR currency_code = $2)
              AND ($3::TEXT IS NULL OR transaction_type = $3)
            ORDER BY seq DESC
            LIMIT $4 OFFSET $5
            "
        );
        let rows = sqlx::query(&sql)
            .bind(filter.user_id.get())
            .bind(filter.currency_code.as_deref())
            .bind(filter.transaction_type.map(|t| t.as_str()))
            .bind(to_i64(filter.page.limit))
            .bind(to_i64(filter.page.offset))
            .fetch_all(&self.pool)
            .await?;
        collect(&rows, transaction_from_row)
    }

    async fn account_transactions(&self, account_id: AccountId) -> Result<Vec<Transaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE account_id = $1 ORDER BY seq"
        );
        let rows = sqlx::query(&sql)
            .bind(account_id.get())
            .fetch_all(&self.pool)
            .await?;
        collect(&rows, transaction_from_row)
    }

    async fn get_item(&self, item_id: ItemId) -> Result<Option<Item>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(item_id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<Item>> {
        let sql = format!(
            r"
            SELECT {ITEM_COLUMNS}
            FROM items
            WHERE ($1::TEXT IS NULL OR item_type = $1)
              AND ($2::TEXT IS NULL OR currency_code = $2)
              AND ($3::TEXT IS NULL OR consume_type = $3)
              AND (NOT $4 OR is_active)
            ORDER BY id
            LIMIT $5 OFFSET $6
            "
        );
        let rows = sqlx::query(&sql)
            .bind(filter.item_type.map(|t| t.as_str()))
            .bind(filter.currency_code.as_deref())
            .bind(filter.consume_type.map(|c| c.as_str()))
            .bind(filter.active_only)
            .bind(to_i64(filter.page.limit))
            .bind(to_i64(filter.page.offset))
            .fetch_all(&self.pool)
            .await?;
        collect(&rows, item_from_row)
    }

    async fn list_ownerships(
        &self,
        user_id: UserId,
        filter: &OwnershipFilter,
    ) -> Result<Vec<Ownership>> {
        let sql = format!(
            r"
            SELECT {OWNERSHIP_COLUMNS}
            FROM ownerships
            WHERE user_id = $1
              AND ($2::TEXT IS NULL OR item_type = $2)
              AND ($3::TEXT IS NULL OR status = $3)
              AND (NOT $4 OR is_equipped)
            ORDER BY id
            "
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.get())
            .bind(filter.item_type.map(|t| t.as_str()))
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.equipped_only)
            .fetch_all(&self.pool)
            .await?;
        collect(&rows, ownership_from_row)
    }
}

// =============================================================================
// Unit of work
// =============================================================================

/// One PostgreSQL transaction. Dropping it without commit rolls back.
struct PgUnit {
    tx: PgTransaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnit {
    async fn find_currency(&mut self, code: &str) -> Result<Option<Currency>> {
        let sql = format!("SELECT {CURRENCY_COLUMNS} FROM currencies WHERE code = $1");
        let row = sqlx::query(&sql)
            .bind(code)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(currency_from_row).transpose()
    }

    async fn upsert_currency(&mut self, currency: &Currency) -> Result<Currency> {
        let sql = format!(
            r"
            INSERT INTO currencies (code, name, symbol, display_precision, is_active, config)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (code) DO UPDATE SET
                name = EXCLUDED.name,
                symbol = EXCLUDED.symbol,
                display_precision = EXCLUDED.display_precision,
                is_active = EXCLUDED.is_active,
                config = EXCLUDED.config,
                updated_at = now()
            RETURNING {CURRENCY_COLUMNS}
            "
        );
        let row = sqlx::query(&sql)
            .bind(&currency.code)
            .bind(&currency.name)
            .bind(&currency.symbol)
            .bind(i16::from(currency.precision))
            .bind(currency.is_active)
            .bind(Json(&currency.config))
            .fetch_one(&mut *self.tx)
            .await?;
        currency_from_row(&row)
    }

    async fn find_account(
        &mut self,
        user_id: UserId,
        currency_code: &str,
    ) -> Result<Option<Account>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = $1 AND currency_code = $2"
        );
        let row = sqlx::query(&sql)
            .bind(user_id.get())
            .bind(currency_code)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn insert_account(&mut self, user_id: UserId, currency_code: &str) -> Result<Account> {
        let sql = format!(
            "INSERT INTO accounts (user_id, currency_code) VALUES ($1, $2) RETURNING {ACCOUNT_COLUMNS}"
        );

        // A failed statement aborts the whole transaction in PostgreSQL; the
        // savepoint confines a uniqueness conflict to this insert.
        let mut savepoint = sqlx::Connection::begin(&mut *self.tx).await?;
        let inserted = sqlx::query(&sql)
            .bind(user_id.get())
            .bind(currency_code)
            .fetch_one(&mut *savepoint)
            .await;

        match inserted {
            Ok(row) => {
                savepoint.commit().await?;
                account_from_row(&row)
            }
            Err(err) => {
                savepoint.rollback().await?;
                Err(err.into())
            }
        }
    }

    async fn apply_balance_delta(
        &mut self,
        account_id: AccountId,
        delta: BalanceDelta,
    ) -> Result<Option<Account>> {
        let sql = format!(
            r"
            UPDATE accounts SET
                balance = balance + $2,
                total_earned = total_earned + $3,
                total_spent = total_spent + $4,
                updated_at = now()
            WHERE id = $1 AND ($5::BIGINT IS NULL OR balance + $2 >= $5)
            RETURNING {ACCOUNT_COLUMNS}
            "
        );
        let row = sqlx::query(&sql)
            .bind(account_id.get())
            .bind(delta.amount)
            .bind(delta.earned)
            .bind(delta.spent)
            .bind(delta.floor)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn set_account_frozen(&mut self, account_id: AccountId, frozen: bool) -> Result<Account> {
        let sql = format!(
            "UPDATE accounts SET is_frozen = $2, updated_at = now() WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(account_id.get())
            .bind(frozen)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "account",
                id: account_id.to_string(),
            })?;
        account_from_row(&row)
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO transactions (
                id, user_id, account_id, currency_code, amount, balance_after,
                transaction_type, reference_type, reference_id, related_user_id,
                description, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ",
        )
        .bind(transaction.id.to_string())
        .bind(transaction.user_id.get())
        .bind(transaction.account_id.get())
        .bind(&transaction.currency_code)
        .bind(transaction.amount)
        .bind(transaction.balance_after)
        .bind(transaction.transaction_type.as_str())
        .bind(transaction.reference.as_ref().map(|r| r.kind.as_str()))
        .bind(transaction.reference.as_ref().map(|r| r.id.as_str()))
        .bind(transaction.related_user_id.map(UserId::get))
        .bind(transaction.description.as_deref())
        .bind(&transaction.metadata)
        .bind(transaction.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn find_item(&mut self, item_id: ItemId) -> Result<Option<Item>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(item_id.get())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn insert_item(&mut self, item: NewItem) -> Result<Item> {
        let sql = format!(
            r"
            INSERT INTO items (
                name, description, price, currency_code, item_type, metadata,
                consume_type, stock, max_own, duration_days, is_active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {ITEM_COLUMNS}
            "
        );
        let row = sqlx::query(&sql)
            .bind(&item.name)
            .bind(item.description.as_deref())
            .bind(item.price)
            .bind(&item.currency_code)
            .bind(item.kind.item_type().as_str())
            .bind(item.kind.metadata())
            .bind(item.consume_type.as_str())
            .bind(item.stock)
            .bind(item.max_own)
            .bind(item.duration_days)
            .bind(item.is_active)
            .fetch_one(&mut *self.tx)
            .await?;
        item_from_row(&row)
    }

    async fn update_item(&mut self, item: &Item) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE items SET
                name = $2,
                description = $3,
                price = $4,
                metadata = $5,
                stock = $6,
                max_own = $7,
                duration_days = $8,
                is_active = $9,
                updated_at = now()
            WHERE id = $1
            ",
        )
        .bind(item.id.get())
        .bind(&item.name)
        .bind(item.description.as_deref())
        .bind(item.price)
        .bind(item.kind.metadata())
        .bind(item.stock)
        .bind(item.max_own)
        .bind(item.duration_days)
        .bind(item.is_active)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "item",
                id: item.id.to_string(),
            });
        }
        Ok(())
    }

    async fn decrement_stock(&mut self, item_id: ItemId, quantity: i64) -> Result<Option<i64>> {
        let row = sqlx::query(
            r"
            UPDATE items SET stock = stock - $2, updated_at = now()
            WHERE id = $1 AND stock IS NOT NULL AND stock >= $2
            RETURNING stock
            ",
        )
        .bind(item_id.get())
        .bind(quantity)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(|r| r.try_get::<i64, _>("stock"))
            .transpose()
            .map_err(Into::into)
    }

    async fn find_ownership(
        &mut self,
        user_id: UserId,
        item_id: ItemId,
    ) -> Result<Option<Ownership>> {
        let sql = format!(
            "SELECT {OWNERSHIP_COLUMNS} FROM ownerships WHERE user_id = $1 AND item_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(user_id.get())
            .bind(item_id.get())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(ownership_from_row).transpose()
    }

    async fn find_owned(
        &mut self,
        ownership_id: OwnershipId,
        user_id: UserId,
    ) -> Result<Option<Ownership>> {
        let sql =
            format!("SELECT {OWNERSHIP_COLUMNS} FROM ownerships WHERE id = $1 AND user_id = $2");
        let row = sqlx::query(&sql)
            .bind(ownership_id.get())
            .bind(user_id.get())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(ownership_from_row).transpose()
    }

    async fn insert_ownership(&mut self, ownership: NewOwnership) -> Result<Ownership> {
        let sql = format!(
            r"
            INSERT INTO ownerships (user_id, item_id, item_type, quantity, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {OWNERSHIP_COLUMNS}
            "
        );
        let mut savepoint = sqlx::Connection::begin(&mut *self.tx).await?;
        let inserted = sqlx::query(&sql)
            .bind(ownership.user_id.get())
            .bind(ownership.item_id.get())
            .bind(ownership.item_type.as_str())
            .bind(ownership.quantity)
            .bind(ownership.expires_at)
            .fetch_one(&mut *savepoint)
            .await;

        match inserted {
            Ok(row) => {
                savepoint.commit().await?;
                ownership_from_row(&row)
            }
            Err(err) => {
                savepoint.rollback().await?;
                Err(err.into())
            }
        }
    }

    async fn add_ownership_quantity(
        &mut self,
        ownership_id: OwnershipId,
        added: i64,
        max_own: Option<i64>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Ownership>> {
        let sql = format!(
            r"
            UPDATE ownerships SET
                quantity = quantity + $2,
                status = 'active',
                expires_at = COALESCE($4, expires_at),
                updated_at = now()
            WHERE id = $1 AND ($3::BIGINT IS NULL OR quantity + $2 <= $3)
            RETURNING {OWNERSHIP_COLUMNS}
            "
        );
        let row = sqlx::query(&sql)
            .bind(ownership_id.get())
            .bind(added)
            .bind(max_own)
            .bind(expires_at)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(ownership_from_row).transpose()
    }

    async fn consume_ownership(
        &mut self,
        ownership_id: OwnershipId,
        user_id: UserId,
        used: i64,
    ) -> Result<Option<Ownership>> {
        let sql = format!(
            r"
            UPDATE ownerships SET
                quantity = quantity - $3,
                status = CASE WHEN quantity - $3 = 0 THEN 'exhausted' ELSE status END,
                is_equipped = CASE WHEN quantity - $3 = 0 THEN FALSE ELSE is_equipped END,
                updated_at = now()
            WHERE id = $1 AND user_id = $2 AND status = 'active' AND quantity >= $3
            RETURNING {OWNERSHIP_COLUMNS}
            "
        );
        let row = sqlx::query(&sql)
            .bind(ownership_id.get())
            .bind(user_id.get())
            .bind(used)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(ownership_from_row).transpose()
    }

    async fn unequip_slot(
        &mut self,
        user_id: UserId,
        item_type: ItemType,
        keep: OwnershipId,
    ) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE ownerships SET is_equipped = FALSE, updated_at = now()
            WHERE user_id = $1 AND item_type = $2 AND is_equipped AND id <> $3
            ",
        )
        .bind(user_id.get())
        .bind(item_type.as_str())
        .bind(keep.get())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn set_equipped(
        &mut self,
        ownership_id: OwnershipId,
        user_id: UserId,
        equipped: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE ownerships SET is_equipped = $3, updated_at = now() WHERE id = $1 AND user_id = $2",
        )
        .bind(ownership_id.get())
        .bind(user_id.get())
        .bind(equipped)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

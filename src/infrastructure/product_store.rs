//! Idempotent upsert persistence for product rows
//!
//! One `products` row per external id, with fixed dimensional and
//! categorical columns plus one nullable `price_{q}` column per allowed
//! quantity. The schema is generated once from the compile-time quantity
//! table, never from runtime data. Upserts preserve creation time and
//! advance update time; only non-null supplied fields overwrite.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::domain::constants::ALLOWED_QUANTITIES;
use crate::domain::product::{PriceTiers, ProductRecord, ProductStub, SizeCategory};

/// Nullable detail columns, in schema order
const DETAIL_COLUMNS: [&str; 14] = [
    "inner_length",
    "inner_width",
    "inner_depth",
    "outer_length",
    "outer_width",
    "outer_depth",
    "outer_dimension_sum",
    "manufacturing_method",
    "processing_location",
    "color",
    "box_type",
    "material",
    "thickness",
    "standard_width",
];

fn price_column(quantity: u32) -> String {
    format!("price_{quantity}")
}

static CREATE_TABLE_SQL: Lazy<String> = Lazy::new(|| {
    let mut sql = String::from(
        "CREATE TABLE IF NOT EXISTS products (\n\
         \x20   product_id TEXT PRIMARY KEY,\n\
         \x20   name TEXT NOT NULL,\n\
         \x20   size TEXT NOT NULL,\n\
         \x20   url TEXT NOT NULL,\n",
    );
    for column in DETAIL_COLUMNS {
        let sql_type = match column {
            "manufacturing_method" | "processing_location" | "color" | "box_type"
            | "material" => "TEXT",
            _ => "REAL",
        };
        sql.push_str(&format!("    {column} {sql_type},\n"));
    }
    for quantity in ALLOWED_QUANTITIES {
        sql.push_str(&format!("    {} INTEGER,\n", price_column(quantity)));
    }
    sql.push_str(
        "    created_at DATETIME NOT NULL,\n\
         \x20   updated_at DATETIME NOT NULL\n\
         )",
    );
    sql
});

static UPSERT_STUB_SQL: &str = "\
    INSERT INTO products (product_id, name, size, url, created_at, updated_at)\n\
    VALUES (?, ?, ?, ?, ?, ?)\n\
    ON CONFLICT(product_id) DO UPDATE SET\n\
        name = excluded.name,\n\
        size = excluded.size,\n\
        url = excluded.url,\n\
        updated_at = excluded.updated_at";

static UPSERT_RECORD_SQL: Lazy<String> = Lazy::new(|| {
    let mut columns: Vec<String> = ["product_id", "name", "size", "url"]
        .iter()
        .map(|c| (*c).to_string())
        .collect();
    columns.extend(DETAIL_COLUMNS.iter().map(|c| (*c).to_string()));
    columns.extend(ALLOWED_QUANTITIES.iter().map(|q| price_column(*q)));
    columns.push("created_at".to_string());
    columns.push("updated_at".to_string());

    let placeholders = vec!["?"; columns.len()].join(", ");
    let coalesced = DETAIL_COLUMNS
        .iter()
        .map(|c| (*c).to_string())
        .chain(ALLOWED_QUANTITIES.iter().map(|q| price_column(*q)))
        .map(|c| format!("{c} = COALESCE(excluded.{c}, {c})"))
        .collect::<Vec<_>>()
        .join(",\n        ");

    format!(
        "INSERT INTO products ({})\n\
         VALUES ({})\n\
         ON CONFLICT(product_id) DO UPDATE SET\n\
         \x20   name = excluded.name,\n\
         \x20   size = excluded.size,\n\
         \x20   url = excluded.url,\n\
         \x20   {},\n\
         \x20   updated_at = excluded.updated_at",
        columns.join(", "),
        placeholders,
        coalesced
    )
});

static SELECT_COLUMNS: Lazy<String> = Lazy::new(|| {
    let mut columns: Vec<String> = ["product_id", "name", "size", "url"]
        .iter()
        .map(|c| (*c).to_string())
        .collect();
    columns.extend(DETAIL_COLUMNS.iter().map(|c| (*c).to_string()));
    columns.extend(ALLOWED_QUANTITIES.iter().map(|q| price_column(*q)));
    columns.push("created_at".to_string());
    columns.push("updated_at".to_string());
    columns.join(", ")
});

/// Store handle over a shared connection pool. Cloning shares the pool;
/// every operation acquires its own connection, so workers never share a
/// live connection.
#[derive(Clone)]
pub struct ProductStore {
    pool: SqlitePool,
}

impl ProductStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating the file and parent directories as needed) and
    /// return an uninitialized store.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let db_path = database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");

        if let Some(parent) = Path::new(db_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if !Path::new(db_path).exists() {
            std::fs::File::create(db_path)
                .with_context(|| format!("failed to create database file {db_path}"))?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .with_context(|| format!("failed to open database {database_url}"))?;
        Ok(Self::new(pool))
    }

    /// In-memory store on a single connection (every pooled connection of
    /// `:memory:` would otherwise get its own database)
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory database")?;
        Ok(Self::new(pool))
    }

    /// Create the fixed schema
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(&CREATE_TABLE_SQL).execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_products_size ON products (size)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop and recreate the products table
    pub async fn reset(&self) -> Result<()> {
        sqlx::query("DROP TABLE IF EXISTS products")
            .execute(&self.pool)
            .await?;
        info!("products table dropped");
        self.initialize().await
    }

    /// Insert or refresh a listing stub. An existing row keeps its
    /// creation time and every detail field; name/category/url are
    /// refreshed and updated_at advances.
    pub async fn upsert_stub(&self, stub: &ProductStub) -> Result<()> {
        let now = Utc::now();
        sqlx::query(UPSERT_STUB_SQL)
            .bind(&stub.external_id)
            .bind(&stub.display_name)
            .bind(stub.size_category.as_str())
            .bind(&stub.canonical_url)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert or update a full record. Only non-null supplied fields
    /// overwrite stored values (COALESCE), so the call is idempotent for
    /// identical input and monotonic for field-filling input.
    pub async fn upsert_record(&self, record: &ProductRecord) -> Result<()> {
        let now = Utc::now();
        let mut query = sqlx::query(&UPSERT_RECORD_SQL)
            .bind(&record.external_id)
            .bind(&record.display_name)
            .bind(record.size_category.as_str())
            .bind(&record.canonical_url)
            .bind(record.inner_length)
            .bind(record.inner_width)
            .bind(record.inner_depth)
            .bind(record.outer_length)
            .bind(record.outer_width)
            .bind(record.outer_depth)
            .bind(record.outer_dimension_sum)
            .bind(&record.manufacturing_method)
            .bind(&record.processing_location)
            .bind(&record.color)
            .bind(&record.box_type)
            .bind(&record.material)
            .bind(record.thickness)
            .bind(record.standard_width);
        for quantity in ALLOWED_QUANTITIES {
            query = query.bind(record.price_tiers.get(&quantity).copied());
        }
        query = query.bind(now).bind(now);
        query.execute(&self.pool).await?;
        Ok(())
    }

    /// Fetch one record by external id
    pub async fn get(&self, external_id: &str) -> Result<Option<ProductRecord>> {
        let sql = format!(
            "SELECT {} FROM products WHERE product_id = ?",
            &*SELECT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_record(&r)).transpose()
    }

    /// All records, optionally restricted to one category, in id order
    pub async fn list(&self, category: Option<SizeCategory>) -> Result<Vec<ProductRecord>> {
        let rows = match category {
            Some(category) => {
                let sql = format!(
                    "SELECT {} FROM products WHERE size = ? ORDER BY product_id",
                    &*SELECT_COLUMNS
                );
                sqlx::query(&sql)
                    .bind(category.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM products ORDER BY size, product_id",
                    &*SELECT_COLUMNS
                );
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
        };
        rows.iter().map(row_to_record).collect()
    }

    /// Stub views of the stored rows, optionally by category
    pub async fn list_stubs(&self, category: Option<SizeCategory>) -> Result<Vec<ProductStub>> {
        let records = self.list(category).await?;
        Ok(records
            .into_iter()
            .map(|record| ProductStub {
                external_id: record.external_id,
                display_name: record.display_name,
                size_category: record.size_category,
                canonical_url: record.canonical_url,
            })
            .collect())
    }

    /// Ids currently stored for a category (default detail-crawl input)
    pub async fn list_stub_ids(&self, category: SizeCategory) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT product_id FROM products WHERE size = ? ORDER BY product_id")
                .bind(category.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(|r| r.get("product_id")).collect())
    }

    /// Ids never enriched by a detail pass (all detail columns still null)
    pub async fn list_pending_detail_ids(&self, category: SizeCategory) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT product_id FROM products \
             WHERE size = ? AND inner_length IS NULL AND material IS NULL \
               AND outer_dimension_sum IS NULL \
             ORDER BY product_id",
        )
        .bind(category.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("product_id")).collect())
    }
}

fn row_to_record(row: &SqliteRow) -> Result<ProductRecord> {
    let size: String = row.get("size");
    let size_category = size
        .parse::<SizeCategory>()
        .map_err(|e| anyhow::anyhow!(e))?;

    let mut price_tiers = PriceTiers::new();
    for quantity in ALLOWED_QUANTITIES {
        let column = price_column(quantity);
        if let Some(price) = row.try_get::<Option<i64>, _>(column.as_str())? {
            price_tiers.insert(quantity, price);
        }
    }

    Ok(ProductRecord {
        external_id: row.get("product_id"),
        display_name: row.get("name"),
        size_category,
        canonical_url: row.get("url"),
        inner_length: row.get("inner_length"),
        inner_width: row.get("inner_width"),
        inner_depth: row.get("inner_depth"),
        outer_length: row.get("outer_length"),
        outer_width: row.get("outer_width"),
        outer_depth: row.get("outer_depth"),
        outer_dimension_sum: row.get("outer_dimension_sum"),
        manufacturing_method: row.get("manufacturing_method"),
        processing_location: row.get("processing_location"),
        color: row.get("color"),
        box_type: row.get("box_type"),
        material: row.get("material"),
        thickness: row.get("thickness"),
        standard_width: row.get("standard_width"),
        price_tiers,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    })
}

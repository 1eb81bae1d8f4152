//! PersonDirectory - Known Person Lookup
//!
//! Resolves the person id reported by the engine to the canonical record.
//! The SQLite store reads a `people(id, name)` table; extra columns are
//! ignored.

use crate::error::Result;
use crate::models::{Person, PersonId};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::str::FromStr;

/// Lookup of known persons by id
#[async_trait]
pub trait PersonDirectory: Send + Sync {
    async fn find_person(&self, id: &PersonId) -> Result<Option<Person>>;
}

/// SQLite backed directory
#[derive(Clone)]
pub struct SqlitePersonDirectory {
    pool: SqlitePool,
}

impl SqlitePersonDirectory {
    /// Connect, creating the database and table when missing
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let directory = Self::new(pool);
        directory.ensure_schema().await?;
        tracing::info!(url = %url, "Person directory connected");
        Ok(directory)
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS people (
                id   TEXT PRIMARY KEY,
                name TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or replace a person
    pub async fn upsert(&self, person: &Person) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO people (id, name) VALUES (?, ?)")
            .bind(person.id.to_string())
            .bind(&person.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PersonDirectory for SqlitePersonDirectory {
    async fn find_person(&self, id: &PersonId) -> Result<Option<Person>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT name FROM people WHERE CAST(id AS TEXT) = ? LIMIT 1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(name,)| Person {
            id: id.clone(),
            name,
        }))
    }
}

/// Fixed in-memory directory
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    people: HashMap<String, Person>,
}

impl StaticDirectory {
    pub fn new(people: Vec<Person>) -> Self {
        Self {
            people: people
                .into_iter()
                .map(|p| (p.id.to_string(), p))
                .collect(),
        }
    }
}

#[async_trait]
impl PersonDirectory for StaticDirectory {
    async fn find_person(&self, id: &PersonId) -> Result<Option<Person>> {
        Ok(self.people.get(&id.to_string()).cloned())
    }
}

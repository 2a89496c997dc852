// src/db.rs
use crate::models::UserRecord;
use async_trait::async_trait;
use log::{error, info};
use scylla::frame::response::result::{CqlValue, Row};
use scylla::frame::value::ValueList;
use scylla::{query::Query, Session, SessionBuilder};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("corrupt user row for {email}: {reason}")]
    CorruptRow { email: String, reason: String },
}

/// Single-document operations over the user collection, keyed by email.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(&self, email: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Returns `false` when a user with that email already exists.
    async fn insert_user(&self, record: UserRecord) -> Result<bool, StoreError>;

    /// Appends `symbol` unless already tracked. Returns whether the list changed.
    async fn add_symbol(&self, email: &str, symbol: &str) -> Result<bool, StoreError>;

    /// Removes `symbol`. Returns whether the list changed.
    async fn remove_symbol(&self, email: &str, symbol: &str) -> Result<bool, StoreError>;
}

pub struct ScyllaStore {
    session: Session,
    keyspace: String,
}

impl ScyllaStore {
    pub async fn connect(node: &str, keyspace: &str) -> Result<Self, StoreError> {
        let session = SessionBuilder::new()
            .known_node(node)
            .build()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let store = ScyllaStore {
            session,
            keyspace: keyspace.to_string(),
        };
        store.create_schema().await?;

        info!("Successfully connected to ScyllaDB at {}.", node);
        Ok(store)
    }

    async fn create_schema(&self) -> Result<(), StoreError> {
        self.execute(
            format!(
                "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = {{'class': 'SimpleStrategy', 'replication_factor': 1}}",
                self.keyspace
            ),
            &[],
        )
        .await?;
        self.execute(
            format!(
                "CREATE TABLE IF NOT EXISTS {}.users (email TEXT PRIMARY KEY, first_name TEXT, password_hash TEXT, profile_picture TEXT, profile TEXT, stocks LIST<TEXT>)",
                self.keyspace
            ),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn execute(
        &self,
        cql: String,
        values: impl ValueList,
    ) -> Result<Option<Vec<Row>>, StoreError> {
        self.session
            .query(Query::new(cql), values)
            .await
            .map(|result| result.rows)
            .map_err(|e| {
                error!("Scylla query failed: {}", e);
                StoreError::Backend(e.to_string())
            })
    }
}

#[async_trait]
impl UserStore for ScyllaStore {
    async fn find_user(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        let cql = format!(
            "SELECT email, first_name, password_hash, profile_picture, profile, stocks FROM {}.users WHERE email = ?",
            self.keyspace
        );
        let rows = self.execute(cql, (email,)).await?;
        match rows.and_then(|rows| rows.into_iter().next()) {
            Some(row) => row_to_user(email, row.columns).map(Some),
            None => Ok(None),
        }
    }

    async fn insert_user(&self, record: UserRecord) -> Result<bool, StoreError> {
        let cql = format!(
            "INSERT INTO {}.users (email, first_name, password_hash, profile_picture, profile, stocks) VALUES (?, ?, ?, ?, ?, ?) IF NOT EXISTS",
            self.keyspace
        );
        let profile = Value::Object(record.profile).to_string();
        let rows = self
            .execute(
                cql,
                (
                    record.email,
                    record.first_name,
                    record.password_hash,
                    record.profile_picture,
                    profile,
                    record.stocks,
                ),
            )
            .await?;

        // Lightweight transactions answer with an `[applied]` boolean first.
        let applied = rows
            .and_then(|rows| rows.into_iter().next())
            .and_then(|row| row.columns.into_iter().next().flatten())
            .map(|value| matches!(value, CqlValue::Boolean(true)))
            .unwrap_or(false);
        Ok(applied)
    }

    async fn add_symbol(&self, email: &str, symbol: &str) -> Result<bool, StoreError> {
        match self.find_user(email).await? {
            Some(user) if !user.tracks(symbol) => {
                let cql = format!(
                    "UPDATE {}.users SET stocks = stocks + ? WHERE email = ?",
                    self.keyspace
                );
                self.execute(cql, (vec![symbol.to_string()], email)).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_symbol(&self, email: &str, symbol: &str) -> Result<bool, StoreError> {
        match self.find_user(email).await? {
            Some(user) if user.tracks(symbol) => {
                let cql = format!(
                    "UPDATE {}.users SET stocks = stocks - ? WHERE email = ?",
                    self.keyspace
                );
                self.execute(cql, (vec![symbol.to_string()], email)).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn row_to_user(email: &str, columns: Vec<Option<CqlValue>>) -> Result<UserRecord, StoreError> {
    let corrupt = |reason: &str| StoreError::CorruptRow {
        email: email.to_string(),
        reason: reason.to_string(),
    };
    let text = |value: &Option<CqlValue>| -> Option<String> {
        value.as_ref().and_then(|v| v.as_text()).cloned()
    };

    if columns.len() < 6 {
        return Err(corrupt("unexpected column count"));
    }

    let profile = match text(&columns[4]) {
        Some(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            _ => return Err(corrupt("profile is not a JSON object")),
        },
        None => Map::new(),
    };

    // An emptied list column reads back as null.
    let stocks = match &columns[5] {
        Some(CqlValue::List(items)) => items
            .iter()
            .filter_map(|item| item.as_text().cloned())
            .collect(),
        Some(_) => return Err(corrupt("stocks is not a list")),
        None => Vec::new(),
    };

    Ok(UserRecord {
        email: text(&columns[0]).ok_or_else(|| corrupt("missing email"))?,
        first_name: text(&columns[1]).unwrap_or_default(),
        password_hash: text(&columns[2]).ok_or_else(|| corrupt("missing password hash"))?,
        profile_picture: text(&columns[3]),
        profile,
        stocks,
    })
}

/// Process-local store with the same semantics as the Scylla table.
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, UserRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.read().await.get(email).cloned())
    }

    async fn insert_user(&self, record: UserRecord) -> Result<bool, StoreError> {
        let mut users = self.users.write().await;
        if users.contains_key(&record.email) {
            return Ok(false);
        }
        users.insert(record.email.clone(), record);
        Ok(true)
    }

    async fn add_symbol(&self, email: &str, symbol: &str) -> Result<bool, StoreError> {
        let mut users = self.users.write().await;
        match users.get_mut(email) {
            Some(user) if !user.tracks(symbol) => {
                user.stocks.push(symbol.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_symbol(&self, email: &str, symbol: &str) -> Result<bool, StoreError> {
        let mut users = self.users.write().await;
        match users.get_mut(email) {
            Some(user) if user.tracks(symbol) => {
                user.stocks.retain(|s| s != symbol);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

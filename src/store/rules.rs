//! RuleStore — CRUD for forwarding rules and their addresses/filters.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use libsql::params;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::rules::{FilterKind, ForwardingFilter, ForwardingRule, NewRule};
use crate::store::db::Database;

/// Persistent rule storage.
///
/// Rules own their addresses and filters: child rows are written in the same
/// transaction as the rule and removed by `ON DELETE CASCADE`.
pub struct RuleStore {
    db: Arc<Database>,
}

impl RuleStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Load every rule with its addresses and filters.
    ///
    /// Holds the database gate across the three reads so a concurrent rule
    /// insert can never yield a rule with half its children.
    pub async fn get_all(&self) -> Result<Vec<ForwardingRule>, DatabaseError> {
        let _guard = self.db.exclusive().await;
        self.load_all().await
    }

    /// Load a single rule, or `None`.
    pub async fn get(&self, id: Uuid) -> Result<Option<ForwardingRule>, DatabaseError> {
        let _guard = self.db.exclusive().await;
        let rules = self.load_all().await?;
        Ok(rules.into_iter().find(|r| r.id == id))
    }

    /// Create a rule together with its addresses and filters.
    pub async fn add(&self, new: NewRule) -> Result<ForwardingRule, DatabaseError> {
        let _guard = self.db.exclusive().await;
        let conn = self.db.conn();

        let id = Uuid::new_v4();
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin rule insert: {e}")))?;

        tx.execute(
            "INSERT INTO forwarding_rules (id, name, type_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id.to_string(), new.name.clone(), new.type_key.clone(), now_str.clone(), now_str.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert rule: {e}")))?;

        let mut addresses: Vec<String> = Vec::new();
        for address in &new.addresses {
            tx.execute(
                "INSERT OR IGNORE INTO rule_addresses (rule_id, address) VALUES (?1, ?2)",
                params![id.to_string(), address.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert rule address: {e}")))?;
            if !addresses.contains(address) {
                addresses.push(address.clone());
            }
        }

        let mut filters: Vec<ForwardingFilter> = Vec::new();
        for f in &new.filters {
            let filter_id = Uuid::new_v4();
            tx.execute(
                "INSERT INTO rule_filters (id, rule_id, filter_type, filter_text, ignores_case)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    filter_id.to_string(),
                    id.to_string(),
                    filter_kind_to_str(f.kind),
                    f.text.clone(),
                    f.ignore_case as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert rule filter: {e}")))?;
            filters.push(ForwardingFilter {
                id: filter_id,
                kind: f.kind,
                text: f.text.clone(),
                ignore_case: f.ignore_case,
            });
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit rule insert: {e}")))?;

        info!(rule_id = %id, name = %new.name, "Forwarding rule created");
        Ok(ForwardingRule {
            id,
            name: new.name,
            type_key: new.type_key,
            addresses,
            filters,
            created_at: now,
        })
    }

    /// Delete a rule. Addresses and filters go with it (cascade).
    ///
    /// Returns `false` if no rule had that id.
    pub async fn delete(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let affected = self
            .db
            .conn()
            .execute(
                "DELETE FROM forwarding_rules WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete rule: {e}")))?;

        if affected > 0 {
            info!(rule_id = %id, "Forwarding rule deleted");
        }
        Ok(affected > 0)
    }

    /// Attach an address to a rule. Adding one that is already present is a
    /// no-op.
    pub async fn apply_address(&self, rule_id: Uuid, address: &str) -> Result<(), DatabaseError> {
        self.ensure_rule_exists(rule_id).await?;
        self.db
            .conn()
            .execute(
                "INSERT OR IGNORE INTO rule_addresses (rule_id, address) VALUES (?1, ?2)",
                params![rule_id.to_string(), address],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("apply address: {e}")))?;
        debug!(rule_id = %rule_id, address = %address, "Address applied to rule");
        Ok(())
    }

    /// Detach an address from a rule. Removing an absent one is a no-op.
    pub async fn remove_address(&self, rule_id: Uuid, address: &str) -> Result<(), DatabaseError> {
        self.ensure_rule_exists(rule_id).await?;
        self.db
            .conn()
            .execute(
                "DELETE FROM rule_addresses WHERE rule_id = ?1 AND address = ?2",
                params![rule_id.to_string(), address],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("remove address: {e}")))?;
        debug!(rule_id = %rule_id, address = %address, "Address removed from rule");
        Ok(())
    }

    /// Add a filter to a rule.
    pub async fn add_filter(
        &self,
        rule_id: Uuid,
        kind: FilterKind,
        text: &str,
        ignore_case: bool,
    ) -> Result<ForwardingFilter, DatabaseError> {
        self.ensure_rule_exists(rule_id).await?;
        let filter_id = Uuid::new_v4();
        self.db
            .conn()
            .execute(
                "INSERT INTO rule_filters (id, rule_id, filter_type, filter_text, ignores_case)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    filter_id.to_string(),
                    rule_id.to_string(),
                    filter_kind_to_str(kind),
                    text,
                    ignore_case as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add filter: {e}")))?;

        debug!(rule_id = %rule_id, filter_id = %filter_id, kind = kind.label(), "Filter added");
        Ok(ForwardingFilter {
            id: filter_id,
            kind,
            text: text.to_string(),
            ignore_case,
        })
    }

    /// Remove a filter by its own id. Returns `false` if it did not exist.
    pub async fn remove_filter(&self, filter_id: Uuid) -> Result<bool, DatabaseError> {
        let affected = self
            .db
            .conn()
            .execute(
                "DELETE FROM rule_filters WHERE id = ?1",
                params![filter_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("remove filter: {e}")))?;
        Ok(affected > 0)
    }

    async fn ensure_rule_exists(&self, rule_id: Uuid) -> Result<(), DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT COUNT(*) FROM forwarding_rules WHERE id = ?1",
                params![rule_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("check rule: {e}")))?;

        let count: i64 = match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read rule check: {e}")))?
        {
            Some(row) => row.get(0).unwrap_or(0),
            None => 0,
        };

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "forwarding_rule".into(),
                id: rule_id.to_string(),
            });
        }
        Ok(())
    }

    /// Inner load without locking; callers hold the gate.
    async fn load_all(&self) -> Result<Vec<ForwardingRule>, DatabaseError> {
        let conn = self.db.conn();

        let mut rules: Vec<ForwardingRule> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        let mut rows = conn
            .query(
                "SELECT id, name, type_key, created_at FROM forwarding_rules
                 ORDER BY created_at ASC, id ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load rules: {e}")))?;

        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("rule id column: {e}")))?;
            let name: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("rule name column: {e}")))?;
            let type_key: String = row
                .get(2)
                .map_err(|e| DatabaseError::Query(format!("rule type_key column: {e}")))?;
            let created_str: String = row
                .get(3)
                .map_err(|e| DatabaseError::Query(format!("rule created_at column: {e}")))?;

            let id = Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil());
            index.insert(id_str, rules.len());
            rules.push(ForwardingRule {
                id,
                name,
                type_key,
                addresses: Vec::new(),
                filters: Vec::new(),
                created_at: super::parse_datetime(&created_str),
            });
        }

        let mut rows = conn
            .query(
                "SELECT rule_id, address FROM rule_addresses ORDER BY address ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load rule addresses: {e}")))?;

        while let Ok(Some(row)) = rows.next().await {
            let rule_id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("address rule_id column: {e}")))?;
            let address: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("address column: {e}")))?;
            if let Some(&i) = index.get(&rule_id) {
                rules[i].addresses.push(address);
            }
        }

        let mut rows = conn
            .query(
                "SELECT id, rule_id, filter_type, filter_text, ignores_case
                 FROM rule_filters ORDER BY rowid ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load rule filters: {e}")))?;

        while let Ok(Some(row)) = rows.next().await {
            let filter_id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("filter id column: {e}")))?;
            let rule_id: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("filter rule_id column: {e}")))?;
            let kind_str: String = row
                .get(2)
                .map_err(|e| DatabaseError::Query(format!("filter_type column: {e}")))?;
            let text: String = row
                .get(3)
                .map_err(|e| DatabaseError::Query(format!("filter_text column: {e}")))?;
            let ignores_case: i64 = row
                .get(4)
                .map_err(|e| DatabaseError::Query(format!("ignores_case column: {e}")))?;

            if let Some(&i) = index.get(&rule_id) {
                rules[i].filters.push(ForwardingFilter {
                    id: Uuid::parse_str(&filter_id).unwrap_or_else(|_| Uuid::nil()),
                    kind: str_to_filter_kind(&kind_str),
                    text,
                    ignore_case: ignores_case != 0,
                });
            }
        }

        Ok(rules)
    }
}

/// Convert a FilterKind to its DB string.
fn filter_kind_to_str(kind: FilterKind) -> &'static str {
    match kind {
        FilterKind::Include => "INCLUDE",
        FilterKind::Exclude => "EXCLUDE",
    }
}

/// Parse a filter type string from the DB.
fn str_to_filter_kind(s: &str) -> FilterKind {
    match s {
        "EXCLUDE" => FilterKind::Exclude,
        _ => FilterKind::Include,
    }
}

//! Table schema introspection and peer-schema compatibility.

use crate::error::StoreError;
use borsh::{BorshDeserialize, BorshSerialize};
use rusqlite::Connection;

/// One column as reported by `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Declared type, uppercased.
    pub type_name: String,
    pub not_null: bool,
    pub default: Option<String>,
    /// 1-based position within the primary key, 0 if not part of it.
    pub pk_index: u32,
}

/// Schema of one user table, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// Introspect a table. An unknown table yields an empty column list.
    pub fn read(conn: &Connection, table: &str) -> Result<Self, StoreError> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let columns = stmt
            .query_map([], |row| {
                Ok(ColumnDef {
                    name: row.get::<_, String>(1)?,
                    type_name: row.get::<_, String>(2)?.to_ascii_uppercase(),
                    not_null: row.get::<_, i64>(3)? != 0,
                    default: row.get::<_, Option<String>>(4)?,
                    pk_index: row.get::<_, i64>(5)? as u32,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            table: table.to_string(),
            columns,
        })
    }

    pub fn exists(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Primary-key columns in key order.
    pub fn pk_columns(&self) -> Vec<&ColumnDef> {
        let mut pks: Vec<&ColumnDef> = self.columns.iter().filter(|c| c.pk_index > 0).collect();
        pks.sort_by_key(|c| c.pk_index);
        pks
    }

    /// A peer schema applies here when it extends ours column-for-column:
    /// shared columns must agree in name and type; trailing extras must be
    /// nullable or carry a default.
    pub fn check_extension(&self, peer: &TableSchema) -> Result<(), StoreError> {
        if peer.columns.len() < self.columns.len() {
            return Err(StoreError::SchemaMismatch(format!(
                "peer schema of {} has fewer columns",
                self.table
            )));
        }
        for (local, remote) in self.columns.iter().zip(peer.columns.iter()) {
            if local.name != remote.name {
                return Err(StoreError::SchemaMismatch(format!(
                    "column name mismatch: {} vs {}",
                    local.name, remote.name
                )));
            }
            if local.type_name != remote.type_name {
                return Err(StoreError::SchemaMismatch(format!(
                    "column type mismatch on {}: {} vs {}",
                    local.name, local.type_name, remote.type_name
                )));
            }
        }
        for extra in &peer.columns[self.columns.len()..] {
            if extra.not_null && extra.default.is_none() {
                return Err(StoreError::SchemaMismatch(format!(
                    "extra column {} is NOT NULL without default",
                    extra.name
                )));
            }
        }
        Ok(())
    }

    /// CREATE TABLE statement for a mirror carrying this schema.
    pub fn create_table_sql(&self, name: &str) -> String {
        let mut defs: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut def = format!("{} {}", quote_ident(&c.name), c.type_name);
                if c.not_null {
                    def.push_str(" NOT NULL");
                }
                if let Some(default) = &c.default {
                    def.push_str(" DEFAULT ");
                    def.push_str(default);
                }
                def
            })
            .collect();
        let pks = self.pk_columns();
        if !pks.is_empty() {
            defs.push(format!(
                "PRIMARY KEY ({})",
                pks.iter()
                    .map(|c| quote_ident(&c.name))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(name),
            defs.join(", ")
        )
    }
}

/// Double-quote an identifier for embedding in SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(cols: &[(&str, &str, bool, Option<&str>)]) -> TableSchema {
        TableSchema {
            table: "t".into(),
            columns: cols
                .iter()
                .enumerate()
                .map(|(i, (name, ty, not_null, default))| ColumnDef {
                    name: name.to_string(),
                    type_name: ty.to_string(),
                    not_null: *not_null,
                    default: default.map(str::to_string),
                    pk_index: if i == 0 { 1 } else { 0 },
                })
                .collect(),
        }
    }

    #[test]
    fn test_read_pragma() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER PRIMARY KEY NOT NULL, name TEXT, score REAL DEFAULT 1.5)",
        )
        .unwrap();
        let schema = TableSchema::read(&conn, "t").unwrap();
        assert!(schema.exists());
        assert_eq!(schema.columns.len(), 3);
        assert_eq!(schema.columns[0].name, "id");
        assert_eq!(schema.columns[0].pk_index, 1);
        assert_eq!(schema.columns[2].default.as_deref(), Some("1.5"));
        assert_eq!(schema.pk_columns().len(), 1);
    }

    #[test]
    fn test_identical_schema_is_compatible() {
        let local = schema(&[("id", "INTEGER", true, None), ("v", "TEXT", false, None)]);
        assert!(local.check_extension(&local.clone()).is_ok());
    }

    #[test]
    fn test_trailing_defaults_extension_applies() {
        let local = schema(&[("id", "INTEGER", true, None)]);
        let peer = schema(&[
            ("id", "INTEGER", true, None),
            ("extra", "TEXT", true, Some("'x'")),
            ("extra2", "INTEGER", false, None),
        ]);
        assert!(local.check_extension(&peer).is_ok());
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let local = schema(&[("id", "INTEGER", true, None)]);
        let peer = schema(&[("id", "TEXT", true, None)]);
        assert!(matches!(
            local.check_extension(&peer),
            Err(StoreError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_not_null_extra_without_default_rejected() {
        let local = schema(&[("id", "INTEGER", true, None)]);
        let peer = schema(&[("id", "INTEGER", true, None), ("e", "TEXT", true, None)]);
        assert!(matches!(
            local.check_extension(&peer),
            Err(StoreError::SchemaMismatch(_))
        ));
    }
}

//! Postgres DDL for a module's messaging tables.
//!
//! One schema per module holding the outbox, the inbox and both consumption
//! ledgers. All statements are idempotent (`IF NOT EXISTS`).

use courier_core::ModuleName;

use super::{MessageKind, MessageTable};

/// Statements creating the schema and all four tables of `module`, in order.
pub fn module_ddl(module: &ModuleName) -> Vec<String> {
    let mut statements = vec![format!("CREATE SCHEMA IF NOT EXISTS \"{module}\"")];
    for kind in [MessageKind::Outbox, MessageKind::Inbox] {
        statements.extend(table_ddl(&MessageTable::new(module.clone(), kind)));
    }
    statements
}

fn table_ddl(table: &MessageTable) -> Vec<String> {
    let messages = table.messages_relation();
    let consumers = table.consumers_relation();
    let id_column = table.message_id_column();
    let kind = table.kind().as_str();

    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {messages} (
                id UUID PRIMARY KEY,
                type TEXT NOT NULL,
                content JSONB NOT NULL,
                occurred_on_utc TIMESTAMPTZ NOT NULL,
                processed_on_utc TIMESTAMPTZ NULL,
                error TEXT NULL,
                attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'processed', 'failed'))
            )
            "#
        ),
        format!(
            r#"
            CREATE INDEX IF NOT EXISTS idx_{kind}_messages_unprocessed
                ON {messages} (occurred_on_utc, id)
                WHERE processed_on_utc IS NULL AND status = 'pending'
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {consumers} (
                {id_column} UUID NOT NULL,
                name TEXT NOT NULL,
                consumed_on_utc TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY ({id_column}, name)
            )
            "#
        ),
    ]
}

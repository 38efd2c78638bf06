//! EmailStore — CRUD operations for emails, logs, tool calls, attachments.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use crate::email::Attachment;
use crate::error::StoreError;
use crate::store::db::Database;
use crate::store::models::{
    EmailFilter, EmailStats, EmailStatus, ProcessingLog, StoredAttachment, StoredEmail,
    ToolCallRecord,
};

const EMAIL_COLUMNS: &str = "id, message_id, from_addr, to_addrs, cc_addrs, subject,
        text_body, html_body, raw_message, headers, attachments,
        received_at, processed_at, mailbox_name, status";

/// Persistent email storage backed by SQLite.
pub struct EmailStore {
    db: Arc<Database>,
}

impl EmailStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new email record. Assigns `email.id` from the new row.
    pub fn save_email(&self, email: &mut StoredEmail) -> Result<(), StoreError> {
        let to_json = serde_json::to_string(&email.to_addrs)?;
        let cc_json = serde_json::to_string(&email.cc_addrs)?;

        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO emails (
                message_id, from_addr, to_addrs, cc_addrs, subject,
                text_body, html_body, raw_message, headers, attachments,
                received_at, processed_at, mailbox_name, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                email.message_id,
                email.from_addr,
                to_json,
                cc_json,
                email.subject,
                email.text_body,
                email.html_body,
                email.raw_message,
                email.headers,
                email.attachments,
                email.received_at.to_rfc3339(),
                email.processed_at.map(|t| t.to_rfc3339()),
                email.mailbox_name,
                email.status.as_str(),
            ],
        )?;
        email.id = conn.last_insert_rowid();
        debug!(email_id = email.id, message_id = %email.message_id, "Email saved");
        Ok(())
    }

    /// Retrieve an email by id.
    pub fn get_email(&self, id: i64) -> Result<Option<StoredEmail>, StoreError> {
        let conn = self.db.conn();
        let email = conn
            .query_row(
                &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE id = ?1"),
                params![id],
                row_to_email,
            )
            .optional()?;
        Ok(email)
    }

    /// Advance an email's status. Terminal states stamp `processed_at`.
    pub fn update_status(&self, id: i64, status: EmailStatus) -> Result<(), StoreError> {
        let processed_at = if status.is_terminal() {
            Some(Utc::now().to_rfc3339())
        } else {
            None
        };
        let conn = self.db.conn();
        let changed = conn.execute(
            "UPDATE emails SET status = ?1, processed_at = ?2 WHERE id = ?3",
            params![status.as_str(), processed_at, id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound { id });
        }
        Ok(())
    }

    /// Record the mailbox the router selected.
    pub fn set_mailbox(&self, id: i64, mailbox: &str) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE emails SET mailbox_name = ?1 WHERE id = ?2",
            params![mailbox, id],
        )?;
        Ok(())
    }

    /// List emails matching the filter, newest first.
    pub fn list_emails(&self, filter: &EmailFilter) -> Result<Vec<StoredEmail>, StoreError> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            args.push(Box::new(status.as_str().to_string()));
        }
        if let Some(ref mailbox) = filter.mailbox_name {
            conditions.push("mailbox_name = ?");
            args.push(Box::new(mailbox.clone()));
        }
        if let Some(from) = filter.from_date {
            conditions.push("received_at >= ?");
            args.push(Box::new(from.to_rfc3339()));
        }
        if let Some(to) = filter.to_date {
            conditions.push("received_at <= ?");
            args.push(Box::new(to.to_rfc3339()));
        }

        let mut query = format!("SELECT {EMAIL_COLUMNS} FROM emails");
        if !conditions.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conditions.join(" AND "));
        }
        query.push_str(" ORDER BY received_at DESC");
        if filter.limit > 0 {
            query.push_str(&format!(" LIMIT {}", filter.limit));
        }
        if filter.offset > 0 {
            query.push_str(&format!(" OFFSET {}", filter.offset));
        }

        let conn = self.db.conn();
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            row_to_email,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Emails still awaiting processing, oldest eligible first by recency.
    pub fn get_pending(&self, limit: usize) -> Result<Vec<StoredEmail>, StoreError> {
        self.list_emails(&EmailFilter {
            status: Some(EmailStatus::Pending),
            limit,
            ..Default::default()
        })
    }

    /// Delete an email row. Child rows cascade.
    pub fn delete_email(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute("DELETE FROM emails WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Store a processing log entry, returning its id.
    pub fn save_processing_log(&self, log: &ProcessingLog) -> Result<i64, StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO processing_logs (email_id, step, input, output, error, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                log.email_id,
                log.step,
                log.input,
                log.output,
                log.error,
                log.duration_ms,
                log.created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Store a tool call record, returning its id.
    pub fn save_tool_call(&self, call: &ToolCallRecord) -> Result<i64, StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO tool_calls (email_id, tool_name, arguments, result, error, duration_ms, called_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                call.email_id,
                call.tool_name,
                call.arguments,
                call.result,
                call.error,
                call.duration_ms,
                call.called_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All processing logs for an email, in creation order.
    pub fn get_logs(&self, email_id: i64) -> Result<Vec<ProcessingLog>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, email_id, step, input, output, error, duration_ms, created_at
             FROM processing_logs WHERE email_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![email_id], |row| {
            Ok(ProcessingLog {
                id: row.get(0)?,
                email_id: row.get(1)?,
                step: row.get(2)?,
                input: row.get(3)?,
                output: row.get(4)?,
                error: row.get(5)?,
                duration_ms: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
                created_at: parse_ts(row.get(7)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// All tool calls for an email, in call order.
    pub fn get_tool_calls(&self, email_id: i64) -> Result<Vec<ToolCallRecord>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, email_id, tool_name, arguments, result, error, duration_ms, called_at
             FROM tool_calls WHERE email_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![email_id], |row| {
            Ok(ToolCallRecord {
                id: row.get(0)?,
                email_id: row.get(1)?,
                tool_name: row.get(2)?,
                arguments: row.get(3)?,
                result: row.get(4)?,
                error: row.get(5)?,
                duration_ms: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
                called_at: parse_ts(row.get(7)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Store an attachment's bytes for an email.
    pub fn save_attachment(&self, email_id: i64, att: &Attachment) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO attachments (email_id, filename, content_type, size, content_id, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                email_id,
                att.filename,
                att.content_type,
                att.size,
                att.content_id,
                att.data,
            ],
        )?;
        Ok(())
    }

    /// All attachments for an email.
    pub fn get_attachments(&self, email_id: i64) -> Result<Vec<StoredAttachment>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, email_id, filename, content_type, size, content_id, data
             FROM attachments WHERE email_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![email_id], |row| {
            Ok(StoredAttachment {
                id: row.get(0)?,
                email_id: row.get(1)?,
                filename: row.get(2)?,
                content_type: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                size: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                content_id: row.get(5)?,
                data: row.get::<_, Option<Vec<u8>>>(6)?.unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Email processing statistics.
    pub fn stats(&self) -> Result<EmailStats, StoreError> {
        let conn = self.db.conn();
        let count = |sql: &str| -> Result<i64, rusqlite::Error> {
            conn.query_row(sql, [], |row| row.get(0))
        };
        Ok(EmailStats {
            total_emails: count("SELECT COUNT(*) FROM emails")?,
            pending_emails: count("SELECT COUNT(*) FROM emails WHERE status = 'pending'")?,
            processed_emails: count("SELECT COUNT(*) FROM emails WHERE status = 'completed'")?,
            failed_emails: count("SELECT COUNT(*) FROM emails WHERE status = 'failed'")?,
        })
    }
}

fn row_to_email(row: &Row<'_>) -> rusqlite::Result<StoredEmail> {
    let to_json: String = row.get(3)?;
    let cc_json: Option<String> = row.get(4)?;
    let status: String = row.get(14)?;
    Ok(StoredEmail {
        id: row.get(0)?,
        message_id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        from_addr: row.get(2)?,
        to_addrs: serde_json::from_str(&to_json).unwrap_or_default(),
        cc_addrs: cc_json
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        subject: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        text_body: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        html_body: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        raw_message: row.get::<_, Option<Vec<u8>>>(8)?.unwrap_or_default(),
        headers: row.get(9)?,
        attachments: row.get(10)?,
        received_at: parse_ts(row.get(11)?),
        processed_at: row.get::<_, Option<String>>(12)?.map(parse_ts),
        mailbox_name: row.get(13)?,
        status: EmailStatus::parse(&status).unwrap_or(EmailStatus::Pending),
    })
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

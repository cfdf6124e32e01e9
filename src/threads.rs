//! Thread store.
//!
//! Persists conversation threads and their questions in SQLite. A question's
//! `order` is its position within the thread, assigned on insert; every
//! write to a question also bumps its thread's `updated_at`.

use anyhow::{bail, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{Question, QuestionStatus, Thread, ThreadSummary};

/// Fields of a question being appended to a thread.
#[derive(Debug, Clone)]
pub struct NewQuestion {
    pub resources: Vec<String>,
    pub provider: String,
    pub model: String,
    pub prompt: String,
    pub answer: String,
    pub status: QuestionStatus,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct QuestionPatch {
    pub answer: Option<String>,
    pub status: Option<QuestionStatus>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct ThreadStore {
    pool: SqlitePool,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

const QUESTION_COLUMNS: &str = r#"id, thread_id, resources_json, provider, model, prompt, answer, status, metadata_json, created_at, "order""#;

fn question_from_row(row: &SqliteRow) -> Result<Question> {
    let resources_json: String = row.get("resources_json");
    let metadata_json: String = row.get("metadata_json");
    let status: String = row.get("status");
    let status = match QuestionStatus::parse(&status) {
        Some(status) => status,
        None => bail!("unknown question status: {}", status),
    };

    Ok(Question {
        id: row.get("id"),
        thread_id: row.get("thread_id"),
        order: row.get("order"),
        resources: serde_json::from_str(&resources_json)?,
        provider: row.get("provider"),
        model: row.get("model"),
        prompt: row.get("prompt"),
        answer: row.get("answer"),
        status,
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({})),
        created_at: row.get("created_at"),
    })
}

fn union_sorted<'a>(lists: impl Iterator<Item = &'a str>) -> Result<Vec<String>> {
    let mut all = Vec::new();
    for json in lists {
        let resources: Vec<String> = serde_json::from_str(json)?;
        all.extend(resources);
    }
    all.sort();
    all.dedup();
    Ok(all)
}

impl ThreadStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create_thread(&self) -> Result<Thread> {
        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        sqlx::query("INSERT INTO threads (id, created_at, updated_at) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(Thread {
            id,
            created_at: now,
            updated_at: now,
            questions: Vec::new(),
        })
    }

    /// Appends a question at the end of the thread.
    pub async fn append_question(&self, thread_id: &str, question: NewQuestion) -> Result<Question> {
        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        let resources_json = serde_json::to_string(&question.resources)?;
        let metadata_json = serde_json::to_string(&question.metadata)?;

        let mut tx = self.pool.begin().await?;

        // touch the thread first so the transaction holds the write lock
        // before the order is computed
        let touched = sqlx::query("UPDATE threads SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            bail!("thread not found: {}", thread_id);
        }

        let order: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM questions WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(&format!(
            "INSERT INTO questions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            QUESTION_COLUMNS
        ))
        .bind(&id)
        .bind(thread_id)
        .bind(&resources_json)
        .bind(&question.provider)
        .bind(&question.model)
        .bind(&question.prompt)
        .bind(&question.answer)
        .bind(question.status.as_str())
        .bind(&metadata_json)
        .bind(now)
        .bind(order)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Question {
            id,
            thread_id: thread_id.to_string(),
            order,
            resources: question.resources,
            provider: question.provider,
            model: question.model,
            prompt: question.prompt,
            answer: question.answer,
            status: question.status,
            metadata: question.metadata,
            created_at: now,
        })
    }

    pub async fn update_question(&self, id: &str, patch: QuestionPatch) -> Result<Question> {
        let now = now_millis();
        let metadata_json = patch
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE questions SET answer = COALESCE(?, answer), status = COALESCE(?, status), \
             metadata_json = COALESCE(?, metadata_json) WHERE id = ?",
        )
        .bind(patch.answer.as_deref())
        .bind(patch.status.map(|s| s.as_str()))
        .bind(metadata_json.as_deref())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            bail!("question not found: {}", id);
        }

        sqlx::query(
            "UPDATE threads SET updated_at = ? WHERE id = (SELECT thread_id FROM questions WHERE id = ?)",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!("SELECT {} FROM questions WHERE id = ?", QUESTION_COLUMNS))
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        let question = question_from_row(&row)?;

        tx.commit().await?;
        Ok(question)
    }

    /// A thread with its questions in order, or `None` if it does not exist.
    pub async fn get_thread(&self, id: &str) -> Result<Option<Thread>> {
        let row = sqlx::query("SELECT id, created_at, updated_at FROM threads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let question_rows = sqlx::query(&format!(
            r#"SELECT {} FROM questions WHERE thread_id = ? ORDER BY "order" ASC"#,
            QUESTION_COLUMNS
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let questions = question_rows
            .iter()
            .map(question_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(Thread {
            id: row.get("id"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            questions,
        }))
    }

    /// Every thread, most recently updated first.
    pub async fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        let rows = sqlx::query(
            "SELECT id, created_at, updated_at FROM threads ORDER BY updated_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let question_rows = sqlx::query(
            r#"SELECT thread_id, resources_json, prompt FROM questions ORDER BY thread_id, "order" ASC"#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.get("id");
            let questions: Vec<&SqliteRow> = question_rows
                .iter()
                .filter(|q| q.get::<String, _>("thread_id") == id)
                .collect();
            let resources = union_sorted(
                questions
                    .iter()
                    .map(|q| q.get::<&str, _>("resources_json")),
            )?;
            summaries.push(ThreadSummary {
                id,
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
                question_count: questions.len() as i64,
                resources,
                title: questions.first().map(|q| q.get("prompt")),
            });
        }
        Ok(summaries)
    }

    /// Deletes a thread and its questions. Returns whether it existed.
    pub async fn delete_thread(&self, id: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM threads WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }

    /// Sorted union of the resources introduced by the thread's questions.
    pub async fn thread_resources(&self, id: &str) -> Result<Vec<String>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT resources_json FROM questions WHERE thread_id = ?")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;
        union_sorted(rows.iter().map(String::as_str))
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, QueryBuilder, SqliteConnection};

/// Denormalized identity used for addressing. The bot's registration flow
/// owns these rows; the search cache holds a time-bounded copy.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone)]
pub struct User {
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub course_stream: Option<String>,
    pub hackathon: bool,
}

impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        self.user_id == other.user_id
    }
}

const COLUMNS: &str = "user_id, username, first_name, course_stream, hackathon";

impl User {
    pub async fn upsert(db: &mut SqliteConnection, user: &User, now: DateTime<Utc>) -> eyre::Result<()> {
        sqlx::query(
            "INSERT INTO users (user_id, username, first_name, course_stream, hackathon, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (user_id) DO UPDATE SET
                username = excluded.username,
                first_name = excluded.first_name,
                course_stream = excluded.course_stream,
                hackathon = excluded.hackathon",
        )
        .bind(user.user_id)
        .bind(user.username.as_deref())
        .bind(user.first_name.as_deref())
        .bind(user.course_stream.as_deref())
        .bind(user.hackathon)
        .bind(now)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn list_all(db: &mut SqliteConnection) -> eyre::Result<Vec<User>> {
        Ok(
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM users ORDER BY user_id"))
                .fetch_all(db)
                .await?,
        )
    }

    /// Looks up the given ids; absent ids are simply missing from the
    /// result, the resolver decides whether that is an error.
    pub async fn by_ids(db: &mut SqliteConnection, ids: &[i64]) -> eyre::Result<Vec<User>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM users WHERE user_id IN ("));

        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        query.push(") ORDER BY user_id");

        Ok(query.build_query_as().fetch_all(db).await?)
    }

    pub async fn by_stream(
        db: &mut SqliteConnection,
        stream: impl AsRef<str>,
    ) -> eyre::Result<Vec<User>> {
        Ok(sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM users WHERE course_stream = $1 ORDER BY user_id"
        ))
        .bind(stream.as_ref())
        .fetch_all(db)
        .await?)
    }

    pub async fn non_course(db: &mut SqliteConnection) -> eyre::Result<Vec<User>> {
        Ok(sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM users WHERE course_stream IS NULL ORDER BY user_id"
        ))
        .fetch_all(db)
        .await?)
    }

    pub async fn hackathon_participants(db: &mut SqliteConnection) -> eyre::Result<Vec<User>> {
        Ok(sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM users WHERE hackathon = 1 ORDER BY user_id"
        ))
        .fetch_all(db)
        .await?)
    }

    pub async fn streams(db: &mut SqliteConnection) -> eyre::Result<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT DISTINCT course_stream FROM users
             WHERE course_stream IS NOT NULL ORDER BY course_stream",
        )
        .fetch_all(db)
        .await?)
    }
}

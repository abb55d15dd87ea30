//! Database operations for Crosspost

use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;

use crate::error::{DbError, Result};
use crate::types::{AccountProfile, DeliveryStatus, InsertOutcome, Message, TrackedAccount};

/// Durable records for tracked accounts, profiles and messages
#[derive(Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    /// Open (creating if needed) the database and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // mode=rwc creates the file when missing
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    // ------------------------------------------------------------------
    // Tracked accounts
    // ------------------------------------------------------------------

    pub async fn track_account(&self, account: &TrackedAccount) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO tracked_accounts (platform_id, handle, first_tracked_at, last_checked_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&account.platform_id)
        .bind(&account.handle)
        .bind(account.first_tracked_at)
        .bind(account.last_checked_at)
        .execute(&self.pool)
        .await;

        insert_outcome(result)
    }

    pub async fn tracked_accounts(&self) -> Result<Vec<TrackedAccount>> {
        let rows = sqlx::query(
            r#"
            SELECT platform_id, handle, first_tracked_at, last_checked_at
            FROM tracked_accounts ORDER BY first_tracked_at, handle
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| TrackedAccount {
                platform_id: r.get("platform_id"),
                handle: r.get("handle"),
                first_tracked_at: r.get("first_tracked_at"),
                last_checked_at: r.get("last_checked_at"),
            })
            .collect())
    }

    /// Stamp `last_checked_at` on every tracked account
    pub async fn touch_accounts(&self, checked_at: i64) -> Result<u64> {
        let result = sqlx::query("UPDATE tracked_accounts SET last_checked_at = ?")
            .bind(checked_at)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected())
    }

    pub async fn rename_account(&self, platform_id: &str, handle: &str) -> Result<()> {
        sqlx::query("UPDATE tracked_accounts SET handle = ? WHERE platform_id = ?")
            .bind(handle)
            .bind(platform_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------

    pub async fn upsert_profile(&self, profile: &AccountProfile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO account_profiles
                (platform_id, handle, name, description, profile_image_url, profile_image_path, added_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(platform_id) DO UPDATE SET
                handle = excluded.handle,
                name = excluded.name,
                description = excluded.description,
                profile_image_url = excluded.profile_image_url,
                profile_image_path = excluded.profile_image_path,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&profile.platform_id)
        .bind(&profile.handle)
        .bind(&profile.name)
        .bind(&profile.description)
        .bind(&profile.profile_image_url)
        .bind(&profile.profile_image_path)
        .bind(profile.added_at)
        .bind(profile.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::classify)?;
        Ok(())
    }

    pub async fn get_profile(&self, platform_id: &str) -> Result<Option<AccountProfile>> {
        let row = sqlx::query(
            r#"
            SELECT platform_id, handle, name, description, profile_image_url, profile_image_path, added_at, updated_at
            FROM account_profiles WHERE platform_id = ?
            "#,
        )
        .bind(platform_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| profile_from_row(&r)))
    }

    pub async fn profiles(&self) -> Result<Vec<AccountProfile>> {
        let rows = sqlx::query(
            r#"
            SELECT platform_id, handle, name, description, profile_image_url, profile_image_path, added_at, updated_at
            FROM account_profiles ORDER BY handle
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(profile_from_row).collect())
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Insert a message; an existing `platform_post_id` is a no-op
    pub async fn insert_message(&self, message: &Message) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages (
                platform_post_id, account_id, author_name, author_handle, body_text,
                posted_at, source_url, hashtags, media_urls, media_kinds, local_media_paths,
                delivery_status, delivered_at, destination_post_id, error_message, enter_time
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.platform_post_id)
        .bind(&message.account_id)
        .bind(&message.author_name)
        .bind(&message.author_handle)
        .bind(&message.body_text)
        .bind(message.posted_at)
        .bind(&message.source_url)
        .bind(encode_list(&message.hashtags))
        .bind(encode_list(&message.media_urls))
        .bind(encode_list(&message.media_kinds))
        .bind(encode_list(&message.local_media_paths))
        .bind(message.delivery_status.code())
        .bind(message.delivered_at)
        .bind(&message.destination_post_id)
        .bind(&message.error_message)
        .bind(message.enter_time)
        .execute(&self.pool)
        .await;

        insert_outcome(result)
    }

    pub async fn get_message(&self, platform_post_id: &str) -> Result<Option<Message>> {
        let row = sqlx::query(&format!("{} WHERE platform_post_id = ?", MESSAGE_SELECT))
            .bind(platform_post_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.map(|r| message_from_row(&r)).transpose()
    }

    /// Messages in `status`, oldest post first
    pub async fn messages_by_status(&self, status: DeliveryStatus) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "{} WHERE delivery_status = ? ORDER BY posted_at, platform_post_id",
            MESSAGE_SELECT
        ))
        .bind(status.code())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(message_from_row).collect()
    }

    pub async fn messages_by_handle_and_status(
        &self,
        handle: &str,
        status: DeliveryStatus,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "{} WHERE author_handle = ? AND delivery_status = ? ORDER BY posted_at, platform_post_id",
            MESSAGE_SELECT
        ))
        .bind(handle)
        .bind(status.code())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(message_from_row).collect()
    }

    pub async fn set_local_media_paths(&self, platform_post_id: &str, paths: &[String]) -> Result<()> {
        sqlx::query("UPDATE messages SET local_media_paths = ? WHERE platform_post_id = ?")
            .bind(encode_list(paths))
            .bind(platform_post_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// PENDING → DELIVERED; returns false if the message was not pending
    pub async fn mark_delivered(
        &self,
        platform_post_id: &str,
        destination_post_id: &str,
        delivered_at: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET delivery_status = ?, destination_post_id = ?, delivered_at = ?, error_message = NULL
            WHERE platform_post_id = ? AND delivery_status = ?
            "#,
        )
        .bind(DeliveryStatus::Delivered.code())
        .bind(destination_post_id)
        .bind(delivered_at)
        .bind(platform_post_id)
        .bind(DeliveryStatus::Pending.code())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected() == 1)
    }

    /// PENDING → FAILED with the error text; returns false if not pending
    pub async fn mark_failed(&self, platform_post_id: &str, error: &str, failed_at: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET delivery_status = ?, error_message = ?, delivered_at = ?
            WHERE platform_post_id = ? AND delivery_status = ?
            "#,
        )
        .bind(DeliveryStatus::Failed.code())
        .bind(error)
        .bind(failed_at)
        .bind(platform_post_id)
        .bind(DeliveryStatus::Pending.code())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected() == 1)
    }

    /// Count of messages per status
    pub async fn status_counts(&self) -> Result<Vec<(DeliveryStatus, i64)>> {
        let rows = sqlx::query(
            "SELECT delivery_status, COUNT(*) AS n FROM messages GROUP BY delivery_status ORDER BY delivery_status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .filter_map(|r| {
                DeliveryStatus::from_code(r.get("delivery_status")).map(|s| (s, r.get::<i64, _>("n")))
            })
            .collect())
    }
}

const MESSAGE_SELECT: &str = r#"
    SELECT platform_post_id, account_id, author_name, author_handle, body_text,
           posted_at, source_url, hashtags, media_urls, media_kinds, local_media_paths,
           delivery_status, delivered_at, destination_post_id, error_message, enter_time
    FROM messages
"#;

fn insert_outcome(
    result: std::result::Result<sqlx::sqlite::SqliteQueryResult, sqlx::Error>,
) -> Result<InsertOutcome> {
    match result {
        Ok(_) => Ok(InsertOutcome::Inserted),
        Err(e) => match DbError::classify(e) {
            DbError::IntegrityViolation(_) => Ok(InsertOutcome::Duplicate),
            other => Err(other.into()),
        },
    }
}

// List columns are stored as JSON arrays
fn encode_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn decode_list(column: &str, raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw).map_err(|e| {
        DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("column {} holds invalid JSON: {}", column, e),
        ))
        .into()
    })
}

fn profile_from_row(r: &SqliteRow) -> AccountProfile {
    AccountProfile {
        platform_id: r.get("platform_id"),
        handle: r.get("handle"),
        name: r.get("name"),
        description: r.get("description"),
        profile_image_url: r.get("profile_image_url"),
        profile_image_path: r.get("profile_image_path"),
        added_at: r.get("added_at"),
        updated_at: r.get("updated_at"),
    }
}

fn message_from_row(r: &SqliteRow) -> Result<Message> {
    let code: i64 = r.get("delivery_status");
    let delivery_status = DeliveryStatus::from_code(code).ok_or_else(|| {
        DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown delivery status {}", code),
        ))
    })?;

    Ok(Message {
        platform_post_id: r.get("platform_post_id"),
        account_id: r.get("account_id"),
        author_name: r.get("author_name"),
        author_handle: r.get("author_handle"),
        body_text: r.get("body_text"),
        posted_at: r.get("posted_at"),
        source_url: r.get("source_url"),
        hashtags: decode_list("hashtags", r.get("hashtags"))?,
        media_urls: decode_list("media_urls", r.get("media_urls"))?,
        media_kinds: decode_list("media_kinds", r.get("media_kinds"))?,
        local_media_paths: decode_list("local_media_paths", r.get("local_media_paths"))?,
        delivery_status,
        delivered_at: r.get("delivered_at"),
        destination_post_id: r.get("destination_post_id"),
        error_message: r.get("error_message"),
        enter_time: r.get("enter_time"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CrosspostError;
    use tempfile::TempDir;

    async fn store() -> (TempDir, RecordStore) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("crosspost.db");
        let store = RecordStore::new(path.to_str().unwrap()).await.unwrap();
        (temp_dir, store)
    }

    fn message(id: &str, handle: &str, posted_at: i64) -> Message {
        Message {
            platform_post_id: id.to_string(),
            account_id: format!("uid-{}", handle),
            author_name: "Genshin Impact".to_string(),
            author_handle: handle.to_string(),
            body_text: "New banner".to_string(),
            posted_at,
            source_url: format!("https://twitter.com/{}/status/{}", handle, id),
            hashtags: vec!["GenshinImpact".to_string()],
            media_urls: vec!["https://pbs.twimg.com/media/a.jpg".to_string()],
            media_kinds: vec!["photo".to_string()],
            local_media_paths: Vec::new(),
            delivery_status: DeliveryStatus::Pending,
            delivered_at: None,
            destination_post_id: None,
            error_message: None,
            enter_time: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_database_initialization_with_invalid_path() {
        #[cfg(unix)]
        let invalid_path = "/tmp/test\0invalid.db";

        #[cfg(windows)]
        let invalid_path = "C:\\invalid<>path\\test.db";

        match RecordStore::new(invalid_path).await {
            Err(CrosspostError::Database(_)) => {}
            Err(other) => panic!("Expected database error, got {}", other),
            Ok(_) => panic!("Expected error for invalid path"),
        }
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_on_post_id() {
        let (_dir, store) = store().await;
        let first = message("100", "Genshin_7", 10);

        assert_eq!(store.insert_message(&first).await.unwrap(), InsertOutcome::Inserted);

        let mut again = first.clone();
        again.body_text = "changed".to_string();
        assert_eq!(store.insert_message(&again).await.unwrap(), InsertOutcome::Duplicate);

        let pending = store.messages_by_status(DeliveryStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].body_text, "New banner");
    }

    #[tokio::test]
    async fn test_message_round_trips_lists() {
        let (_dir, store) = store().await;
        store.insert_message(&message("100", "Genshin_7", 10)).await.unwrap();
        store
            .set_local_media_paths("100", &["/data/image/a.jpg".to_string()])
            .await
            .unwrap();

        let loaded = store.get_message("100").await.unwrap().unwrap();
        assert_eq!(loaded.hashtags, vec!["GenshinImpact".to_string()]);
        assert_eq!(loaded.media_kinds, vec!["photo".to_string()]);
        assert_eq!(loaded.local_media_paths, vec!["/data/image/a.jpg".to_string()]);
        assert!(store.get_message("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_transitions_only_leave_pending() {
        let (_dir, store) = store().await;
        store.insert_message(&message("1", "a", 10)).await.unwrap();
        store.insert_message(&message("2", "a", 20)).await.unwrap();

        assert!(store.mark_delivered("1", "4870001", 100).await.unwrap());
        assert!(store.mark_failed("2", "Posting failed: rejected", 100).await.unwrap());

        // terminal states do not move
        assert!(!store.mark_failed("1", "late failure", 200).await.unwrap());
        assert!(!store.mark_delivered("2", "x", 200).await.unwrap());

        let delivered = store.get_message("1").await.unwrap().unwrap();
        assert_eq!(delivered.delivery_status, DeliveryStatus::Delivered);
        assert_eq!(delivered.destination_post_id.as_deref(), Some("4870001"));
        assert_eq!(delivered.delivered_at, Some(100));

        let failed = store.get_message("2").await.unwrap().unwrap();
        assert_eq!(failed.delivery_status, DeliveryStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("Posting failed: rejected"));

        assert!(store.messages_by_status(DeliveryStatus::Pending).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_by_handle_and_status() {
        let (_dir, store) = store().await;
        store.insert_message(&message("1", "a", 30)).await.unwrap();
        store.insert_message(&message("2", "b", 20)).await.unwrap();
        store.insert_message(&message("3", "a", 10)).await.unwrap();

        let for_a = store
            .messages_by_handle_and_status("a", DeliveryStatus::Pending)
            .await
            .unwrap();
        let ids: Vec<&str> = for_a.iter().map(|m| m.platform_post_id.as_str()).collect();
        assert_eq!(ids, vec!["3", "1"]);

        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts, vec![(DeliveryStatus::Pending, 3)]);
    }

    #[tokio::test]
    async fn test_tracked_accounts_and_profiles() {
        let (_dir, store) = store().await;
        let account = TrackedAccount {
            platform_id: "1".to_string(),
            handle: "Genshin_7".to_string(),
            first_tracked_at: 5,
            last_checked_at: 5,
        };
        assert_eq!(store.track_account(&account).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.track_account(&account).await.unwrap(), InsertOutcome::Duplicate);

        assert_eq!(store.touch_accounts(50).await.unwrap(), 1);
        store.rename_account("1", "GenshinImpact").await.unwrap();
        let accounts = store.tracked_accounts().await.unwrap();
        assert_eq!(accounts[0].last_checked_at, 50);
        assert_eq!(accounts[0].handle, "GenshinImpact");

        let mut profile = AccountProfile {
            platform_id: "1".to_string(),
            handle: "Genshin_7".to_string(),
            name: "Genshin Impact".to_string(),
            description: None,
            profile_image_url: Some("https://pbs.twimg.com/a.jpg".to_string()),
            profile_image_path: None,
            added_at: 5,
            updated_at: 5,
        };
        store.upsert_profile(&profile).await.unwrap();
        profile.description = Some("official".to_string());
        profile.updated_at = 6;
        store.upsert_profile(&profile).await.unwrap();

        let loaded = store.get_profile("1").await.unwrap().unwrap();
        assert_eq!(loaded, profile);
        assert_eq!(store.profiles().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_keeps_records() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("crosspost.db");
        let path = path.to_str().unwrap();

        {
            let store = RecordStore::new(path).await.unwrap();
            store.insert_message(&message("1", "a", 10)).await.unwrap();
        }
        let store = RecordStore::new(path).await.unwrap();
        assert!(store.get_message("1").await.unwrap().is_some());
    }
}

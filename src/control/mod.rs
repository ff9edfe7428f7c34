//! The control store (spec §4.2) — the single process-wide database holding
//! users, API keys, projects, memberships, sync cursors, and the two
//! append-only audit streams (auth events, rate-limit events).
//!
//! One `ControlStore` is constructed at startup and shared (via `Arc`) by
//! every request handler; the project journals (component C) are a
//! different, per-project store living in `crate::journal`.

use anyhow::Result;
use chrono::Utc;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

use crate::auth::Role;
use crate::retry::{retry_sqlite_busy, RetryConfig};

const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "control store query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

// ─── Row / entity types ────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub email_verified_at: Option<String>,
    pub is_admin: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub user_id: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub key_prefix: String,
    pub name: String,
    pub scopes: String,
    pub expires_at: Option<String>,
    pub last_used_at: Option<String>,
    pub created_at: String,
}

impl ApiKeyRecord {
    pub fn scope_list(&self) -> Vec<&str> {
        self.scopes.split(',').filter(|s| !s.is_empty()).collect()
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope_list().contains(&scope)
    }

    pub fn is_expired(&self, now: chrono::DateTime<Utc>) -> bool {
        self.expires_at
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|exp| exp.with_timezone(&Utc) < now)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub deleted_at: Option<String>,
    pub event_count: i64,
    pub last_event_at: Option<String>,
    pub last_server_seq: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Membership {
    pub project_id: String,
    pub user_id: String,
    pub role: String,
    pub invited_by: String,
    pub created_at: String,
}

impl Membership {
    pub fn role(&self) -> Role {
        Role::from_str(&self.role).unwrap_or(Role::Reader)
    }
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct SyncCursorRow {
    pub project_id: String,
    pub client_id: String,
    pub last_event_id: i64,
    pub last_sync_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct AuthRequest {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub device_code: String,
    pub user_code: String,
    pub status: String,
    pub user_id: Option<String>,
    pub api_key_id: Option<String>,
    pub expires_at: String,
    pub verified_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct AuthEventRow {
    pub id: String,
    pub auth_request_id: Option<String>,
    pub user_id: Option<String>,
    pub kind: String,
    pub detail: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct RateLimitEventRow {
    pub id: String,
    pub identity: String,
    pub class: String,
    pub created_at: String,
}

/// Outcome of `ValidateBearer`.
pub enum BearerOutcome {
    Ok { user: User, key: ApiKeyRecord },
    Unauthorized,
    Expired,
}

#[derive(Clone)]
pub struct ControlStore {
    pool: SqlitePool,
}

impl ControlStore {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Users ──────────────────────────────────────────────────────────────

    /// Creates a user for an email if one does not already exist.
    /// The very first user ever created is forced `is_admin = true` (spec §3).
    pub async fn get_or_create_user_by_email(&self, email: &str) -> Result<User> {
        let email = email.to_lowercase();
        if let Some(existing) = self.get_user_by_email(&email).await? {
            return Ok(existing);
        }
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        let is_admin = count == 0;
        let id = format!("u_{}", Uuid::new_v4().simple());
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO users (id, email, email_verified_at, is_admin, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&email)
        .bind(&now)
        .bind(is_admin as i64)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_user(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user not found after insert"))
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        Ok(sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(
            sqlx::query_as("SELECT * FROM users WHERE email = ?")
                .bind(email.to_lowercase())
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_users(&self, after_id: Option<&str>, limit: i64) -> Result<Vec<User>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM users WHERE (? IS NULL OR id > ?) ORDER BY id ASC LIMIT ?",
            )
            .bind(after_id)
            .bind(after_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    pub async fn count_users(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    // ─── API keys ───────────────────────────────────────────────────────────

    /// `GenerateAPIKey(user_id, name, scopes, expires_at?) → (plaintext, record)`.
    /// Generates a cryptographically random token; only its hash and display
    /// prefix are stored. The plaintext is returned once and never again.
    pub async fn generate_api_key(
        &self,
        user_id: &str,
        name: &str,
        scopes: &[&str],
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<(String, ApiKeyRecord)> {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        let plaintext = format!("sk_{}", hex::encode(raw));
        let key_hash = hex_sha256(&plaintext);
        let key_prefix = plaintext.chars().take(11).collect::<String>();

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let scopes_joined = scopes.join(",");
        let expires_at_str = expires_at.map(|t| t.to_rfc3339());

        sqlx::query(
            "INSERT INTO api_keys (id, user_id, key_hash, key_prefix, name, scopes, expires_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(&key_hash)
        .bind(&key_prefix)
        .bind(name)
        .bind(&scopes_joined)
        .bind(&expires_at_str)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let record: ApiKeyRecord = sqlx::query_as("SELECT * FROM api_keys WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        Ok((plaintext, record))
    }

    /// `ValidateBearer(token) → (user, key_record, err)`. Hashes the
    /// candidate and looks up by hash; best-effort updates `last_used_at`.
    pub async fn validate_bearer(&self, token: &str) -> Result<BearerOutcome> {
        let key_hash = hex_sha256(token);
        let key: Option<ApiKeyRecord> = sqlx::query_as("SELECT * FROM api_keys WHERE key_hash = ?")
            .bind(&key_hash)
            .fetch_optional(&self.pool)
            .await?;
        let Some(key) = key else {
            return Ok(BearerOutcome::Unauthorized);
        };
        if key.is_expired(Utc::now()) {
            return Ok(BearerOutcome::Expired);
        }
        let Some(user) = self.get_user(&key.user_id).await? else {
            return Ok(BearerOutcome::Unauthorized);
        };

        // Best-effort: a failure here must never fail the request.
        let now = Utc::now().to_rfc3339();
        let _ = sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&key.id)
            .execute(&self.pool)
            .await;

        Ok(BearerOutcome::Ok { user, key })
    }

    // ─── Projects ───────────────────────────────────────────────────────────

    /// Creates a project and atomically inserts the creator as `owner`.
    pub async fn create_project(
        &self,
        name: &str,
        description: Option<&str>,
        creator_user_id: &str,
    ) -> Result<Project> {
        let id = format!("p_{}", Uuid::new_v4().simple());
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO projects (id, name, description, event_count, last_server_seq, created_at, updated_at)
             VALUES (?, ?, ?, 0, 0, ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(description)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO memberships (project_id, user_id, role, invited_by, created_at)
             VALUES (?, ?, 'owner', ?, ?)",
        )
        .bind(&id)
        .bind(creator_user_id)
        .bind(creator_user_id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_project(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("project not found after insert"))
    }

    pub async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        Ok(sqlx::query_as("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_projects_for_user(&self, user_id: &str) -> Result<Vec<Project>> {
        Ok(sqlx::query_as(
            "SELECT p.* FROM projects p
             JOIN memberships m ON m.project_id = p.id
             WHERE m.user_id = ? AND p.deleted_at IS NULL
             ORDER BY p.created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn list_projects_admin(
        &self,
        after_id: Option<&str>,
        limit: i64,
        include_deleted: bool,
    ) -> Result<Vec<Project>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM projects
                 WHERE (? IS NULL OR id > ?) AND (? OR deleted_at IS NULL)
                 ORDER BY id ASC LIMIT ?",
            )
            .bind(after_id)
            .bind(after_id)
            .bind(include_deleted)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    pub async fn update_project(
        &self,
        id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE projects SET
                name = COALESCE(?, name),
                description = COALESCE(?, description),
                updated_at = ?
             WHERE id = ?",
        )
        .bind(name)
        .bind(description)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Sets `deleted_at` and excludes the project from non-admin listings.
    /// Idempotent: soft-deleting an already-deleted project is a no-op success
    /// (spec §7: "Soft-delete on an already-deleted project returns 200 with
    /// no effect").
    pub async fn soft_delete_project(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE projects SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// `UpdateProjectEventCount(project, +n, t)`, monotonic in `t`: only
    /// advances `last_event_at` if `t` is newer than the current value.
    /// Also advances the denormalized `last_server_seq` mirror of the
    /// journal's head — monotonic via `MAX`, since a concurrent push that
    /// committed after this one read its own `head_seq` but races this
    /// write to the control store must never regress it (spec §4.6 Status:
    /// "the journal is not consulted" — `status()` reads this column
    /// instead). This is the one control-store write every concurrent push
    /// contends on for a given project, so it is the representative write
    /// wrapped in the storage-layer busy retry (spec §10.7) rather than
    /// failing the whole push on a transient `SQLITE_BUSY`.
    pub async fn update_project_event_count(
        &self,
        project_id: &str,
        delta: i64,
        at: chrono::DateTime<Utc>,
        head_seq: i64,
    ) -> Result<()> {
        let at_str = at.to_rfc3339();
        retry_sqlite_busy(&RetryConfig::default(), || {
            let at_str = at_str.clone();
            async {
                sqlx::query(
                    "UPDATE projects SET
                        event_count = event_count + ?,
                        last_event_at = CASE
                            WHEN last_event_at IS NULL OR ? > last_event_at THEN ?
                            ELSE last_event_at
                        END,
                        last_server_seq = MAX(last_server_seq, ?)
                     WHERE id = ?",
                )
                .bind(delta)
                .bind(&at_str)
                .bind(&at_str)
                .bind(head_seq)
                .bind(project_id)
                .execute(&self.pool)
                .await
            }
        })
        .await?;
        Ok(())
    }

    // ─── Memberships ────────────────────────────────────────────────────────

    pub async fn get_membership(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<Option<Membership>> {
        Ok(sqlx::query_as(
            "SELECT * FROM memberships WHERE project_id = ? AND user_id = ?",
        )
        .bind(project_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn list_members(&self, project_id: &str) -> Result<Vec<Membership>> {
        Ok(sqlx::query_as(
            "SELECT * FROM memberships WHERE project_id = ? ORDER BY created_at ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?)
    }

    fn count_owners_sql() -> &'static str {
        "SELECT COUNT(*) FROM memberships WHERE project_id = ? AND role = 'owner'"
    }

    /// Refuses duplicate `(project, user)` pairs.
    pub async fn add_member(
        &self,
        project_id: &str,
        user_id: &str,
        role: Role,
        invited_by: &str,
    ) -> Result<Membership> {
        if self.get_membership(project_id, user_id).await?.is_some() {
            anyhow::bail!("duplicate membership");
        }
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO memberships (project_id, user_id, role, invited_by, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(project_id)
        .bind(user_id)
        .bind(role.as_str())
        .bind(invited_by)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_membership(project_id, user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("membership not found after insert"))
    }

    pub async fn update_member_role(
        &self,
        project_id: &str,
        user_id: &str,
        role: Role,
    ) -> Result<()> {
        // Refuses to remove the last owner via a demotion.
        if role != Role::Owner {
            let (owners,): (i64,) = sqlx::query_as(Self::count_owners_sql())
                .bind(project_id)
                .fetch_one(&self.pool)
                .await?;
            let current = self.get_membership(project_id, user_id).await?;
            if owners <= 1 && current.map(|m| m.role()) == Some(Role::Owner) {
                anyhow::bail!("cannot demote the last owner");
            }
        }
        sqlx::query("UPDATE memberships SET role = ? WHERE project_id = ? AND user_id = ?")
            .bind(role.as_str())
            .bind(project_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Refuses to remove the last owner.
    pub async fn remove_member(&self, project_id: &str, user_id: &str) -> Result<()> {
        let (owners,): (i64,) = sqlx::query_as(Self::count_owners_sql())
            .bind(project_id)
            .fetch_one(&self.pool)
            .await?;
        let current = self.get_membership(project_id, user_id).await?;
        if owners <= 1 && current.map(|m| m.role()) == Some(Role::Owner) {
            anyhow::bail!("cannot remove the last owner");
        }
        sqlx::query("DELETE FROM memberships WHERE project_id = ? AND user_id = ?")
            .bind(project_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─── Sync cursors ───────────────────────────────────────────────────────

    pub async fn upsert_sync_cursor(
        &self,
        project_id: &str,
        client_id: &str,
        last_event_id: i64,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO sync_cursors (project_id, client_id, last_event_id, last_sync_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(project_id, client_id) DO UPDATE SET
                last_event_id = excluded.last_event_id,
                last_sync_at = excluded.last_sync_at",
        )
        .bind(project_id)
        .bind(client_id)
        .bind(last_event_id)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_sync_cursors(
        &self,
        project_id: &str,
        after_client_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SyncCursorRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM sync_cursors
                 WHERE project_id = ? AND (? IS NULL OR client_id > ?)
                 ORDER BY client_id ASC LIMIT ?",
            )
            .bind(project_id)
            .bind(after_client_id)
            .bind(after_client_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    // ─── Device auth ────────────────────────────────────────────────────────

    pub async fn create_auth_request(&self, email: &str, ttl: chrono::Duration) -> Result<AuthRequest> {
        let mut code_bytes = [0u8; 20];
        OsRng.fill_bytes(&mut code_bytes);
        let device_code = hex::encode(code_bytes);
        let user_code = short_user_code();

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = (now + ttl).to_rfc3339();
        sqlx::query(
            "INSERT INTO auth_requests (id, email, device_code, user_code, status, expires_at, created_at)
             VALUES (?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(&id)
        .bind(email.to_lowercase())
        .bind(&device_code)
        .bind(&user_code)
        .bind(&expires_at)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        self.get_auth_request(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("auth request not found after insert"))
    }

    pub async fn get_auth_request(&self, id: &str) -> Result<Option<AuthRequest>> {
        Ok(sqlx::query_as("SELECT * FROM auth_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn get_auth_request_by_device_code(
        &self,
        device_code: &str,
    ) -> Result<Option<AuthRequest>> {
        Ok(
            sqlx::query_as("SELECT * FROM auth_requests WHERE device_code = ?")
                .bind(device_code)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn get_auth_request_by_user_code(
        &self,
        user_code: &str,
    ) -> Result<Option<AuthRequest>> {
        Ok(
            sqlx::query_as("SELECT * FROM auth_requests WHERE user_code = ?")
                .bind(user_code)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn mark_auth_request_verified(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE auth_requests SET status = 'code_verified', verified_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_auth_request_approved(
        &self,
        id: &str,
        user_id: &str,
        api_key_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE auth_requests SET status = 'approved', user_id = ?, api_key_id = ?
             WHERE id = ?",
        )
        .bind(user_id)
        .bind(api_key_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_auth_request_failed(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE auth_requests SET status = 'failed' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn expire_stale_auth_requests(&self) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let n = sqlx::query(
            "UPDATE auth_requests SET status = 'expired'
             WHERE status IN ('pending', 'code_verified') AND expires_at < ?",
        )
        .bind(&now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(n)
    }

    // ─── Audit streams ──────────────────────────────────────────────────────

    pub async fn append_auth_event(
        &self,
        auth_request_id: Option<&str>,
        user_id: Option<&str>,
        kind: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO auth_events (id, auth_request_id, user_id, kind, detail, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(auth_request_id)
        .bind(user_id)
        .bind(kind)
        .bind(detail)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_auth_events(&self, after_id: Option<&str>, limit: i64) -> Result<Vec<AuthEventRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM auth_events WHERE (? IS NULL OR id > ?) ORDER BY id ASC LIMIT ?",
            )
            .bind(after_id)
            .bind(after_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    pub async fn append_rate_limit_event(&self, identity: &str, class: &str) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO rate_limit_events (id, identity, class, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(identity)
        .bind(class)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_rate_limit_events(
        &self,
        after_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<RateLimitEventRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM rate_limit_events WHERE (? IS NULL OR id > ?) ORDER BY id ASC LIMIT ?",
            )
            .bind(after_id)
            .bind(after_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    // ─── Server overview aggregate (admin) ─────────────────────────────────

    pub async fn total_members(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM memberships")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn total_projects(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM projects WHERE deleted_at IS NULL")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

fn hex_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A short human-typeable device-auth code, e.g. `"WXYZ-1234"`.
fn short_user_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut buf = [0u8; 8];
    OsRng.fill_bytes(&mut buf);
    let chars: String = buf
        .iter()
        .map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char)
        .collect();
    format!("{}-{}", &chars[0..4], &chars[4..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, ControlStore) {
        let dir = TempDir::new().unwrap();
        let store = ControlStore::new(&dir.path().join("server.db")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn first_user_is_auto_admin() {
        let (_dir, store) = store().await;
        let alice = store.get_or_create_user_by_email("Alice@Test.com").await.unwrap();
        assert!(alice.is_admin);
        assert_eq!(alice.email, "alice@test.com");
        let bob = store.get_or_create_user_by_email("bob@test.com").await.unwrap();
        assert!(!bob.is_admin);
    }

    #[tokio::test]
    async fn api_key_validates_and_hides_secret() {
        let (_dir, store) = store().await;
        let user = store.get_or_create_user_by_email("alice@test.com").await.unwrap();
        let (plaintext, record) = store
            .generate_api_key(&user.id, "default", &["sync"], None)
            .await
            .unwrap();
        assert_ne!(record.key_hash, plaintext);

        match store.validate_bearer(&plaintext).await.unwrap() {
            BearerOutcome::Ok { user: u, key } => {
                assert_eq!(u.id, user.id);
                assert!(key.has_scope("sync"));
            }
            _ => panic!("expected Ok"),
        }

        match store.validate_bearer("sk_not-a-real-token").await.unwrap() {
            BearerOutcome::Unauthorized => {}
            _ => panic!("expected Unauthorized"),
        }
    }

    #[tokio::test]
    async fn create_project_inserts_owner_atomically() {
        let (_dir, store) = store().await;
        let alice = store.get_or_create_user_by_email("alice@test.com").await.unwrap();
        let project = store.create_project("demo", None, &alice.id).await.unwrap();
        let membership = store.get_membership(&project.id, &alice.id).await.unwrap().unwrap();
        assert_eq!(membership.role(), Role::Owner);
    }

    #[tokio::test]
    async fn add_member_refuses_duplicate() {
        let (_dir, store) = store().await;
        let alice = store.get_or_create_user_by_email("alice@test.com").await.unwrap();
        let bob = store.get_or_create_user_by_email("bob@test.com").await.unwrap();
        let project = store.create_project("demo", None, &alice.id).await.unwrap();
        store
            .add_member(&project.id, &bob.id, Role::Writer, &alice.id)
            .await
            .unwrap();
        assert!(store
            .add_member(&project.id, &bob.id, Role::Writer, &alice.id)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn remove_member_refuses_last_owner() {
        let (_dir, store) = store().await;
        let alice = store.get_or_create_user_by_email("alice@test.com").await.unwrap();
        let project = store.create_project("demo", None, &alice.id).await.unwrap();
        assert!(store.remove_member(&project.id, &alice.id).await.is_err());
    }

    #[tokio::test]
    async fn soft_delete_is_idempotent() {
        let (_dir, store) = store().await;
        let alice = store.get_or_create_user_by_email("alice@test.com").await.unwrap();
        let project = store.create_project("demo", None, &alice.id).await.unwrap();
        store.soft_delete_project(&project.id).await.unwrap();
        store.soft_delete_project(&project.id).await.unwrap();
        let reloaded = store.get_project(&project.id).await.unwrap().unwrap();
        assert!(reloaded.deleted_at.is_some());
    }
}

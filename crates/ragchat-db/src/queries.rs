use crate::models::{AdminUserRow, UserFilter, UserRow};
use crate::Database;
use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row};

const USER_COLUMNS: &str = "id, email, password_hash, display_name, is_active, \
     verification_code, verification_expires_at, created_at";

impl Database {
    // -- Users --

    /// Create a user and assign `roles` in one transaction.
    /// Returns `false` without writing anything if the email is already taken.
    pub fn create_user(
        &self,
        id: &str,
        email: &str,
        display_name: &str,
        password_hash: Option<&str>,
        roles: &[&str],
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT INTO users (id, email, password_hash, display_name)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (email) DO NOTHING",
                (id, email, password_hash, display_name),
            )?;
            if inserted == 0 {
                return Ok(false);
            }
            for role in roles {
                assign_role_in(&tx, id, role)?;
            }
            tx.commit()?;
            Ok(true)
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email", email))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn set_password_hash(&self, id: &str, password_hash: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute("UPDATE users SET password_hash = ?1 WHERE id = ?2", (password_hash, id))?;
            Ok(())
        })
    }

    pub fn set_display_name(&self, id: &str, display_name: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute("UPDATE users SET display_name = ?1 WHERE id = ?2", (display_name, id))?;
            Ok(())
        })
    }

    /// Returns `false` when no such user exists.
    pub fn set_user_active(&self, id: &str, active: bool) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute("UPDATE users SET is_active = ?1 WHERE id = ?2", (active, id))?;
            Ok(changed == 1)
        })
    }

    // -- Verification codes --

    /// Store a pending code, replacing any previous one.
    pub fn set_verification_code(&self, id: &str, code: &str, expires_at: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE users SET verification_code = ?1, verification_expires_at = ?2 WHERE id = ?3",
                (code, expires_at, id),
            )?;
            Ok(())
        })
    }

    pub fn clear_verification_code(&self, id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE users SET verification_code = NULL, verification_expires_at = NULL WHERE id = ?1",
                [id],
            )?;
            Ok(())
        })
    }

    /// Atomically check and clear a code. Only one caller can ever consume a
    /// given code; a wrong or expired code leaves the row untouched.
    pub fn consume_verification_code(&self, id: &str, code: &str, now: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users
                 SET verification_code = NULL, verification_expires_at = NULL
                 WHERE id = ?1
                   AND verification_code IS NOT NULL
                   AND verification_code = ?2
                   AND verification_expires_at IS NOT NULL
                   AND verification_expires_at > ?3",
                (id, code, now),
            )?;
            Ok(changed == 1)
        })
    }

    // -- Roles --

    pub fn get_user_roles(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.name FROM user_roles ur
                 JOIN roles r ON r.id = ur.role_id
                 WHERE ur.user_id = ?1
                 ORDER BY r.name",
            )?;
            let roles = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(roles)
        })
    }

    pub fn user_has_role(&self, user_id: &str, role: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM user_roles ur
                     JOIN roles r ON r.id = ur.role_id
                     WHERE ur.user_id = ?1 AND r.name = ?2",
                    (user_id, role),
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Insert-or-ignore. Returns `true` if the assignment is new.
    pub fn assign_role(&self, user_id: &str, role: &str) -> Result<bool> {
        self.with_conn_mut(|conn| assign_role_in(conn, user_id, role))
    }

    pub fn revoke_role(&self, user_id: &str, role: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "DELETE FROM user_roles
                 WHERE user_id = ?1 AND role_id = (SELECT id FROM roles WHERE name = ?2)",
                (user_id, role),
            )?;
            Ok(changed > 0)
        })
    }

    // -- OAuth identities --

    pub fn find_oauth_user(&self, provider: &str, provider_account_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let user_id = conn
                .query_row(
                    "SELECT user_id FROM oauth_accounts WHERE provider = ?1 AND provider_account_id = ?2",
                    (provider, provider_account_id),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(user_id)
        })
    }

    /// Link a provider identity to a user (insert-or-ignore) and return the
    /// user that owns the link afterwards. When a concurrent callback linked
    /// the identity first, that earlier link wins.
    pub fn link_oauth_identity(
        &self,
        provider: &str,
        provider_account_id: &str,
        user_id: &str,
    ) -> Result<String> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO oauth_accounts (provider, provider_account_id, user_id)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (provider, provider_account_id) DO NOTHING",
                (provider, provider_account_id, user_id),
            )?;
            let owner: String = tx.query_row(
                "SELECT user_id FROM oauth_accounts WHERE provider = ?1 AND provider_account_id = ?2",
                (provider, provider_account_id),
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(owner)
        })
    }

    // -- Admin listing --

    /// Page through users, newest first. Returns the page and the total match count.
    pub fn list_users(
        &self,
        filter: &UserFilter,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<AdminUserRow>, u64)> {
        self.with_conn(|conn| {
            let pattern = filter.query.as_deref().map(|q| format!("%{}%", q.to_lowercase()));
            let where_sql = "WHERE (?1 IS NULL OR lower(u.email) LIKE ?1 OR lower(u.display_name) LIKE ?1)
                   AND (?2 IS NULL OR EXISTS (
                        SELECT 1 FROM user_roles ur JOIN roles r ON r.id = ur.role_id
                        WHERE ur.user_id = u.id AND r.name = ?2))
                   AND (?3 IS NULL OR u.is_active = ?3)";

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM users u {where_sql}"),
                rusqlite::params![pattern, filter.role, filter.active],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "SELECT u.id, u.email, u.display_name, u.is_active, u.created_at,
                        COALESCE((SELECT group_concat(name, ',') FROM (
                            SELECT r.name AS name FROM user_roles ur
                            JOIN roles r ON r.id = ur.role_id
                            WHERE ur.user_id = u.id ORDER BY r.name)), '')
                 FROM users u
                 {where_sql}
                 ORDER BY u.created_at DESC, u.rowid DESC
                 LIMIT ?4 OFFSET ?5"
            ))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![pattern, filter.role, filter.active, limit, offset],
                    |row| {
                    let roles: String = row.get(5)?;
                    let mut roles: Vec<String> = roles
                        .split(',')
                        .filter(|r| !r.is_empty())
                        .map(str::to_string)
                        .collect();
                    roles.sort();
                    Ok(AdminUserRow {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        display_name: row.get(2)?,
                        is_active: row.get(3)?,
                        created_at: row.get(4)?,
                        roles,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok((rows, total.max(0) as u64))
        })
    }
}

fn assign_role_in(conn: &Connection, user_id: &str, role: &str) -> Result<bool> {
    let role_id: i64 = conn
        .query_row("SELECT id FROM roles WHERE name = ?1", [role], |row| row.get(0))
        .optional()?
        .ok_or_else(|| anyhow!("Unknown role: {}", role))?;
    let inserted = conn.execute(
        "INSERT INTO user_roles (user_id, role_id) VALUES (?1, ?2)
         ON CONFLICT (user_id, role_id) DO NOTHING",
        (user_id, role_id),
    )?;
    Ok(inserted == 1)
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = ?1"))?;
    let row = stmt.query_row([value], map_user).optional()?;
    Ok(row)
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        display_name: row.get(3)?,
        is_active: row.get(4)?,
        verification_code: row.get(5)?,
        verification_expires_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

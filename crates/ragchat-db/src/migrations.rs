use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

const NOW: &str = "(strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))";

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (accounts and roles)");
        conn.execute_batch(&format!(
            "
            CREATE TABLE users (
                id                       TEXT PRIMARY KEY,
                email                    TEXT NOT NULL UNIQUE,
                password_hash            TEXT,
                display_name             TEXT NOT NULL,
                is_active                INTEGER NOT NULL DEFAULT 1,
                verification_code        TEXT,
                verification_expires_at  TEXT,
                created_at               TEXT NOT NULL DEFAULT {NOW}
            );

            CREATE TABLE roles (
                id    INTEGER PRIMARY KEY AUTOINCREMENT,
                name  TEXT NOT NULL UNIQUE
            );

            CREATE TABLE user_roles (
                user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                role_id     INTEGER NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
                created_at  TEXT NOT NULL DEFAULT {NOW},
                PRIMARY KEY (user_id, role_id)
            );

            CREATE TABLE oauth_accounts (
                provider             TEXT NOT NULL,
                provider_account_id  TEXT NOT NULL,
                user_id              TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at           TEXT NOT NULL DEFAULT {NOW},
                PRIMARY KEY (provider, provider_account_id)
            );

            CREATE INDEX idx_oauth_accounts_user ON oauth_accounts(user_id);

            INSERT OR IGNORE INTO roles (name) VALUES ('admin'), ('user'), ('analyst');

            INSERT INTO schema_version (version) VALUES (1);
            "
        ))?;
    }

    if version < 2 {
        info!("Running migration v2 (conversations)");
        conn.execute_batch(&format!(
            "
            CREATE TABLE conversations (
                id             TEXT PRIMARY KEY,
                owner_user_id  TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                title          TEXT,
                created_at     TEXT NOT NULL DEFAULT {NOW},
                closed_at      TEXT,
                is_active      INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE participants (
                conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                user_id          TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                is_owner         INTEGER NOT NULL DEFAULT 0,
                added_at         TEXT NOT NULL DEFAULT {NOW},
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE INDEX idx_participants_user ON participants(user_id);

            CREATE TABLE messages (
                id               TEXT PRIMARY KEY,
                conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                sender_user_id   TEXT REFERENCES users(id) ON DELETE SET NULL,
                sender           TEXT NOT NULL CHECK (sender IN ('user', 'bot', 'system')),
                content          TEXT NOT NULL,
                latency_ms       INTEGER,
                metadata         TEXT NOT NULL DEFAULT '{{}}',
                created_at       TEXT NOT NULL DEFAULT {NOW}
            );

            CREATE INDEX idx_messages_conversation ON messages(conversation_id, created_at);

            CREATE TABLE message_feedback (
                id          TEXT PRIMARY KEY,
                message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                rating      INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
                comment     TEXT,
                created_at  TEXT NOT NULL DEFAULT {NOW},
                UNIQUE (message_id, user_id)
            );

            INSERT INTO schema_version (version) VALUES (2);
            "
        ))?;
    }

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent_and_seed_roles() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 2);

        let roles: Vec<String> = conn
            .prepare("SELECT name FROM roles ORDER BY name")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(roles, vec!["admin", "analyst", "user"]);
    }
}

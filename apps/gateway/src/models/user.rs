//! Authenticated user identity and database selection.

/// The LFS database a session is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Database {
    Lfs,
    Prj,
    Mig,
}

impl Database {
    /// Parse the database name as the upstream auth service reports it.
    /// Unknown names fall back to `Mig`.
    pub fn from_upstream(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "lfs" => Database::Lfs,
            "lfsprj" => Database::Prj,
            "lfsmig" => Database::Mig,
            other => {
                tracing::warn!(name = %other, "received invalid database name");
                Database::Mig
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Database::Lfs => "LFS",
            Database::Prj => "PRJ",
            Database::Mig => "MIG",
        }
    }

    /// Lower-case form used in pod/job labels.
    pub fn label(&self) -> String {
        self.as_str().to_lowercase()
    }
}

/// A single user who can log in to the application.
///
/// Decrypted out of the JWT claims; `db_password` never leaves the process
/// except inside the in-band login envelope.
#[derive(Debug, Clone)]
pub struct User {
    /// Display name (the token subject).
    pub username: String,
    /// Backend login used for pod assignment and the LFS login.
    pub db_user: String,
    pub db_password: String,
    pub database: Database,
    /// Database name exactly as the auth service reported it (e.g. `lfs`).
    /// Used for the in-band login and the `Db` header comparison.
    pub database_str: String,
    pub workplace: String,
    /// Absolute expiration timestamp of the token (unix seconds).
    pub expiration: i64,
}

impl User {
    /// Session-registry key: `lower(db_user + "-" + database)`.
    pub fn identifier(&self) -> String {
        format!("{}-{}", self.db_user, self.database.as_str()).to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_user(db_user: &str, database: Database) -> User {
        User {
            username: "Alice Example".to_string(),
            db_user: db_user.to_string(),
            db_password: "secret".to_string(),
            database,
            database_str: database.label(),
            workplace: "wp1".to_string(),
            expiration: 0,
        }
    }

    #[test]
    fn identifier_is_lowercased_login_and_db() {
        let user = test_user("Alice", Database::Lfs);
        assert_eq!(user.identifier(), "alice-lfs");
    }

    #[test]
    fn identifier_distinguishes_databases() {
        let a = test_user("alice", Database::Lfs);
        let b = test_user("alice", Database::Prj);
        assert_ne!(a.identifier(), b.identifier());
    }

    #[test]
    fn database_parses_upstream_names() {
        assert_eq!(Database::from_upstream("lfs"), Database::Lfs);
        assert_eq!(Database::from_upstream("LFSPRJ"), Database::Prj);
        assert_eq!(Database::from_upstream("lfsmig"), Database::Mig);
        // Unknown names fall back to MIG.
        assert_eq!(Database::from_upstream("bogus"), Database::Mig);
    }
}

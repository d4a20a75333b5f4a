//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The database engine family a target belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    MongoDb,
    Postgres,
    MySql,
    MsSql,
}

impl BackendType {
    pub const ALL: [BackendType; 4] = [
        BackendType::MongoDb,
        BackendType::Postgres,
        BackendType::MySql,
        BackendType::MsSql,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::MongoDb => "mongodb",
            BackendType::Postgres => "postgres",
            BackendType::MySql => "mysql",
            BackendType::MsSql => "mssql",
        }
    }

    /// Guess the backend from a connection string's scheme.
    pub fn infer(secret: &str) -> Option<Self> {
        let lower = secret.trim().to_ascii_lowercase();
        let scheme = lower.split("://").next().filter(|_| lower.contains("://"));

        match scheme {
            Some("mongodb") | Some("mongodb+srv") => Some(BackendType::MongoDb),
            Some("postgres") | Some("postgresql") => Some(BackendType::Postgres),
            Some("mysql") | Some("mariadb") => Some(BackendType::MySql),
            Some("mssql") | Some("sqlserver") => Some(BackendType::MsSql),
            Some(_) => None,
            // ADO.NET style strings are SQL Server's native form
            None if lower.starts_with("server=") || lower.starts_with("data source=") => {
                Some(BackendType::MsSql)
            }
            None => None,
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mongodb" | "mongo" => Ok(BackendType::MongoDb),
            "postgres" | "postgresql" => Ok(BackendType::Postgres),
            "mysql" | "mariadb" => Ok(BackendType::MySql),
            "mssql" | "sqlserver" => Ok(BackendType::MsSql),
            other => Err(format!("unsupported backend type: {}", other)),
        }
    }
}

/// A monitored database target.
///
/// `connection_secret` holds the decoded secret while in memory; `Debug`
/// output never includes it.
#[derive(Clone)]
pub struct DatabaseDefinition {
    pub id: String,
    pub label: String,
    pub connection_secret: String,
    pub backend_type: BackendType,
    pub last_known_db_name: Option<String>,
    pub status: String,
    /// Error from the latest failed probe, cleared by a successful one.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DatabaseDefinition {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        connection_secret: impl Into<String>,
        backend_type: BackendType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            label: label.into(),
            connection_secret: connection_secret.into(),
            backend_type,
            last_known_db_name: None,
            status: "unknown".to_string(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Wire-safe view of this definition.
    pub fn summary(&self) -> TargetSummary {
        TargetSummary {
            id: self.id.clone(),
            label: self.label.clone(),
            backend_type: self.backend_type,
            has_connection_string: !self.connection_secret.is_empty(),
            last_known_db_name: self.last_known_db_name.clone(),
            status: self.status.clone(),
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl fmt::Debug for DatabaseDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseDefinition")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("connection_secret", &"<redacted>")
            .field("backend_type", &self.backend_type)
            .field("last_known_db_name", &self.last_known_db_name)
            .field("status", &self.status)
            .field("last_error", &self.last_error)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// What a target listing sends over the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSummary {
    pub id: String,
    pub label: String,
    pub backend_type: BackendType,
    pub has_connection_string: bool,
    pub last_known_db_name: Option<String>,
    pub status: String,
    /// Error from the latest failed probe, cleared by a successful one.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Kind of an event log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Connected,
    Disconnected,
    Probed,
    Error,
    System,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "Connected",
            EventKind::Disconnected => "Disconnected",
            EventKind::Probed => "Probed",
            EventKind::Error => "Error",
            EventKind::System => "System",
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Connected" => Ok(EventKind::Connected),
            "Disconnected" => Ok(EventKind::Disconnected),
            "Probed" => Ok(EventKind::Probed),
            "Error" => Ok(EventKind::Error),
            "System" => Ok(EventKind::System),
            other => Err(format!("unknown event kind: {}", other)),
        }
    }
}

/// An immutable event log entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: i64,
    pub target_id: Option<String>,
    pub kind: EventKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_inference() {
        assert_eq!(BackendType::infer("mongodb://localhost/test"), Some(BackendType::MongoDb));
        assert_eq!(BackendType::infer("mongodb+srv://c.example.net/app"), Some(BackendType::MongoDb));
        assert_eq!(BackendType::infer("postgresql://u:p@h/db"), Some(BackendType::Postgres));
        assert_eq!(BackendType::infer("MYSQL://h:3306/db"), Some(BackendType::MySql));
        assert_eq!(
            BackendType::infer("Server=tcp:h,1433;Database=app;User Id=sa"),
            Some(BackendType::MsSql)
        );
        assert_eq!(BackendType::infer("redis://localhost"), None);
        assert_eq!(BackendType::infer(""), None);
    }

    #[test]
    fn test_backend_parse_and_display() {
        for backend in BackendType::ALL {
            assert_eq!(backend.as_str().parse::<BackendType>(), Ok(backend));
        }
        assert!("oracle".parse::<BackendType>().is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let def = DatabaseDefinition::new("db1", "Primary", "mongodb://admin:pw@h/x", BackendType::MongoDb);
        let out = format!("{:?}", def);
        assert!(!out.contains("pw@h"));
        assert!(out.contains("<redacted>"));
    }

    #[test]
    fn test_summary_hides_secret() {
        let def = DatabaseDefinition::new("db1", "Primary", "postgres://u:pw@h/x", BackendType::Postgres);
        let json = serde_json::to_value(def.summary()).unwrap();
        assert_eq!(json["hasConnectionString"], true);
        assert_eq!(json["backendType"], "postgres");
        assert!(!json.to_string().contains("pw@h"));
    }
}

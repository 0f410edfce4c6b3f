//! Domain Entities
//!
//! Records exchanged with the storage collaborator. The resilience core only
//! moves these around; their business rules live outside this crate.

use serde::{Deserialize, Serialize};

/// A platform user as persisted by the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Opaque credential hash; never serialized back to clients.
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub email: Option<String>,
    pub role: String,
    /// Unix milliseconds
    pub created_at: u64,
}

/// Data needed to create a user.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "investor".to_string()
}

/// Web session record held by the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub sid: String,
    pub data: serde_json::Value,
    /// Unix milliseconds
    pub expires_at: u64,
}

/// Current Unix time in milliseconds.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_user_default_role() {
        let user: NewUser =
            serde_json::from_str(r#"{"username":"ada","password_hash":"x"}"#).unwrap();
        assert_eq!(user.role, "investor");
        assert!(user.email.is_none());
    }

    #[test]
    fn test_user_hides_password_hash() {
        let user = User {
            id: 1,
            username: "ada".to_string(),
            password_hash: "secret".to_string(),
            email: None,
            role: "admin".to_string(),
            created_at: 0,
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("ada"));
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

pub const HANDLE_MIN_LEN: usize = 3;
pub const HANDLE_MAX_LEN: usize = 15;
pub const BIO_MAX_LEN: usize = 150;
pub const DISPLAY_NAME_MAX_LEN: usize = 50;

/// Identity record. Owned by the identity collaborator; the core reads it and
/// keeps the presence fields current.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: &str, display_name: &str) -> AppResult<Self> {
        validate_handle(username)?;
        validate_display_name(display_name)?;

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            username: username.to_string(),
            display_name: display_name.to_string(),
            avatar_url: None,
            bio: String::new(),
            is_online: false,
            last_seen: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Presence as seen by other users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceStatus {
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl PresenceStatus {
    pub fn online() -> Self {
        Self {
            online: true,
            last_seen: None,
        }
    }

    pub fn offline(last_seen: Option<DateTime<Utc>>) -> Self {
        Self {
            online: false,
            last_seen,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    pub username: Option<String>,
    #[serde(alias = "fullName")]
    pub display_name: Option<String>,
    pub bio: Option<String>,
    #[serde(alias = "avatar")]
    pub avatar_url: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.username.is_none()
            && self.display_name.is_none()
            && self.bio.is_none()
            && self.avatar_url.is_none()
    }

    pub fn validate(&self) -> AppResult<()> {
        if let Some(username) = &self.username {
            validate_handle(username)?;
        }
        if let Some(display_name) = &self.display_name {
            validate_display_name(display_name)?;
        }
        if let Some(bio) = &self.bio {
            if bio.chars().count() > BIO_MAX_LEN {
                return Err(AppError::Validation(format!(
                    "Bio must be at most {} characters",
                    BIO_MAX_LEN
                )));
            }
        }
        Ok(())
    }
}

pub fn validate_handle(handle: &str) -> AppResult<()> {
    let len = handle.chars().count();
    if !(HANDLE_MIN_LEN..=HANDLE_MAX_LEN).contains(&len) {
        return Err(AppError::Validation(format!(
            "Username must be {}-{} characters",
            HANDLE_MIN_LEN, HANDLE_MAX_LEN
        )));
    }
    if !handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(AppError::Validation(
            "Username may only contain letters, digits and underscores".to_string(),
        ));
    }
    Ok(())
}

fn validate_display_name(name: &str) -> AppResult<()> {
    let len = name.trim().chars().count();
    if len == 0 || len > DISPLAY_NAME_MAX_LEN {
        return Err(AppError::Validation(format!(
            "Display name must be 1-{} characters",
            DISPLAY_NAME_MAX_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_rules() {
        assert!(validate_handle("bob").is_ok());
        assert!(validate_handle("alice_1999").is_ok());
        assert!(validate_handle("ab").is_err());
        assert!(validate_handle("a_very_long_handle").is_err());
        assert!(validate_handle("bad-name").is_err());
        assert!(validate_handle("spa ce").is_err());
    }

    #[test]
    fn test_bio_limit() {
        let update = ProfileUpdate {
            bio: Some("x".repeat(BIO_MAX_LEN)),
            ..Default::default()
        };
        assert!(update.validate().is_ok());

        let update = ProfileUpdate {
            bio: Some("x".repeat(BIO_MAX_LEN + 1)),
            ..Default::default()
        };
        assert!(matches!(update.validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_profile_update_accepts_client_aliases() {
        let update: ProfileUpdate =
            serde_json::from_str(r#"{"fullName":"Alice A.","avatar":"http://cdn/a.png"}"#).unwrap();
        assert_eq!(update.display_name.as_deref(), Some("Alice A."));
        assert_eq!(update.avatar_url.as_deref(), Some("http://cdn/a.png"));
        assert!(!update.is_empty());
    }
}

//! Plaintext payload models for the four synchronized data types.
//!
//! These are the structures that get serialized to JSON and encrypted before
//! they ever reach the wire. Account passwords are never part of
//! [`AccountConfig`]; provider credentials stay device-local.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Email account configuration (no credentials).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Email address; doubles as the stable record id for this data type.
    pub email: String,
    pub display_name: String,

    pub imap_host: String,
    pub imap_port: i32,
    pub imap_security: String, // "SSL" | "STARTTLS"

    pub smtp_host: String,
    pub smtp_port: i32,
    pub smtp_security: String, // "SSL" | "STARTTLS"

    /// How many days of mail this account keeps locally.
    #[serde(default = "default_sync_days")]
    pub sync_days: i32,

    #[serde(default)]
    pub is_default: bool,

    /// OAuth provider when the account uses OAuth ("gmail", "outlook").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_provider: Option<String>,
}

fn default_sync_days() -> i32 {
    30
}

/// Address book contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactItem {
    pub email: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    #[serde(default)]
    pub is_favorite: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ContactItem {
    pub fn new(email: String, name: Option<String>) -> Self {
        Self {
            email,
            name,
            company: None,
            phone: None,
            notes: None,
            is_favorite: false,
            updated_at: Some(Utc::now()),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }
}

/// App preferences. One logical record per user; Last-Write-Wins on conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferencesData {
    pub theme: String,    // "dark" | "light" | "system"
    pub language: String, // BCP 47-ish short code

    pub notifications_enabled: bool,
    pub notification_sound: bool,

    pub auto_mark_read: bool,
    pub auto_mark_read_delay: i32, // seconds
    pub confirm_delete: bool,
    pub confirm_send: bool,

    pub signature_position: String, // "top" | "bottom"
    pub reply_position: String,     // "top" | "bottom"

    pub compact_list_view: bool,
    pub show_avatars: bool,
    pub conversation_view: bool,
}

impl Default for PreferencesData {
    fn default() -> Self {
        Self {
            theme: "system".to_string(),
            language: "en".to_string(),
            notifications_enabled: true,
            notification_sound: true,
            auto_mark_read: true,
            auto_mark_read_delay: 3,
            confirm_delete: true,
            confirm_send: false,
            signature_position: "bottom".to_string(),
            reply_position: "top".to_string(),
            compact_list_view: false,
            show_avatars: true,
            conversation_view: true,
        }
    }
}

/// Per-account email signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureItem {
    /// Account the signature belongs to; the record id for this data type.
    pub account_email: String,
    /// HTML body.
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

//! Environment snapshot materialized on the host before each process start.
//!
//! The snapshot is rebuilt from scratch for every run and overwrites the
//! previous file completely. Only its fingerprint is ever recorded.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const SECRET_KEY: &str = "SECRET_KEY";
pub const DEBUG: &str = "DEBUG";
pub const ALLOWED_HOSTS: &str = "ALLOWED_HOSTS";
pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const AWS_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";
pub const AWS_STORAGE_BUCKET_NAME: &str = "AWS_STORAGE_BUCKET_NAME";
pub const DB_HOST: &str = "DB_HOST";
pub const DB_USER: &str = "DB_USER";
pub const DB_PASSWORD: &str = "DB_PASSWORD";
pub const DB_NAME: &str = "DB_NAME";
pub const NOTIFICATION_EMAIL: &str = "NOTIFICATION_EMAIL";
pub const SNS_CRITICAL_TOPIC_ARN: &str = "SNS_CRITICAL_TOPIC_ARN";
pub const SNS_GENERAL_TOPIC_ARN: &str = "SNS_GENERAL_TOPIC_ARN";

/// Keys the application reads from its environment file
pub const RECOGNIZED_KEYS: [&str; 14] = [
    SECRET_KEY,
    DEBUG,
    ALLOWED_HOSTS,
    AWS_ACCESS_KEY_ID,
    AWS_SECRET_ACCESS_KEY,
    AWS_DEFAULT_REGION,
    AWS_STORAGE_BUCKET_NAME,
    DB_HOST,
    DB_USER,
    DB_PASSWORD,
    DB_NAME,
    NOTIFICATION_EMAIL,
    SNS_CRITICAL_TOPIC_ARN,
    SNS_GENERAL_TOPIC_ARN,
];

/// Keys a deployment cannot start without
pub const DEFAULT_REQUIRED_KEYS: [&str; 5] = [SECRET_KEY, DB_HOST, DB_USER, DB_PASSWORD, DB_NAME];

const SECRET_KEY_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*(-_=+)";
const SECRET_KEY_LENGTH: usize = 50;

/// Problems found while building or validating a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentError {
    #[error("Missing required environment values: {}", .0.join(", "))]
    MissingKeys(Vec<String>),

    #[error("Environment value for {key} contains a line break")]
    MultilineValue { key: String },

    #[error("Invalid environment key: {key:?}")]
    InvalidKey { key: String },
}

/// Key/value configuration written to the host for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    values: BTreeMap<String, String>,
}

impl EnvironmentSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Check keys are shell identifiers, values are single-line, and every
    /// required key has a non-empty value.
    pub fn validate<S: AsRef<str>>(&self, required: &[S]) -> Result<(), EnvironmentError> {
        for (key, value) in &self.values {
            if !is_valid_key(key) {
                return Err(EnvironmentError::InvalidKey { key: key.clone() });
            }
            if value.contains('\n') || value.contains('\r') {
                return Err(EnvironmentError::MultilineValue { key: key.clone() });
            }
        }

        let missing: Vec<String> = required
            .iter()
            .map(AsRef::as_ref)
            .filter(|key| self.get(key).map_or(true, |v| v.trim().is_empty()))
            .map(str::to_string)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(EnvironmentError::MissingKeys(missing))
        }
    }

    /// Render as `KEY=value` lines, shell-quoted so the file can be sourced
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.values {
            out.push_str(key);
            out.push('=');
            out.push_str(&shell_words::quote(value));
            out.push('\n');
        }
        out
    }

    /// First 16 hex chars of the SHA-256 of the rendered file
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.render().as_bytes());
        hex::encode(&digest[..8])
    }

    /// Values of the keys the predicate marks as secret
    pub fn secret_values<F>(&self, is_secret: F) -> Vec<&str>
    where
        F: Fn(&str) -> bool,
    {
        self.values
            .iter()
            .filter(|(k, v)| is_secret(k) && !v.is_empty())
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Copy of the snapshot with secret values masked
    pub fn redacted<F>(&self, is_secret: F) -> BTreeMap<String, String>
    where
        F: Fn(&str) -> bool,
    {
        self.values
            .iter()
            .map(|(k, v)| {
                let shown = if is_secret(k) {
                    "********".to_string()
                } else {
                    v.clone()
                };
                (k.clone(), shown)
            })
            .collect()
    }
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Generate a Django-style secret key (50 chars from the Django alphabet)
pub fn generate_secret_key() -> String {
    let mut rng = rand::rng();
    (0..SECRET_KEY_LENGTH)
        .map(|_| SECRET_KEY_CHARS[rng.random_range(0..SECRET_KEY_CHARS.len())] as char)
        .collect()
}

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::Engine;
use hmac::Mac;
use rusqlite::{Connection, params};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::error::{PipelineError, Result};
use super::ports::{SecretScope, SecretStore};

type HmacSha256 = hmac::Hmac<Sha256>;

const KEY_CONTEXT: &[u8] = b"agentrun-vault-v1";

/// Encrypted secret values keyed by user, scope and name. Values are
/// AES-256-GCM encrypted at rest; nothing else in the pipeline persists them.
pub struct SecretsVault {
    db: Arc<Mutex<Connection>>,
    cipher: Aes256Gcm,
}

/// Derive a 256-bit key with HMAC-SHA256. Without explicit key material the
/// key is tied to the local host and user.
fn derive_key(material: Option<&str>) -> Result<[u8; 32]> {
    let input = match material {
        Some(material) => material.to_string(),
        None => {
            let hostname = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown-host".to_string());
            format!("{}{}", hostname, whoami::username())
        }
    };

    let mut mac = <HmacSha256 as Mac>::new_from_slice(KEY_CONTEXT)
        .map_err(|e| PipelineError::Secret(format!("Key derivation failed: {}", e)))?;
    mac.update(input.as_bytes());
    let bytes = mac.finalize().into_bytes();

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

impl SecretsVault {
    pub fn new(db: Arc<Mutex<Connection>>, key_material: Option<&str>) -> Result<Self> {
        let key = derive_key(key_material)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| PipelineError::Secret(format!("Invalid vault key: {}", e)))?;
        Ok(Self { db, cipher })
    }

    pub async fn initialize(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "CREATE TABLE IF NOT EXISTS secrets (
                user_id TEXT NOT NULL,
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (user_id, scope, name)
            )",
            [],
        )?;
        Ok(())
    }

    /// Encrypt a plaintext value. Returns base64(nonce || ciphertext).
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| PipelineError::Secret(format!("Encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(12 + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| PipelineError::Secret(format!("Base64 decode failed: {}", e)))?;

        if combined.len() < 13 {
            return Err(PipelineError::Secret("Encrypted value too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| PipelineError::Secret(format!("Decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| PipelineError::Secret(format!("UTF-8 decode failed: {}", e)))
    }

    pub async fn list_names(&self, user_id: &str, scope: &SecretScope) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT name FROM secrets WHERE user_id = ?1 AND scope = ?2 ORDER BY name")?;
        let rows = stmt.query_map(params![user_id, scope.key_prefix()], |row| row.get(0))?;

        let mut names = Vec::new();
        for name in rows {
            names.push(name?);
        }
        Ok(names)
    }

    pub async fn remove_secret(&self, user_id: &str, scope: &SecretScope, name: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "DELETE FROM secrets WHERE user_id = ?1 AND scope = ?2 AND name = ?3",
            params![user_id, scope.key_prefix(), name],
        )?;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for SecretsVault {
    async fn get_secrets(
        &self,
        user_id: &str,
        scope: &SecretScope,
        names: &[String],
    ) -> Result<BTreeMap<String, String>> {
        let encrypted: Vec<(String, String)> = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare(
                "SELECT value FROM secrets WHERE user_id = ?1 AND scope = ?2 AND name = ?3",
            )?;
            let mut found = Vec::new();
            for name in names {
                let mut rows = stmt.query(params![user_id, scope.key_prefix(), name])?;
                if let Some(row) = rows.next()? {
                    found.push((name.clone(), row.get::<_, String>(0)?));
                }
            }
            found
        };

        let mut values = BTreeMap::new();
        for (name, stored) in encrypted {
            values.insert(name, self.decrypt(&stored)?);
        }
        debug!(
            scope = %scope.key_prefix(),
            requested = names.len(),
            found = values.len(),
            "Loaded secrets"
        );
        Ok(values)
    }

    async fn set_secret(
        &self,
        user_id: &str,
        scope: &SecretScope,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let encrypted = self.encrypt(value)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO secrets (user_id, scope, name, value) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, scope, name) DO UPDATE
             SET value=excluded.value, updated_at=CURRENT_TIMESTAMP",
            params![user_id, scope.key_prefix(), name, encrypted],
        )?;
        Ok(())
    }
}

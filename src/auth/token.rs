// src/auth/token.rs

//! Signed bearer tokens
//!
//! A token is `base64url(claims-json).base64url(ed25519-signature)`. The
//! server holds the signing key; anything it signed and that has not
//! expired is trusted as-is.

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// What a token asserts about its holder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Expiry, seconds since the epoch
    pub exp: i64,
    pub primary_namespace: String,
    #[serde(default)]
    pub role_bindings: BTreeMap<String, Vec<String>>,
}

/// On-disk key format
#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    algorithm: String,
    key: String,
}

pub struct TokenSigner {
    key: SigningKey,
}

impl TokenSigner {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let file: KeyFile = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("cannot parse key file {}: {e}", path.display())))?;
        if file.algorithm != "ed25519" {
            return Err(Error::Config(format!(
                "unsupported key algorithm {} in {}",
                file.algorithm,
                path.display()
            )));
        }
        let bytes = BASE64
            .decode(&file.key)
            .map_err(|e| Error::Config(format!("invalid base64 in {}: {e}", path.display())))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Config(format!("invalid key length in {}", path.display())))?;
        Ok(Self {
            key: SigningKey::from_bytes(&bytes),
        })
    }

    /// Write the key, readable by the owner only
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = KeyFile {
            algorithm: "ed25519".to_string(),
            key: BASE64.encode(self.key.to_bytes()),
        };
        let text = toml::to_string_pretty(&file)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        fs::write(path, text)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Load the key at `path`, creating it on first use
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let signer = Self::generate();
        signer.save(path)?;
        info!("Generated token signing key at {}", path.display());
        Ok(signer)
    }

    pub fn issue(&self, claims: &Claims) -> Result<String> {
        let payload = serde_json::to_vec(claims)?;
        let signature = self.key.sign(&payload);
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }

    /// Check signature and expiry and return the claims
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let invalid = || Error::Authorization("invalid token".to_string());
        let (payload, signature) = token.split_once('.').ok_or_else(invalid)?;
        let payload = URL_SAFE_NO_PAD.decode(payload).map_err(|_| invalid())?;
        let signature = URL_SAFE_NO_PAD.decode(signature).map_err(|_| invalid())?;
        let signature = Signature::from_slice(&signature).map_err(|_| invalid())?;
        self.key
            .verifying_key()
            .verify(&payload, &signature)
            .map_err(|_| invalid())?;

        let claims: Claims = serde_json::from_slice(&payload).map_err(|_| invalid())?;
        if claims.exp <= Utc::now().timestamp() {
            return Err(Error::Authorization("token expired".to_string()));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn claims(exp: i64) -> Claims {
        Claims {
            exp,
            primary_namespace: "team".into(),
            role_bindings: BTreeMap::from([("default/*".to_string(), vec!["viewer".to_string()])]),
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let signer = TokenSigner::generate();
        let expected = claims(Utc::now().timestamp() + 3600);
        let token = signer.issue(&expected).unwrap();
        assert_eq!(signer.verify(&token).unwrap(), expected);
    }

    #[test]
    fn test_rejects_tampering_and_expiry() {
        let signer = TokenSigner::generate();
        let token = signer.issue(&claims(Utc::now().timestamp() + 3600)).unwrap();
        let (_, signature) = token.split_once('.').unwrap();
        let forged_payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&Claims {
                primary_namespace: "admin".into(),
                ..claims(Utc::now().timestamp() + 3600)
            })
            .unwrap(),
        );
        assert!(signer.verify(&format!("{forged_payload}.{signature}")).is_err());
        assert!(signer.verify("garbage").is_err());

        let other = TokenSigner::generate();
        assert!(other.verify(&token).is_err());

        let expired = signer.issue(&claims(Utc::now().timestamp() - 1)).unwrap();
        assert!(matches!(signer.verify(&expired), Err(Error::Authorization(m)) if m == "token expired"));
    }

    #[test]
    fn test_key_file_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("keys/token.key");
        let signer = TokenSigner::load_or_generate(&path).unwrap();
        let token = signer.issue(&claims(Utc::now().timestamp() + 60)).unwrap();

        let reloaded = TokenSigner::load_or_generate(&path).unwrap();
        assert!(reloaded.verify(&token).is_ok());
    }
}

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum DeclarationError {
    #[error("declaration: {0} is required")]
    MissingField(&'static str),
    #[error("declaration: not signed")]
    Unsigned,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Keyboard,
    Dictation,
    Mixed,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Keyboard => "keyboard",
            Modality::Dictation => "dictation",
            Modality::Mixed => "mixed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "keyboard" => Some(Modality::Keyboard),
            "dictation" => Some(Modality::Dictation),
            "mixed" => Some(Modality::Mixed),
            _ => None,
        }
    }
}

/// The author's signed statement about how a document was produced. The
/// signature covers the canonical JSON form with `signature` and
/// `public_key` absent; both are appended as lowercase hex once signed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Declaration {
    pub document: String,
    pub content_hash: String,
    pub chain_hash: String,
    pub modality: Modality,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_tools: Option<Vec<String>>,
    pub statement: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl Declaration {
    pub fn new(
        document: impl Into<String>,
        content_hash: [u8; 32],
        chain_hash: [u8; 32],
        modality: Modality,
        statement: impl Into<String>,
    ) -> Self {
        Self {
            document: document.into(),
            content_hash: hex::encode(content_hash),
            chain_hash: hex::encode(chain_hash),
            modality,
            ai_tools: None,
            statement: statement.into(),
            timestamp: Utc::now(),
            signature: None,
            public_key: None,
        }
    }

    pub fn with_ai_tools(mut self, tools: Vec<String>) -> Self {
        if !tools.is_empty() {
            self.ai_tools = Some(tools);
        }
        self
    }

    fn validate(&self) -> Result<(), DeclarationError> {
        if self.document.is_empty() {
            return Err(DeclarationError::MissingField("document"));
        }
        if self.content_hash.is_empty() {
            return Err(DeclarationError::MissingField("content_hash"));
        }
        if self.chain_hash.is_empty() {
            return Err(DeclarationError::MissingField("chain_hash"));
        }
        if self.statement.is_empty() {
            return Err(DeclarationError::MissingField("statement"));
        }
        Ok(())
    }

    /// Canonical JSON: the serde value with sorted object keys and the
    /// signature fields stripped. Both signer and verifier derive their
    /// bytes from this form, so field order in storage never matters.
    fn canonical_bytes(&self) -> Result<Vec<u8>, DeclarationError> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        unsigned.public_key = None;

        let value = serde_json::to_value(&unsigned)?;
        Ok(value.to_string().into_bytes())
    }

    pub fn sign(mut self, signing_key: &SigningKey) -> Result<Self, DeclarationError> {
        self.validate()?;
        let payload = self.canonical_bytes()?;
        let signature = signing_key.sign(&payload);

        self.signature = Some(hex::encode(signature.to_bytes()));
        self.public_key = Some(hex::encode(signing_key.verifying_key().to_bytes()));
        Ok(self)
    }

    pub fn verify(&self) -> bool {
        let (Some(sig_hex), Some(pk_hex)) = (&self.signature, &self.public_key) else {
            return false;
        };

        let Ok(sig_bytes) = hex::decode(sig_hex) else {
            return false;
        };
        let Ok(pk_bytes) = hex::decode(pk_hex) else {
            return false;
        };
        let sig_arr: [u8; 64] = match sig_bytes.as_slice().try_into() {
            Ok(arr) => arr,
            Err(_) => return false,
        };
        let pk_arr: [u8; 32] = match pk_bytes.as_slice().try_into() {
            Ok(arr) => arr,
            Err(_) => return false,
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&pk_arr) else {
            return false;
        };
        let Ok(payload) = self.canonical_bytes() else {
            return false;
        };

        verifying_key
            .verify(&payload, &Signature::from_bytes(&sig_arr))
            .is_ok()
    }

    pub fn encode(&self) -> Result<Vec<u8>, DeclarationError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, DeclarationError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn has_ai_usage(&self) -> bool {
        self.ai_tools.as_ref().is_some_and(|tools| !tools.is_empty())
    }
}

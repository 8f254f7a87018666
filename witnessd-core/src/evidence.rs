use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::declaration::Declaration;
use crate::event::Event;
use crate::keyhierarchy::{self, KeyHierarchyEvidence};
use crate::vdf::Parameters;
use crate::wal::RecoveryReport;

pub const FORMAT: &str = "witnessd-evidence";
const VERSION: i32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum EvidenceError {
    #[error("evidence: empty chain, nothing to export")]
    EmptyChain,
    #[error("evidence: unknown tier {0}")]
    UnknownTier(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Basic,
    Standard,
    Enhanced,
    Maximum,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Basic => "basic",
            Tier::Standard => "standard",
            Tier::Enhanced => "enhanced",
            Tier::Maximum => "maximum",
        }
    }

    pub fn parse(value: &str) -> Result<Self, EvidenceError> {
        match value {
            "basic" => Ok(Tier::Basic),
            "standard" => Ok(Tier::Standard),
            "enhanced" => Ok(Tier::Enhanced),
            "maximum" => Ok(Tier::Maximum),
            other => Err(EvidenceError::UnknownTier(other.to_string())),
        }
    }
}

/// Self-contained evidence packet a third party can check offline. All
/// hashes are lowercase hex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub version: i32,
    pub format: String,
    pub exported_at: DateTime<Utc>,
    pub tier: Tier,
    pub document: DocumentInfo,
    pub vdf_params: VdfParamsInfo,
    pub chain_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub declaration: Option<Declaration>,
    pub checkpoints: Vec<CheckpointProof>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_hierarchy: Option<KeyHierarchyPacket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keystroke: Option<KeystrokeEvidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareEvidence>,
    pub claims: Vec<Claim>,
    pub limitations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub path: String,
    pub name: String,
    pub final_hash: String,
    pub final_size: i64,
    pub checkpoints: usize,
    pub total_vdf_time: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdfParamsInfo {
    pub iterations_per_second: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointProof {
    pub ordinal: u64,
    pub timestamp: DateTime<Utc>,
    pub content_hash: String,
    pub event_hash: String,
    pub file_size: i64,
    pub size_delta: i32,
    pub vdf_iterations: u64,
    pub vdf_elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyHierarchyPacket {
    pub master_fingerprint: String,
    pub master_public_key: String,
    pub device_id: String,
    pub session_started: DateTime<Utc>,
    pub session_public_key: String,
    pub session_certificate: String,
    pub ratchet_count: u64,
    pub ratchet_public_keys: Vec<String>,
    pub signatures: Vec<RatchetSignatureProof>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetSignatureProof {
    pub index: u64,
    pub event_hash: String,
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystrokeEvidence {
    pub session_id: String,
    pub entries: u64,
    pub keystrokes: u64,
    pub jitter_samples: u64,
    pub tampered_entries: u64,
    pub clean_shutdown: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareEvidence {
    pub device_id: String,
    pub os: String,
    pub architecture: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    #[serde(rename = "type")]
    pub claim_type: ClaimType,
    pub description: String,
    pub confidence: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimType {
    ChainIntegrity,
    TimeElapsed,
    ProcessDeclared,
    KeystrokesVerified,
    KeyHierarchy,
    HardwareAttested,
}

#[derive(Debug)]
pub struct Builder {
    packet: Packet,
    errors: Vec<String>,
}

impl Builder {
    pub fn new(
        events: &[Event],
        params: Parameters,
        tier: Tier,
    ) -> Result<Self, EvidenceError> {
        let last = events.last().ok_or(EvidenceError::EmptyChain)?;

        let name = std::path::Path::new(&last.file_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| last.file_path.clone());

        let mut total_vdf_time = Duration::ZERO;
        let mut checkpoints = Vec::with_capacity(events.len());
        for (ordinal, event) in events.iter().enumerate() {
            let elapsed = Duration::from_secs_f64(
                event.vdf_iterations as f64 / params.iterations_per_second as f64,
            );
            total_vdf_time += elapsed;
            checkpoints.push(CheckpointProof {
                ordinal: ordinal as u64,
                timestamp: nanos_to_datetime(event.timestamp_ns),
                content_hash: hex::encode(event.content_hash),
                event_hash: hex::encode(event.event_hash),
                file_size: event.file_size,
                size_delta: event.size_delta,
                vdf_iterations: event.vdf_iterations,
                vdf_elapsed: elapsed,
                message: event.context_msg.clone(),
            });
        }

        let packet = Packet {
            version: VERSION,
            format: FORMAT.to_string(),
            exported_at: Utc::now(),
            tier,
            document: DocumentInfo {
                path: last.file_path.clone(),
                name,
                final_hash: hex::encode(last.content_hash),
                final_size: last.file_size,
                checkpoints: events.len(),
                total_vdf_time,
            },
            vdf_params: VdfParamsInfo {
                iterations_per_second: params.iterations_per_second,
            },
            chain_hash: hex::encode(last.event_hash),
            declaration: None,
            checkpoints,
            key_hierarchy: None,
            keystroke: None,
            hardware: None,
            claims: vec![
                Claim {
                    claim_type: ClaimType::ChainIntegrity,
                    description: "Every checkpoint links to its predecessor by hash".to_string(),
                    confidence: "cryptographic".to_string(),
                },
                Claim {
                    claim_type: ClaimType::TimeElapsed,
                    description: format!(
                        "Sequential VDF proofs demonstrate at least {:.1} seconds of elapsed time",
                        total_vdf_time.as_secs_f64()
                    ),
                    confidence: "cryptographic".to_string(),
                },
            ],
            limitations: vec![
                "Does not prove cognitive origin of the content".to_string(),
                "Does not prove absence of AI assistance".to_string(),
            ],
        };

        Ok(Self {
            packet,
            errors: Vec::new(),
        })
    }

    pub fn with_declaration(mut self, declaration: &Declaration) -> Self {
        if !declaration.verify() {
            self.errors.push("declaration signature invalid".to_string());
            return self;
        }
        self.packet.claims.push(Claim {
            claim_type: ClaimType::ProcessDeclared,
            description: "Author signed a statement about the writing process".to_string(),
            confidence: "attested".to_string(),
        });
        self.packet.declaration = Some(declaration.clone());
        self
    }

    pub fn with_key_hierarchy(mut self, evidence: &KeyHierarchyEvidence) -> Self {
        if keyhierarchy::verify_key_hierarchy(evidence).is_err() {
            self.errors.push("key hierarchy evidence invalid".to_string());
            return self;
        }

        self.packet.key_hierarchy = Some(KeyHierarchyPacket {
            master_fingerprint: evidence.master_fingerprint.clone(),
            master_public_key: hex::encode(&evidence.master_public_key),
            device_id: evidence.device_id.clone(),
            session_started: nanos_to_datetime(evidence.certificate.started_at_ns),
            session_public_key: hex::encode(&evidence.certificate.session_pubkey),
            session_certificate: hex::encode(evidence.certificate.signature),
            ratchet_count: evidence.ratchet_count,
            ratchet_public_keys: evidence
                .ratchet_public_keys
                .iter()
                .map(hex::encode)
                .collect(),
            signatures: evidence
                .signatures
                .iter()
                .map(|sig| RatchetSignatureProof {
                    index: sig.index,
                    event_hash: hex::encode(sig.event_hash),
                    public_key: hex::encode(&sig.public_key),
                    signature: hex::encode(sig.signature),
                })
                .collect(),
        });
        self.packet.claims.push(Claim {
            claim_type: ClaimType::KeyHierarchy,
            description: "Checkpoints signed by forward-secret ratchet keys under a device identity"
                .to_string(),
            confidence: "cryptographic".to_string(),
        });
        self
    }

    pub fn with_keystroke(mut self, session_id: &str, report: &RecoveryReport) -> Self {
        self.packet.keystroke = Some(KeystrokeEvidence {
            session_id: session_id.to_string(),
            entries: report.entries_recovered,
            keystrokes: report.keystrokes_recovered,
            jitter_samples: report.jitter_samples_recovered,
            tampered_entries: report.tampered_entries,
            clean_shutdown: report.clean_shutdown,
        });
        self.packet.claims.push(Claim {
            claim_type: ClaimType::KeystrokesVerified,
            description: format!(
                "{} keystroke counts recorded in a tamper-evident session log",
                report.keystrokes_recovered
            ),
            confidence: "recorded".to_string(),
        });
        self
    }

    pub fn with_hardware(mut self, device_id: &str) -> Self {
        self.packet.hardware = Some(HardwareEvidence {
            device_id: device_id.to_string(),
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
        });
        self.packet.claims.push(Claim {
            claim_type: ClaimType::HardwareAttested,
            description: "Events bound to a device-unique software identity".to_string(),
            confidence: "derived".to_string(),
        });
        self
    }

    /// Assemble the packet. Section failures collected along the way
    /// become limitations rather than hard errors; the rest of the
    /// evidence still stands.
    pub fn build(mut self) -> Packet {
        for error in self.errors {
            self.packet
                .limitations
                .push(format!("section omitted: {error}"));
        }
        self.packet
    }
}

/// Result of checking a packet offline. Crypto failures in one section do
/// not stop evaluation of the others.
#[derive(Debug)]
pub struct PacketVerification {
    pub chain_valid: bool,
    pub declaration_valid: Option<bool>,
    pub key_hierarchy_valid: Option<bool>,
    pub errors: Vec<String>,
}

impl PacketVerification {
    pub fn all_valid(&self) -> bool {
        self.chain_valid
            && self.declaration_valid.unwrap_or(true)
            && self.key_hierarchy_valid.unwrap_or(true)
    }
}

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>, EvidenceError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, EvidenceError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn hash(&self) -> Result<[u8; 32], EvidenceError> {
        Ok(Sha256::digest(self.encode()?).into())
    }

    /// Verify everything the packet claims that can be checked from the
    /// packet alone (full VDF recomputation happens against the store
    /// via [`engine::verify_chain`]).
    pub fn verify(&self) -> PacketVerification {
        let mut errors = Vec::new();

        let mut chain_valid = true;
        if self.checkpoints.is_empty() {
            chain_valid = false;
            errors.push("packet carries no checkpoints".to_string());
        }
        for (i, pair) in self.checkpoints.windows(2).enumerate() {
            if pair[1].ordinal != pair[0].ordinal + 1 {
                chain_valid = false;
                errors.push(format!("checkpoint {}: ordinal gap", i + 1));
            }
            if pair[1].timestamp < pair[0].timestamp {
                chain_valid = false;
                errors.push(format!("checkpoint {}: timestamp regression", i + 1));
            }
        }
        if let Some(last) = self.checkpoints.last() {
            if last.event_hash != self.chain_hash {
                chain_valid = false;
                errors.push("chain hash does not match final checkpoint".to_string());
            }
            if last.content_hash != self.document.final_hash {
                chain_valid = false;
                errors.push("document final hash does not match final checkpoint".to_string());
            }
        }

        let declaration_valid = self.declaration.as_ref().map(|decl| {
            let ok = decl.verify();
            if !ok {
                errors.push("declaration signature invalid".to_string());
            }
            if decl.chain_hash != self.chain_hash {
                errors.push("declaration bound to a different chain".to_string());
                return false;
            }
            ok
        });

        let key_hierarchy_valid = self.key_hierarchy.as_ref().map(|kh| {
            let ok = verify_key_hierarchy_packet(kh, &self.checkpoints);
            if !ok {
                errors.push("key hierarchy section invalid".to_string());
            }
            ok
        });

        PacketVerification {
            chain_valid,
            declaration_valid,
            key_hierarchy_valid,
            errors,
        }
    }
}

/// A signature only counts if it binds to the checkpoint recorded at its
/// position in this same packet; signatures copied from another chain are
/// internally consistent but fail the cross-bind.
fn verify_key_hierarchy_packet(kh: &KeyHierarchyPacket, checkpoints: &[CheckpointProof]) -> bool {
    if kh.ratchet_count != kh.signatures.len() as u64 {
        return false;
    }
    if kh.signatures.len() > checkpoints.len() {
        return false;
    }
    // The session's signatures cover the most recent checkpoints.
    let signed = &checkpoints[checkpoints.len() - kh.signatures.len()..];
    for (i, sig) in kh.signatures.iter().enumerate() {
        if sig.index != i as u64 {
            return false;
        }
        if sig.event_hash != signed[i].event_hash {
            return false;
        }
        let (Ok(pk), Ok(hash), Ok(signature)) = (
            hex::decode(&sig.public_key),
            hex::decode(&sig.event_hash),
            hex::decode(&sig.signature),
        ) else {
            return false;
        };
        let hash: [u8; 32] = match hash.as_slice().try_into() {
            Ok(arr) => arr,
            Err(_) => return false,
        };
        let signature: [u8; 64] = match signature.as_slice().try_into() {
            Ok(arr) => arr,
            Err(_) => return false,
        };
        if keyhierarchy::verify_ratchet_signature(&pk, &hash, &signature).is_err() {
            return false;
        }
    }
    true
}

fn nanos_to_datetime(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

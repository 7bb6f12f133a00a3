//! Session outcomes and their commitment records

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag identifying the kind of outcome a session produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    KeygenResult,
    SignResult,
    ReshareResult,
    ErrorResult,
    TimeoutResult,
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ResultType::KeygenResult => "keygen_result",
            ResultType::SignResult => "sign_result",
            ResultType::ReshareResult => "reshare_result",
            ResultType::ErrorResult => "error_result",
            ResultType::TimeoutResult => "timeout_result",
        };
        f.write_str(tag)
    }
}

/// Type tag of an anchored commitment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitmentKind {
    #[serde(rename = "keygen")]
    Keygen,
    #[serde(rename = "sign_result")]
    SignResult,
    #[serde(rename = "reshare")]
    Reshare,
    #[serde(rename = "blame")]
    Blame,
}

/// Normalized record of a finished session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    #[serde(rename = "type")]
    pub kind: CommitmentKind,
    pub session_id: String,
    pub key_id: String,
    pub commitment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CommitmentMetadata>,
    pub block_height: u64,
    pub epoch: u64,
}

/// Extra detail anchored with a blame commitment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Identity of the session an outcome belongs to.
///
/// For resharing `epoch` is the new epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub session_id: String,
    pub key_id: String,
    pub epoch: u64,
    pub block_height: u64,
}

impl SessionHeader {
    fn commitment(
        &self,
        kind: CommitmentKind,
        commitment: &str,
        public_key: Option<String>,
        metadata: Option<CommitmentMetadata>,
    ) -> Commitment {
        Commitment {
            kind,
            session_id: self.session_id.clone(),
            key_id: self.key_id.clone(),
            commitment: commitment.to_string(),
            public_key,
            metadata,
            block_height: self.block_height,
            epoch: self.epoch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGenResult {
    pub header: SessionHeader,
    /// Compressed group public key
    pub public_key: Vec<u8>,
    pub participants: Vec<String>,
    /// Commitment over the participants
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySignResult {
    pub header: SessionHeader,
    /// Message as submitted for signing
    pub message: Vec<u8>,
    /// DER for ECDSA, `R || S` for EdDSA
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReshareResult {
    pub header: SessionHeader,
    pub new_participants: Vec<String>,
    /// Commitment over the new participants
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutResult {
    pub header: SessionHeader,
    pub culprits: Vec<String>,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResult {
    pub header: SessionHeader,
    /// Peers blamed by the engine, empty for local failures
    pub culprits: Vec<String>,
    pub error: String,
    /// Commitment over the culprits, empty without culprits
    pub digest: String,
}

/// Terminal outcome of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    KeyGen(KeyGenResult),
    Sign(KeySignResult),
    Reshare(ReshareResult),
    Error(ErrorResult),
    Timeout(TimeoutResult),
}

impl Outcome {
    pub fn result_type(&self) -> ResultType {
        match self {
            Outcome::KeyGen(_) => ResultType::KeygenResult,
            Outcome::Sign(_) => ResultType::SignResult,
            Outcome::Reshare(_) => ResultType::ReshareResult,
            Outcome::Error(_) => ResultType::ErrorResult,
            Outcome::Timeout(_) => ResultType::TimeoutResult,
        }
    }

    pub fn header(&self) -> &SessionHeader {
        match self {
            Outcome::KeyGen(r) => &r.header,
            Outcome::Sign(r) => &r.header,
            Outcome::Reshare(r) => &r.header,
            Outcome::Error(r) => &r.header,
            Outcome::Timeout(r) => &r.header,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Outcome::KeyGen(_) | Outcome::Sign(_) | Outcome::Reshare(_)
        )
    }

    /// Accounts blamed for a failed session
    pub fn culprits(&self) -> &[String] {
        match self {
            Outcome::Error(r) => &r.culprits,
            Outcome::Timeout(r) => &r.culprits,
            _ => &[],
        }
    }

    /// Project into the record anchored on chain
    pub fn commitment(&self) -> Commitment {
        match self {
            Outcome::KeyGen(r) => r.header.commitment(
                CommitmentKind::Keygen,
                &r.digest,
                Some(hex::encode(&r.public_key)),
                None,
            ),
            Outcome::Sign(r) => {
                r.header
                    .commitment(CommitmentKind::SignResult, "", None, None)
            }
            Outcome::Reshare(r) => {
                r.header
                    .commitment(CommitmentKind::Reshare, &r.digest, None, None)
            }
            Outcome::Timeout(r) => {
                r.header
                    .commitment(CommitmentKind::Blame, &r.digest, None, None)
            }
            Outcome::Error(r) => r.header.commitment(
                CommitmentKind::Blame,
                &r.digest,
                None,
                Some(CommitmentMetadata {
                    error: Some(r.error.clone()),
                }),
            ),
        }
    }
}

impl From<KeyGenResult> for Outcome {
    fn from(result: KeyGenResult) -> Self {
        Outcome::KeyGen(result)
    }
}

impl From<KeySignResult> for Outcome {
    fn from(result: KeySignResult) -> Self {
        Outcome::Sign(result)
    }
}

impl From<ReshareResult> for Outcome {
    fn from(result: ReshareResult) -> Self {
        Outcome::Reshare(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> SessionHeader {
        SessionHeader {
            session_id: "s1".into(),
            key_id: "main".into(),
            epoch: 4,
            block_height: 120,
        }
    }

    #[test]
    fn test_keygen_commitment() {
        let outcome = Outcome::from(KeyGenResult {
            header: header(),
            public_key: vec![0x02, 0xab],
            participants: vec!["alice".into()],
            digest: "Bw".into(),
        });
        let commitment = outcome.commitment();
        assert_eq!(commitment.kind, CommitmentKind::Keygen);
        assert_eq!(commitment.public_key.as_deref(), Some("02ab"));
        assert_eq!(commitment.commitment, "Bw");
        assert_eq!(outcome.result_type().to_string(), "keygen_result");
        assert!(outcome.is_success());
    }

    #[test]
    fn test_sign_commitment_is_empty() {
        let outcome = Outcome::from(KeySignResult {
            header: header(),
            message: b"hello".to_vec(),
            signature: vec![1; 64],
        });
        let commitment = outcome.commitment();
        assert_eq!(commitment.kind, CommitmentKind::SignResult);
        assert!(commitment.public_key.is_none());
        assert!(commitment.commitment.is_empty());
    }

    #[test]
    fn test_blame_commitments() {
        let timeout = Outcome::Timeout(TimeoutResult {
            header: header(),
            culprits: vec!["frank".into()],
            digest: "AQ".into(),
        });
        assert_eq!(timeout.commitment().kind, CommitmentKind::Blame);
        assert_eq!(timeout.culprits(), ["frank".to_string()]);
        assert!(timeout.commitment().metadata.is_none());

        let error = Outcome::Error(ErrorResult {
            header: header(),
            culprits: vec![],
            error: "boom".into(),
            digest: String::new(),
        });
        let commitment = error.commitment();
        assert_eq!(commitment.kind, CommitmentKind::Blame);
        assert_eq!(
            commitment.metadata.as_ref().and_then(|m| m.error.as_deref()),
            Some("boom")
        );
        assert_eq!(commitment.commitment, "");
        assert!(!error.is_success());

        let json = serde_json::to_value(&commitment).unwrap();
        assert_eq!(json["metadata"], serde_json::json!({ "error": "boom" }));
    }

    #[test]
    fn test_commitment_field_names() {
        let outcome = Outcome::Reshare(ReshareResult {
            header: header(),
            new_participants: vec!["bob".into()],
            digest: "Ag".into(),
        });
        let json = serde_json::to_value(outcome.commitment()).unwrap();
        assert_eq!(json["type"], "reshare");
        assert_eq!(json["session_id"], "s1");
        assert_eq!(json["key_id"], "main");
        assert_eq!(json["commitment"], "Ag");
        assert_eq!(json["block_height"], 120);
        assert_eq!(json["epoch"], 4);
        assert!(json.get("public_key").is_none());
        assert!(json.get("metadata").is_none());
    }
}

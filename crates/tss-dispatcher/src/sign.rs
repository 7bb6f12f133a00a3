//! Signing sessions

use crate::keygen::SessionParams;
use crate::keystore::load_save_data;
use crate::participant::Committee;
use crate::result::{KeySignResult, Outcome};
use crate::session::{engine, Engine, NodeContext, SessionState, SessionStatus, Terminal};
use crate::transport::CommitteeTag;
use crate::{DispatchError, Dispatcher, Result};
use async_trait::async_trait;
use k256::ecdsa::Signature as EcdsaSignature;
use k256::FieldBytes;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, info, instrument, warn};
use tss_engine::sign::LocalParty;
use tss_engine::{Ed25519, Parameters, Party, Secp256k1, SignatureData, SigningAlgo};

/// Bytes the engine actually signs
pub fn signing_digest(algo: SigningAlgo, message: &[u8]) -> Result<Vec<u8>> {
    match algo {
        SigningAlgo::Ecdsa => {
            if message.len() != 32 {
                return Err(DispatchError::InvalidConfig(format!(
                    "ECDSA signs a 32-byte digest, got {} bytes",
                    message.len()
                )));
            }
            Ok(message.to_vec())
        }
        SigningAlgo::Eddsa => {
            // big-integer encoding: no leading zero bytes
            let start = message
                .iter()
                .position(|b| *b != 0)
                .unwrap_or(message.len());
            Ok(message[start..].to_vec())
        }
    }
}

/// Canonical encoding of an engine signature: low-S DER for ECDSA,
/// `R || S` for EdDSA
pub fn canonical_signature(algo: SigningAlgo, data: &SignatureData) -> Result<Vec<u8>> {
    match algo {
        SigningAlgo::Ecdsa => {
            if data.r.len() != 32 || data.s.len() != 32 {
                return Err(DispatchError::Serialization(
                    "ECDSA signature components must be 32 bytes".into(),
                ));
            }
            let signature = EcdsaSignature::from_scalars(
                FieldBytes::clone_from_slice(&data.r),
                FieldBytes::clone_from_slice(&data.s),
            )
            .map_err(|e| DispatchError::Serialization(e.to_string()))?;
            let signature = signature.normalize_s().unwrap_or(signature);
            Ok(signature.to_der().as_bytes().to_vec())
        }
        SigningAlgo::Eddsa => {
            let signature = ed25519_dalek::Signature::from_slice(&data.signature)
                .map_err(|e| DispatchError::Serialization(e.to_string()))?;
            Ok(signature.to_bytes().to_vec())
        }
    }
}

/// Runs a signing session with a previously stored share
pub struct SignDispatcher {
    state: Arc<SessionState<KeySignResult>>,
    params: SessionParams,
    message: Vec<u8>,
    committee: OnceLock<Committee>,
    engine: OnceLock<Engine>,
}

impl SignDispatcher {
    pub fn new(ctx: NodeContext, params: SessionParams, message: Vec<u8>) -> Self {
        Self {
            state: SessionState::new(ctx, params.header()),
            params,
            message,
            committee: OnceLock::new(),
            engine: OnceLock::new(),
        }
    }
}

#[async_trait]
impl Dispatcher for SignDispatcher {
    fn session_id(&self) -> &str {
        self.state.session_id()
    }

    fn key_id(&self) -> &str {
        &self.params.key_id
    }

    fn status(&self) -> SessionStatus {
        self.state.status()
    }

    #[instrument(skip(self), fields(session_id = %self.params.session_id, key_id = %self.params.key_id))]
    async fn start(&self) -> Result<()> {
        let starting = self.state.begin()?;
        let ctx = &self.state.ctx;
        let algo = self.params.algo;

        let committee = Committee::resolve(&self.params.participants, &self.params.session_id, 1)?;
        let me = committee
            .find(&ctx.account)
            .cloned()
            .ok_or_else(|| DispatchError::SelfNotFound(ctx.account.clone()))?;
        let threshold = committee.engine_threshold()?;

        let key = load_save_data(ctx.keystore.as_ref(), &self.params.key_id, self.params.epoch).await?;
        if key.algo != algo {
            return Err(DispatchError::InvalidConfig(format!(
                "key {} is an {} key, not {}",
                self.params.key_id, key.algo, algo
            )));
        }
        let digest = signing_digest(algo, &self.message)?;
        let parameters = Parameters::new(me.clone(), committee.parties().clone(), threshold)?;

        let (out_tx, out_rx) = unbounded_channel();
        let (end_tx, mut end_rx) = unbounded_channel::<SignatureData>();
        let party: Box<dyn Party> = match algo {
            SigningAlgo::Ecdsa => Box::new(LocalParty::<Secp256k1>::new(
                parameters, &key, digest, out_tx, end_tx,
            )?),
            SigningAlgo::Eddsa => Box::new(LocalParty::<Ed25519>::new(
                parameters, &key, digest, out_tx, end_tx,
            )?),
        };
        let party = engine(party);

        info!(parties = committee.len(), threshold, "Starting signing");
        let _ = self.committee.set(committee.clone());
        let _ = self.engine.set(Arc::clone(&party));
        starting.mark_running();

        self.state.spawn_pump(committee, me, out_rx);

        let weak = Arc::downgrade(&self.state);
        let message = self.message.clone();
        tokio::spawn(async move {
            if let Some(data) = end_rx.recv().await {
                let Some(state) = weak.upgrade() else {
                    return;
                };
                let terminal = match canonical_signature(algo, &data) {
                    Ok(signature) => {
                        debug!(signature = hex::encode(&signature), "Signature produced");
                        Terminal::Finished(KeySignResult {
                            header: state.header.clone(),
                            message,
                            signature,
                        })
                    }
                    Err(err) => Terminal::Fatal(err),
                };
                state.complete(terminal).await;
            }
        });

        self.state.start_engines(&[party]).await;
        Ok(())
    }

    async fn done(&self) -> Result<Outcome> {
        let engines: Vec<Engine> = self.engine.get().cloned().into_iter().collect();
        self.state.resolve(&engines).await
    }

    async fn handle_p2p(
        &self,
        payload: &[u8],
        from: &str,
        is_broadcast: bool,
        _committee: CommitteeTag,
        _origin: Option<CommitteeTag>,
    ) {
        let (Some(committee), Some(engine)) = (self.committee.get(), self.engine.get()) else {
            warn!(session_id = %self.params.session_id, from, "Message before engine start dropped");
            return;
        };
        let Some(sender) = committee.find(from) else {
            warn!(session_id = %self.params.session_id, from, "Message from unknown sender dropped");
            return;
        };
        self.state.feed(engine, payload, sender, is_broadcast).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::elliptic_curve::PrimeField;
    use k256::Scalar;

    #[test]
    fn test_ecdsa_digest_length() {
        assert!(signing_digest(SigningAlgo::Ecdsa, &[1; 32]).is_ok());
        let err = signing_digest(SigningAlgo::Ecdsa, &[1; 31]).unwrap_err();
        assert!(err.is_configuration());
        assert!(signing_digest(SigningAlgo::Ecdsa, b"").is_err());
    }

    #[test]
    fn test_eddsa_digest_strips_leading_zeros() {
        assert_eq!(
            signing_digest(SigningAlgo::Eddsa, &[0, 0, 5, 0, 7]).unwrap(),
            vec![5, 0, 7]
        );
        assert_eq!(signing_digest(SigningAlgo::Eddsa, b"hello").unwrap(), b"hello");
        assert!(signing_digest(SigningAlgo::Eddsa, &[0, 0]).unwrap().is_empty());
    }

    fn ecdsa_data(r: Scalar, s: Scalar) -> SignatureData {
        let (r, s) = (r.to_repr().to_vec(), s.to_repr().to_vec());
        SignatureData {
            signature: [r.clone(), s.clone()].concat(),
            r,
            s,
            recovery_id: 0,
            message: vec![0; 32],
        }
    }

    #[test]
    fn test_high_and_low_s_encode_identically() {
        let r = Scalar::from(12345u64);
        let s = Scalar::from(678u64);

        let low = canonical_signature(SigningAlgo::Ecdsa, &ecdsa_data(r, s)).unwrap();
        let high = canonical_signature(SigningAlgo::Ecdsa, &ecdsa_data(r, -s)).unwrap();
        assert_eq!(low, high);

        let parsed = EcdsaSignature::from_der(&low).unwrap();
        assert!(parsed.normalize_s().is_none());
    }

    #[test]
    fn test_zero_scalar_is_rejected() {
        let data = ecdsa_data(Scalar::ZERO, Scalar::ONE);
        assert!(canonical_signature(SigningAlgo::Ecdsa, &data).is_err());
    }

    #[test]
    fn test_eddsa_signature_length() {
        let data = SignatureData {
            r: vec![1; 32],
            s: vec![2; 32],
            recovery_id: 0,
            signature: [vec![1; 32], vec![2; 32]].concat(),
            message: b"hi".to_vec(),
        };
        assert_eq!(canonical_signature(SigningAlgo::Eddsa, &data).unwrap().len(), 64);

        let short = SignatureData {
            signature: vec![1; 63],
            ..data
        };
        assert!(canonical_signature(SigningAlgo::Eddsa, &short).is_err());
    }
}

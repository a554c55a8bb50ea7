// Feed message signing (Ed25519) and the client-side verification policy.
use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use plume_wire::FeedMessage;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

pub type Result<T> = std::result::Result<T, VerifyError>;

#[derive(thiserror::Error, Debug)]
pub enum VerifyError {
    #[error("message {sequence} carries no signature")]
    MissingSignature { sequence: u64 },
    #[error("message {sequence} signature is malformed")]
    MalformedSignature { sequence: u64 },
    #[error("message {sequence} signature does not verify")]
    BadSignature { sequence: u64 },
    #[error("invalid verifying key")]
    InvalidKey,
}

/// How a client treats feed signatures.
///
/// `Enforced` is the default everywhere a verifier is constructed.
/// `AcceptMissing` tolerates absent or failing signatures and delivers the
/// message anyway; it exists for controlled test and operational setups
/// and must be selected explicitly in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerificationMode {
    #[default]
    Enforced,
    AcceptMissing,
}

/// Outcome of a successful verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Verified,
    // Only reachable in AcceptMissing mode.
    Unverified,
}

// Digest covered by the feed signature: big-endian sequence number
// followed by the raw payload. The advisory block hash is deliberately
// not covered; the signature binds content identity, not the claim.
pub fn message_digest(sequence: u64, payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_be_bytes());
    hasher.update(payload);
    hasher.finalize().into()
}

/// Signing half of the feed identity, held by the sequencer process.
///
/// ```
/// use bytes::Bytes;
/// use plume_crypto::{FeedSigner, FeedVerifier, VerificationMode};
/// use plume_wire::FeedMessage;
///
/// let signer = FeedSigner::generate();
/// let mut message = FeedMessage::new(1, Bytes::from_static(b"tx"), None);
/// signer.sign_message(&mut message);
/// let verifier =
///     FeedVerifier::from_bytes(&signer.verifying_key_bytes(), VerificationMode::Enforced)
///         .expect("key");
/// assert!(verifier.verify(&message).is_ok());
/// ```
#[derive(Clone)]
pub struct FeedSigner {
    signing_key: SigningKey,
}

impl FeedSigner {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn signing_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, sequence: u64, payload: &[u8]) -> [u8; 64] {
        let digest = message_digest(sequence, payload);
        self.signing_key.sign(&digest).to_bytes()
    }

    // Stamp the signature onto a message in place.
    pub fn sign_message(&self, message: &mut FeedMessage) {
        let signature = self.sign(message.sequence_number, &message.payload);
        message.signature = Some(Bytes::copy_from_slice(&signature));
    }
}

impl std::fmt::Debug for FeedSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSigner").finish_non_exhaustive()
    }
}

/// Verification half, held by every subscriber that enforces signatures.
#[derive(Debug, Clone)]
pub struct FeedVerifier {
    verifying_key: VerifyingKey,
    mode: VerificationMode,
}

impl FeedVerifier {
    pub fn from_bytes(bytes: &[u8; 32], mode: VerificationMode) -> Result<Self> {
        let verifying_key = VerifyingKey::from_bytes(bytes).map_err(|_| VerifyError::InvalidKey)?;
        Ok(Self {
            verifying_key,
            mode,
        })
    }

    pub fn mode(&self) -> VerificationMode {
        self.mode
    }

    /// Check a message against the expected signer.
    ///
    /// In `Enforced` mode a missing, malformed, or failing signature is an
    /// error; callers treat it as a connection-fatal protocol fault. In
    /// `AcceptMissing` mode the same conditions degrade to
    /// `Verification::Unverified` and are logged here, once per message.
    pub fn verify(&self, message: &FeedMessage) -> Result<Verification> {
        match self.verify_strict(message) {
            Ok(()) => Ok(Verification::Verified),
            Err(err) => match self.mode {
                VerificationMode::Enforced => Err(err),
                VerificationMode::AcceptMissing => {
                    tracing::warn!(
                        sequence = message.sequence_number,
                        error = %err,
                        "accepting unverified feed message"
                    );
                    Ok(Verification::Unverified)
                }
            },
        }
    }

    fn verify_strict(&self, message: &FeedMessage) -> Result<()> {
        let sequence = message.sequence_number;
        let raw = message
            .signature
            .as_ref()
            .ok_or(VerifyError::MissingSignature { sequence })?;
        let bytes: [u8; 64] = raw
            .as_ref()
            .try_into()
            .map_err(|_| VerifyError::MalformedSignature { sequence })?;
        let signature = Signature::from_bytes(&bytes);
        let digest = message_digest(sequence, &message.payload);
        self.verifying_key
            .verify(&digest, &signature)
            .map_err(|_| VerifyError::BadSignature { sequence })
    }
}

//! Faucet signing identity

use crate::config::Secret;
use crate::error::{FaucetError, FaucetResult};
use bech32::{Bech32, Hrp};
use k256::ecdsa::{signature::Signer, Signature, SigningKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

const HARDENED: u32 = 0x8000_0000;
const DERIVATION_DOMAIN: &[u8] = b"empe-faucet/key/v1";

/// Where in the key hierarchy the faucet account lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationParams {
    /// Bech32 prefix of the resulting address
    pub prefix: String,
    /// e.g. `m/44'/118'/0'/0/0`. Salts the derivation; it does not walk a
    /// BIP-32 tree.
    pub hd_path: String,
}

/// Key material and the address it controls
pub struct SignerIdentity {
    signing_key: SigningKey,
    address: String,
}

impl SignerIdentity {
    pub fn new(signing_key: SigningKey, prefix: &str) -> FaucetResult<Self> {
        let public_key = signing_key.verifying_key().to_encoded_point(true);
        let account = Ripemd160::digest(Sha256::digest(public_key.as_bytes()));
        let hrp = Hrp::parse(prefix)
            .map_err(|e| FaucetError::KeyDerivation(format!("Invalid address prefix: {}", e)))?;
        let address = bech32::encode::<Bech32>(hrp, &account)
            .map_err(|e| FaucetError::KeyDerivation(format!("Address encoding failed: {}", e)))?;

        Ok(Self {
            signing_key,
            address,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// SEC1 compressed public key
    pub fn public_key(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    /// ECDSA/secp256k1 signature over SHA-256 of `payload`, as 64 bytes `r || s`
    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(payload);
        signature.to_bytes().to_vec()
    }
}

impl fmt::Debug for SignerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerIdentity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Turns a secret phrase into a signing identity.
///
/// Implementations may be slow (KDFs, hardware wallets); callers go through
/// [`Wallet`], which derives once and reuses the result.
pub trait KeyProvider: Send + Sync {
    fn derive_identity(
        &self,
        secret_phrase: &str,
        params: &DerivationParams,
    ) -> FaucetResult<SignerIdentity>;
}

/// Deterministic provider: the secp256k1 key is SHA-256 over a domain tag,
/// the normalized phrase and the parsed derivation path.
///
/// Keys are stable for a given phrase and path but do not match BIP-32
/// wallets; fund the faucet address it logs at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecretPhraseKeyProvider;

impl KeyProvider for SecretPhraseKeyProvider {
    fn derive_identity(
        &self,
        secret_phrase: &str,
        params: &DerivationParams,
    ) -> FaucetResult<SignerIdentity> {
        let words = normalize_phrase(secret_phrase)?;
        let path = parse_hd_path(&params.hd_path)?;

        let mut hasher = Sha256::new();
        hasher.update(DERIVATION_DOMAIN);
        hasher.update(words.join(" ").as_bytes());
        hasher.update([0u8]);
        for index in &path {
            hasher.update(index.to_be_bytes());
        }
        let seed = hasher.finalize();

        let signing_key = SigningKey::from_slice(&seed)
            .map_err(|e| FaucetError::KeyDerivation(format!("Invalid derived key: {}", e)))?;
        SignerIdentity::new(signing_key, &params.prefix)
    }
}

fn normalize_phrase(phrase: &str) -> FaucetResult<Vec<String>> {
    let words: Vec<String> = phrase.split_whitespace().map(str::to_lowercase).collect();

    if ![12, 15, 18, 21, 24].contains(&words.len()) {
        return Err(FaucetError::KeyDerivation(format!(
            "Secret phrase must have 12, 15, 18, 21 or 24 words, got {}",
            words.len()
        )));
    }
    if let Some(bad) = words
        .iter()
        .find(|w| !w.chars().all(|c| c.is_ascii_lowercase()))
    {
        return Err(FaucetError::KeyDerivation(format!(
            "Secret phrase contains an invalid word: {:?}",
            bad
        )));
    }
    Ok(words)
}

/// Parses `m/44'/118'/0'/0/0` into child indexes, hardened ones offset by 2^31.
pub fn parse_hd_path(path: &str) -> FaucetResult<Vec<u32>> {
    let invalid =
        |reason: &str| FaucetError::KeyDerivation(format!("Invalid HD path {:?}: {}", path, reason));

    let mut segments = path.trim().split('/');
    if segments.next() != Some("m") {
        return Err(invalid("must start with m"));
    }

    let indexes = segments
        .map(|segment| {
            let hardened_digits = segment
                .strip_suffix('\'')
                .or_else(|| segment.strip_suffix('h'));
            let (digits, hardened) = match hardened_digits {
                Some(digits) => (digits, true),
                None => (segment, false),
            };
            let index: u32 = digits.parse().map_err(|_| invalid("non-numeric segment"))?;
            if index >= HARDENED {
                return Err(invalid("index out of range"));
            }
            Ok(if hardened { index | HARDENED } else { index })
        })
        .collect::<FaucetResult<Vec<u32>>>()?;

    if indexes.is_empty() {
        return Err(invalid("no child indexes"));
    }
    Ok(indexes)
}

/// Lazily derived, cached faucet identity.
pub struct Wallet {
    provider: Arc<dyn KeyProvider>,
    secret: Secret,
    params: DerivationParams,
    identity: OnceCell<Arc<SignerIdentity>>,
}

impl Wallet {
    pub fn new(provider: Arc<dyn KeyProvider>, secret: Secret, params: DerivationParams) -> Self {
        Self {
            provider,
            secret,
            params,
            identity: OnceCell::new(),
        }
    }

    /// Derive on first use; later calls return the same identity. A failed
    /// derivation is not cached.
    pub async fn identity(&self) -> FaucetResult<Arc<SignerIdentity>> {
        self.identity
            .get_or_try_init(|| async {
                let identity = self
                    .provider
                    .derive_identity(self.secret.expose(), &self.params)?;
                info!("Faucet address: {}", identity.address());
                Ok::<_, FaucetError>(Arc::new(identity))
            })
            .await
            .map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::{AddressValidator, Bech32Validator};
    use k256::ecdsa::signature::Verifier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PHRASE: &str = "abandon ability able about above absent absorb abstract absurd abuse access accident";

    fn params() -> DerivationParams {
        DerivationParams {
            prefix: "empe".to_string(),
            hd_path: "m/44'/118'/0'/0/0".to_string(),
        }
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = SecretPhraseKeyProvider.derive_identity(PHRASE, &params()).unwrap();
        let b = SecretPhraseKeyProvider
            .derive_identity(&PHRASE.to_uppercase(), &params())
            .unwrap();
        assert_eq!(a.address(), b.address());
        assert!(a.address().starts_with("empe1"));
        assert!(Bech32Validator::new("empe").is_valid(a.address()));
    }

    #[test]
    fn test_path_changes_address() {
        let other = DerivationParams {
            hd_path: "m/44'/118'/0'/0/1".to_string(),
            ..params()
        };
        let a = SecretPhraseKeyProvider.derive_identity(PHRASE, &params()).unwrap();
        let b = SecretPhraseKeyProvider.derive_identity(PHRASE, &other).unwrap();
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn test_malformed_inputs_fail_with_key_derivation_error() {
        let short = SecretPhraseKeyProvider.derive_identity("abandon ability", &params());
        assert!(matches!(short, Err(FaucetError::KeyDerivation(_))));

        let digits = PHRASE.replace("able", "4ble");
        let bad_word = SecretPhraseKeyProvider.derive_identity(&digits, &params());
        assert!(matches!(bad_word, Err(FaucetError::KeyDerivation(_))));

        let bad_path = DerivationParams {
            hd_path: "44'/118'".to_string(),
            ..params()
        };
        let result = SecretPhraseKeyProvider.derive_identity(PHRASE, &bad_path);
        assert!(matches!(result, Err(FaucetError::KeyDerivation(_))));
    }

    #[test]
    fn test_parse_hd_path() {
        assert_eq!(
            parse_hd_path("m/44'/118'/0'/0/7").unwrap(),
            vec![44 | HARDENED, 118 | HARDENED, HARDENED, 0, 7]
        );
        assert!(parse_hd_path("m").is_err());
        assert!(parse_hd_path("m/x").is_err());
        assert!(parse_hd_path("m/2147483648").is_err());
    }

    #[test]
    fn test_signature_verifies() {
        let identity = SecretPhraseKeyProvider.derive_identity(PHRASE, &params()).unwrap();
        let signature_bytes = identity.sign(b"batch payload");
        let signature = Signature::from_slice(&signature_bytes).unwrap();

        let verifying_key = k256::ecdsa::VerifyingKey::from_sec1_bytes(&identity.public_key()).unwrap();
        assert!(verifying_key.verify(b"batch payload", &signature).is_ok());
        assert!(verifying_key.verify(b"other payload", &signature).is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let identity = SecretPhraseKeyProvider.derive_identity(PHRASE, &params()).unwrap();
        let debug = format!("{:?}", identity);
        assert!(debug.contains(identity.address()));
        assert!(!debug.contains("signing_key"));
    }

    struct CountingProvider(AtomicUsize);

    impl KeyProvider for CountingProvider {
        fn derive_identity(
            &self,
            secret_phrase: &str,
            params: &DerivationParams,
        ) -> FaucetResult<SignerIdentity> {
            self.0.fetch_add(1, Ordering::SeqCst);
            SecretPhraseKeyProvider.derive_identity(secret_phrase, params)
        }
    }

    #[tokio::test]
    async fn test_wallet_derives_once() {
        let provider = Arc::new(CountingProvider(AtomicUsize::new(0)));
        let wallet = Wallet::new(provider.clone(), Secret::new(PHRASE), params());

        let first = wallet.identity().await.unwrap();
        let second = wallet.identity().await.unwrap();

        assert_eq!(first.address(), second.address());
        assert_eq!(provider.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wallet_failure_not_cached() {
        let provider = Arc::new(CountingProvider(AtomicUsize::new(0)));
        let wallet = Wallet::new(provider.clone(), Secret::new("too short"), params());

        assert!(wallet.identity().await.is_err());
        assert!(wallet.identity().await.is_err());
        assert_eq!(provider.0.load(Ordering::SeqCst), 2);
    }
}

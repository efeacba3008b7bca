//! Address format predicates

use crate::config::{AddressValidation, FaucetConfig};
use std::sync::Arc;

/// Decides whether a submitted string is a plausible address on the target chain.
pub trait AddressValidator: Send + Sync {
    fn is_valid(&self, address: &str) -> bool;
}

impl<F> AddressValidator for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_valid(&self, address: &str) -> bool {
        self(address)
    }
}

/// Accepts bech32 strings with the expected prefix and a 20-byte account payload.
#[derive(Debug, Clone)]
pub struct Bech32Validator {
    prefix: String,
}

impl Bech32Validator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl AddressValidator for Bech32Validator {
    fn is_valid(&self, address: &str) -> bool {
        match bech32::decode(address) {
            Ok((hrp, data)) => hrp.to_lowercase() == self.prefix && data.len() == 20,
            Err(_) => false,
        }
    }
}

/// Cheap check on prefix and total length only.
#[derive(Debug, Clone)]
pub struct PrefixLengthValidator {
    prefix: String,
    length: usize,
}

impl PrefixLengthValidator {
    pub fn new(prefix: impl Into<String>, length: usize) -> Self {
        Self {
            prefix: prefix.into(),
            length,
        }
    }
}

impl AddressValidator for PrefixLengthValidator {
    fn is_valid(&self, address: &str) -> bool {
        address.starts_with(&self.prefix) && address.len() == self.length
    }
}

/// Validator selected by the configuration
pub fn from_config(config: &FaucetConfig) -> Arc<dyn AddressValidator> {
    match config.address_validation {
        AddressValidation::Bech32 => Arc::new(Bech32Validator::new(&config.address_prefix)),
        AddressValidation::PrefixLength => Arc::new(PrefixLengthValidator::new(
            &config.address_prefix,
            config.address_length,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bech32::{Bech32, Hrp};

    fn encode(prefix: &str, payload: &[u8]) -> String {
        bech32::encode::<Bech32>(Hrp::parse(prefix).unwrap(), payload).unwrap()
    }

    #[test]
    fn test_bech32_accepts_account_address() {
        let validator = Bech32Validator::new("empe");
        let address = encode("empe", &[7u8; 20]);
        assert_eq!(address.len(), 43);
        assert!(validator.is_valid(&address));
    }

    #[test]
    fn test_bech32_rejects_wrong_prefix_and_payload() {
        let validator = Bech32Validator::new("empe");
        assert!(!validator.is_valid(&encode("cosmos", &[7u8; 20])));
        assert!(!validator.is_valid(&encode("empe", &[7u8; 32])));
        assert!(!validator.is_valid("empe1notbech32"));
        assert!(!validator.is_valid(""));
    }

    #[test]
    fn test_bech32_rejects_corrupted_checksum() {
        let validator = Bech32Validator::new("empe");
        let mut address = encode("empe", &[1u8; 20]);
        let last = address.pop().unwrap();
        address.push(if last == 'q' { 'p' } else { 'q' });
        assert!(!validator.is_valid(&address));
    }

    #[test]
    fn test_prefix_length() {
        let validator = PrefixLengthValidator::new("empe", 43);
        assert!(validator.is_valid(&format!("empe{}", "a".repeat(39))));
        assert!(!validator.is_valid(&format!("empe{}", "a".repeat(38))));
        assert!(!validator.is_valid(&format!("cosm{}", "a".repeat(39))));
    }

    #[test]
    fn test_closure_validator() {
        let validator: Arc<dyn AddressValidator> = Arc::new(|a: &str| a.starts_with("empe"));
        assert!(validator.is_valid("empeAAA"));
        assert!(!validator.is_valid("AAA"));
    }

    #[test]
    fn test_from_config() {
        let config = FaucetConfig {
            address_validation: AddressValidation::PrefixLength,
            address_length: 10,
            ..Default::default()
        };
        assert!(from_config(&config).is_valid("empe123456"));
    }
}

//! Submitting signed batches to the chain

use crate::batch::BatchInstruction;
use crate::error::{FaucetError, FaucetResult};
use crate::fee::Fee;
use crate::wallet::SignerIdentity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Outcome reported by the chain for one submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    pub success: bool,
    pub tx_hash: Option<String>,
    /// Raw log or rejection reason
    pub details: String,
}

impl TransactionResult {
    pub fn accepted(tx_hash: impl Into<String>) -> Self {
        Self {
            success: true,
            tx_hash: Some(tx_hash.into()),
            details: String::new(),
        }
    }

    pub fn rejected(details: impl Into<String>) -> Self {
        Self {
            success: false,
            tx_hash: None,
            details: details.into(),
        }
    }
}

/// Signs and submits a batch, waiting for the chain's verdict.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn submit(
        &self,
        signer: &SignerIdentity,
        sender: &str,
        batch: &BatchInstruction,
        fee: &Fee,
        memo: &str,
    ) -> FaucetResult<TransactionResult>;
}

/// Bytes covered by the signature
#[derive(Debug, Serialize, Deserialize)]
pub struct SignDoc {
    pub chain_id: String,
    pub sender: String,
    pub msg: BatchInstruction,
    pub fee: Fee,
    pub memo: String,
}

/// What the relay receives: the exact signed bytes plus the key to check them
#[derive(Debug, Serialize, Deserialize)]
pub struct SignedBatch {
    /// Hex encoded JSON [`SignDoc`]
    pub sign_doc: String,
    /// Hex encoded 64-byte `r || s`
    pub signature: String,
    /// Hex encoded compressed secp256k1 key
    pub pub_key: String,
}

#[derive(Debug, Deserialize)]
struct BroadcastReply {
    code: u32,
    #[serde(default)]
    tx_hash: Option<String>,
    #[serde(default)]
    log: String,
}

/// JSON-RPC client for a signing relay in front of the chain node.
///
/// Batches are signed locally; the relay only sees the signed document.
pub struct RelayBroadcaster {
    rpc_url: String,
    chain_id: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl RelayBroadcaster {
    pub fn new(rpc_url: String, chain_id: String, timeout: Duration) -> FaucetResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FaucetError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            rpc_url,
            chain_id,
            timeout,
            client,
        })
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> FaucetResult<serde_json::Value> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            return Err(FaucetError::Network(format!(
                "Relay answered HTTP {}",
                response.status()
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| FaucetError::Network(format!("Invalid response: {}", e)))?;

        if let Some(error) = json.get("error") {
            return Err(FaucetError::ChainRejection(error.to_string()));
        }

        Ok(json
            .get("result")
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }

    fn transport_error(&self, err: reqwest::Error) -> FaucetError {
        if err.is_timeout() {
            FaucetError::Timeout(self.timeout)
        } else {
            FaucetError::Network(format!("Request failed: {}", err))
        }
    }
}

#[async_trait]
impl Broadcaster for RelayBroadcaster {
    async fn submit(
        &self,
        signer: &SignerIdentity,
        sender: &str,
        batch: &BatchInstruction,
        fee: &Fee,
        memo: &str,
    ) -> FaucetResult<TransactionResult> {
        let doc = SignDoc {
            chain_id: self.chain_id.clone(),
            sender: sender.to_string(),
            msg: batch.clone(),
            fee: fee.clone(),
            memo: memo.to_string(),
        };
        let doc_bytes =
            serde_json::to_vec(&doc).map_err(|e| FaucetError::Serialization(e.to_string()))?;

        let signed = SignedBatch {
            signature: hex::encode(signer.sign(&doc_bytes)),
            pub_key: hex::encode(signer.public_key()),
            sign_doc: hex::encode(&doc_bytes),
        };

        debug!(
            "Broadcasting batch of {} outputs to {}",
            batch.recipient_count(),
            self.rpc_url
        );
        let result = self
            .call("broadcast_signed_batch", serde_json::json!([signed]))
            .await?;

        let reply: BroadcastReply = serde_json::from_value(result)
            .map_err(|e| FaucetError::Network(format!("Unexpected relay reply: {}", e)))?;

        if reply.code == 0 {
            let tx_hash = reply.tx_hash.unwrap_or_default();
            info!("Transaction sent: {}", tx_hash);
            Ok(TransactionResult {
                success: true,
                tx_hash: Some(tx_hash),
                details: reply.log,
            })
        } else {
            Ok(TransactionResult::rejected(format!(
                "code {}: {}",
                reply.code, reply.log
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::compose;
    use crate::fee::GasPrice;
    use crate::queue::{EntryId, QueueEntry};
    use crate::wallet::{DerivationParams, KeyProvider, SecretPhraseKeyProvider};
    use axum::{routing::post, Json, Router};
    use k256::ecdsa::{signature::Verifier, Signature, VerifyingKey};

    const PHRASE: &str = "abandon ability able about above absent absorb abstract absurd abuse access accident";

    fn signer() -> SignerIdentity {
        SecretPhraseKeyProvider
            .derive_identity(
                PHRASE,
                &DerivationParams {
                    prefix: "empe".to_string(),
                    hd_path: "m/44'/118'/0'/0/0".to_string(),
                },
            )
            .unwrap()
    }

    fn batch(sender: &str) -> BatchInstruction {
        let entries = vec![QueueEntry {
            id: EntryId(1),
            address: "empe1recipient".to_string(),
            enqueued_at: 0,
        }];
        compose(sender, &entries, 10, "uempe").unwrap()
    }

    fn fee() -> Fee {
        Fee::from_gas(200_000, &"0.025uempe".parse::<GasPrice>().unwrap()).unwrap()
    }

    /// Relay that verifies the signature and answers with `code`
    async fn spawn_relay(code: u32) -> String {
        let app = Router::new().route(
            "/",
            post(move |Json(body): Json<serde_json::Value>| async move {
                let signed: SignedBatch =
                    serde_json::from_value(body["params"][0].clone()).unwrap();
                let doc_bytes = hex::decode(&signed.sign_doc).unwrap();
                let key = VerifyingKey::from_sec1_bytes(&hex::decode(&signed.pub_key).unwrap())
                    .unwrap();
                let signature =
                    Signature::from_slice(&hex::decode(&signed.signature).unwrap()).unwrap();
                let verified = key.verify(&doc_bytes, &signature).is_ok();
                let doc: SignDoc = serde_json::from_slice(&doc_bytes).unwrap();
                let reply_code = if verified { code } else { 99 };

                Json(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "code": reply_code,
                        "tx_hash": "ABCDEF",
                        "log": format!("{} outputs, memo {}", doc.msg.outputs.len(), doc.memo),
                    }
                }))
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_relay_accepts_signed_batch() {
        let url = spawn_relay(0).await;
        let broadcaster =
            RelayBroadcaster::new(url, "empe-testnet-2".into(), Duration::from_secs(5)).unwrap();
        let signer = signer();

        let result = broadcaster
            .submit(&signer, signer.address(), &batch(signer.address()), &fee(), "hi")
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.tx_hash.as_deref(), Some("ABCDEF"));
        assert_eq!(result.details, "1 outputs, memo hi");
    }

    #[tokio::test]
    async fn test_nonzero_code_is_rejection() {
        let url = spawn_relay(5).await;
        let broadcaster =
            RelayBroadcaster::new(url, "empe-testnet-2".into(), Duration::from_secs(5)).unwrap();
        let signer = signer();

        let result = broadcaster
            .submit(&signer, signer.address(), &batch(signer.address()), &fee(), "hi")
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.details.starts_with("code 5"));
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let broadcaster = RelayBroadcaster::new(
            format!("http://{}/", addr),
            "empe-testnet-2".into(),
            Duration::from_secs(5),
        )
        .unwrap();
        let signer = signer();

        let err = broadcaster
            .submit(&signer, signer.address(), &batch(signer.address()), &fee(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, FaucetError::Network(_)));
    }
}

//! On-chain governance registry reads.
//!
//! The registry contract is the source of truth for which KMS, gateway and
//! application identities are legitimately deployed. This module only
//! *reads* it: `kmsInfo()`, `gatewayAppId()` and `registeredApps(app_id)`.
//! Governance state can change between attestation cycles, so results are
//! never cached across verification runs.
//!
//! Access goes through the [`ReadRegistry`] capability trait; tests
//! substitute [`StaticRegistry`] instead of a live chain connection.

use std::future::Future;

use serde_json::{json, Value};
use sha3::{Digest, Keccak256};

use crate::error::VerificationError;

/// KMS identity material recorded on chain.
///
/// The quote and event log are the KMS's own attestation evidence; they are
/// recursively verifiable by feeding them back through the quote decoder and
/// replay engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsInfo {
    pub k256_pubkey: Vec<u8>,
    pub ca_pubkey: Vec<u8>,
    pub quote: Vec<u8>,
    pub eventlog: Vec<u8>,
}

/// Read-only view of the governance registry contract.
pub trait ReadRegistry: Send + Sync {
    /// Resolve the registered KMS identity and its attestation evidence.
    fn kms_info(&self) -> impl Future<Output = Result<KmsInfo, VerificationError>> + Send;

    /// Resolve the app id the gateway is registered under.
    fn gateway_app_id(&self) -> impl Future<Output = Result<String, VerificationError>> + Send;

    /// Whether the contract records `app_id` as a registered application.
    fn is_app_registered(
        &self,
        app_id: &str,
    ) -> impl Future<Output = Result<bool, VerificationError>> + Send;
}

/// Normalize an app id / address string for comparison: lowercase hex
/// without the `0x` prefix.
pub fn normalize_app_id(app_id: &str) -> String {
    app_id
        .strip_prefix("0x")
        .unwrap_or(app_id)
        .to_ascii_lowercase()
}

fn parse_address(app_id: &str) -> Result<[u8; 20], VerificationError> {
    let bytes = hex::decode(normalize_app_id(app_id))
        .map_err(|e| VerificationError::Configuration(format!("bad app id {app_id:?}: {e}")))?;
    bytes.try_into().map_err(|_| {
        VerificationError::Configuration(format!("app id {app_id:?} is not 20 bytes"))
    })
}

/// 4-byte ABI selector for a function signature.
fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

fn abi_usize(data: &[u8], offset: usize) -> Result<usize, VerificationError> {
    let end = offset.checked_add(32).ok_or_else(malformed)?;
    let word = data.get(offset..end).ok_or_else(malformed)?;
    // Offsets and lengths in practice fit in the low 8 bytes.
    if word[..24].iter().any(|&b| b != 0) {
        return Err(malformed());
    }
    let mut out = [0u8; 8];
    out.copy_from_slice(&word[24..]);
    Ok(u64::from_be_bytes(out) as usize)
}

fn abi_bytes(data: &[u8], head_offset: usize) -> Result<Vec<u8>, VerificationError> {
    let start = abi_usize(data, head_offset)?;
    let len = abi_usize(data, start)?;
    let begin = start.checked_add(32).ok_or_else(malformed)?;
    let end = begin.checked_add(len).ok_or_else(malformed)?;
    data.get(begin..end).map(<[u8]>::to_vec).ok_or_else(malformed)
}

fn malformed() -> VerificationError {
    VerificationError::Unreachable("malformed eth_call response".into())
}

/// Decode the return data of `kmsInfo()`: a single struct of four dynamic
/// `bytes` fields. Word 0 points at the tuple; the tuple head holds four
/// offsets relative to the tuple start.
fn decode_kms_info(data: &[u8]) -> Result<KmsInfo, VerificationError> {
    let base = abi_usize(data, 0)?;
    let tuple = data.get(base..).ok_or_else(malformed)?;
    Ok(KmsInfo {
        k256_pubkey: abi_bytes(tuple, 0)?,
        ca_pubkey: abi_bytes(tuple, 32)?,
        quote: abi_bytes(tuple, 64)?,
        eventlog: abi_bytes(tuple, 96)?,
    })
}

/// Registry client speaking JSON-RPC `eth_call` to an EVM endpoint.
#[derive(Debug, Clone)]
pub struct EvmRegistry {
    client: reqwest::Client,
    rpc_url: String,
    contract: String,
}

impl EvmRegistry {
    pub fn new(rpc_url: impl Into<String>, contract: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            rpc_url: rpc_url.into(),
            contract: contract.into(),
        }
    }

    async fn eth_call(&self, calldata: Vec<u8>) -> Result<Vec<u8>, VerificationError> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_call",
            "params": [
                {"to": self.contract, "data": format!("0x{}", hex::encode(calldata))},
                "latest"
            ],
        });
        let response = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| VerificationError::Unreachable(format!("{}: {e}", self.rpc_url)))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| VerificationError::Unreachable(format!("{}: {e}", self.rpc_url)))?;
        if let Some(error) = body.get("error") {
            return Err(VerificationError::Unreachable(format!(
                "eth_call error: {error}"
            )));
        }
        let result = body
            .get("result")
            .and_then(Value::as_str)
            .ok_or_else(malformed)?;
        hex::decode(result.strip_prefix("0x").unwrap_or(result)).map_err(|_| malformed())
    }
}

impl ReadRegistry for EvmRegistry {
    async fn kms_info(&self) -> Result<KmsInfo, VerificationError> {
        let data = self.eth_call(selector("kmsInfo()").to_vec()).await?;
        decode_kms_info(&data)
    }

    async fn gateway_app_id(&self) -> Result<String, VerificationError> {
        let data = self.eth_call(selector("gatewayAppId()").to_vec()).await?;
        let bytes = abi_bytes(&data, 0)?;
        String::from_utf8(bytes).map_err(|_| malformed())
    }

    async fn is_app_registered(&self, app_id: &str) -> Result<bool, VerificationError> {
        let address = parse_address(app_id)?;
        let mut calldata = selector("registeredApps(address)").to_vec();
        calldata.extend_from_slice(&[0u8; 12]);
        calldata.extend_from_slice(&address);
        let data = self.eth_call(calldata).await?;
        let word = data.get(..32).ok_or_else(malformed)?;
        Ok(word.iter().any(|&b| b != 0))
    }
}

/// Fixture registry serving fixed values, for tests and offline use.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    pub kms: Option<KmsInfo>,
    pub gateway_app_id: Option<String>,
    pub registered_apps: Vec<String>,
}

impl ReadRegistry for StaticRegistry {
    async fn kms_info(&self) -> Result<KmsInfo, VerificationError> {
        self.kms
            .clone()
            .ok_or_else(|| VerificationError::Unreachable("no KMS fixture".into()))
    }

    async fn gateway_app_id(&self) -> Result<String, VerificationError> {
        self.gateway_app_id
            .clone()
            .ok_or_else(|| VerificationError::Unreachable("no gateway fixture".into()))
    }

    async fn is_app_registered(&self, app_id: &str) -> Result<bool, VerificationError> {
        let wanted = normalize_app_id(app_id);
        Ok(self
            .registered_apps
            .iter()
            .any(|a| normalize_app_id(a) == wanted))
    }
}

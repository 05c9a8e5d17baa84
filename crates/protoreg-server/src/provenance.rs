//! DSSE envelope verification (§4.9 "Provenance") and capability extraction
//! for the relational `capabilities` table.
//!
//! Grounded in the pack's two manifests that reach for a signature-verify
//! crate for detached attestations (`ed25519-dalek`); the pre-authentication
//! encoding below is the standard DSSE `PAE` construction, not something
//! original to this workspace.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use protoreg_config::ProvenanceKey;
use protoreg_types::{AgentCapabilities, Manifest, RegistryError};
use serde::{Deserialize, Serialize};

/// A DSSE envelope as received on the wire (`PUT /v1/registry/{urn}`'s
/// `provenance` field).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsseEnvelope {
    #[serde(rename = "payloadType")]
    pub payload_type: String,
    pub payload: String,
    pub signatures: Vec<DsseSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsseSignature {
    pub keyid: String,
    pub sig: String,
}

/// What's extracted from a verified envelope's in-toto-shaped payload and
/// surfaced on `GET /v1/registry/{urn}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub builder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub materials: Vec<serde_json::Value>,
}

/// DSSE's pre-authentication encoding: `"DSSEv1" SP len(type) SP type SP
/// len(body) SP body`, all lengths in ASCII decimal, no trailing separator.
fn pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"DSSEv1");
    out.extend_from_slice(format!(" {} ", payload_type.len()).as_bytes());
    out.extend_from_slice(payload_type.as_bytes());
    out.extend_from_slice(format!(" {} ", payload.len()).as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Verifies at least one signature in the envelope against a recognized
/// `keyid`, then parses the payload as an in-toto-shaped JSON statement for
/// the summary. 422-worthy failures all come back as `ProvenanceInvalid`.
pub fn verify(
    keys: &[ProvenanceKey],
    envelope: &DsseEnvelope,
) -> Result<ProvenanceSummary, RegistryError> {
    let payload = BASE64
        .decode(envelope.payload.as_bytes())
        .map_err(|e| RegistryError::ProvenanceInvalid {
            reason: format!("payload is not valid base64: {e}"),
        })?;
    let message = pae(&envelope.payload_type, &payload);

    let mut verified = false;
    for sig in &envelope.signatures {
        let Some(key) = keys.iter().find(|k| k.keyid == sig.keyid) else {
            continue;
        };
        let Ok(pubkey_bytes) = BASE64.decode(key.pubkey.as_bytes()) else {
            continue;
        };
        let Ok(pubkey_array): Result<[u8; 32], _> = pubkey_bytes.try_into() else {
            continue;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&pubkey_array) else {
            continue;
        };
        let Ok(sig_bytes) = BASE64.decode(sig.sig.as_bytes()) else {
            continue;
        };
        let Ok(sig_array): Result<[u8; 64], _> = sig_bytes.try_into() else {
            continue;
        };
        let signature = Signature::from_bytes(&sig_array);
        if verifying_key.verify(&message, &signature).is_ok() {
            verified = true;
            break;
        }
    }

    if !verified {
        return Err(RegistryError::ProvenanceInvalid {
            reason: "no signature verified against a recognized provenance key".to_string(),
        });
    }

    let statement: serde_json::Value =
        serde_json::from_slice(&payload).map_err(|e| RegistryError::ProvenanceInvalid {
            reason: format!("payload is not valid JSON: {e}"),
        })?;

    let predicate = statement.get("predicate").unwrap_or(&serde_json::Value::Null);
    let builder = predicate
        .pointer("/builder/id")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let commit = predicate
        .pointer("/materials/0/digest/sha1")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let timestamp = predicate
        .pointer("/metadata/buildFinishedOn")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let materials = predicate
        .get("materials")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    Ok(ProvenanceSummary {
        builder,
        commit,
        timestamp,
        materials,
    })
}

/// Flattened `"{kind}:{value}"` capability strings for the relational
/// `capabilities` table, covering both agent capability arrays (§4.5) and
/// API endpoints.
pub fn extract_capabilities(manifest: &Manifest) -> Vec<String> {
    let mut caps = Vec::new();
    if let Some(agent) = &manifest.agent {
        caps.extend(flatten_agent_capabilities(agent));
    }
    if let Some(api) = &manifest.api {
        for endpoint in &api.endpoints {
            caps.push(format!("endpoint:{} {}", endpoint.method, endpoint.path));
        }
    }
    caps
}

fn flatten_agent_capabilities(caps: &AgentCapabilities) -> Vec<String> {
    protoreg_types::agent_capability_keys(caps)
        .into_iter()
        .flat_map(|(kind, values)| values.into_iter().map(move |v| format!("{kind}:{v}")))
        .collect()
}

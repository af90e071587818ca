//! Signing through a remote signer holding the account key.

use color_eyre::eyre::{self, WrapErr as _, bail, ensure};
use serde::Deserialize;

use mantis_core::state::Address;

/// Base58 prefix of ed25519 signatures (`edsig`).
const EDSIG_PREFIX: [u8; 5] = [9, 245, 205, 134, 18];
const SIGNATURE_LEN: usize = 64;

/// Watermark for generic operations.
const OPERATION_WATERMARK: &str = "03";

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: String,
}

#[derive(Debug, Deserialize)]
struct KeyResponse {
    public_key: String,
}

#[derive(Debug, Clone)]
pub struct RemoteSigner {
    http: reqwest::Client,
    url: String,
    key: Address,
}

impl RemoteSigner {
    pub fn new(http: reqwest::Client, url: &str, key: Address) -> Self {
        Self {
            http,
            url: url.trim_end_matches('/').to_string(),
            key,
        }
    }

    fn key_url(&self) -> String {
        format!("{}/keys/{}", self.url, self.key)
    }

    /// Fails unless the signer holds `public_key` for the account.
    pub async fn check_key(&self, public_key: &str) -> eyre::Result<()> {
        let response: KeyResponse = self
            .http
            .get(self.key_url())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .wrap_err("failed to decode signer key response")?;

        ensure!(
            response.public_key == public_key,
            "signer holds {} for {}, configured key is {public_key}",
            response.public_key,
            self.key
        );
        Ok(())
    }

    /// Raw signature over forged operation bytes.
    pub async fn sign(&self, forged: &str) -> eyre::Result<Vec<u8>> {
        let response: SignResponse = self
            .http
            .post(self.key_url())
            .json(&format!("{OPERATION_WATERMARK}{forged}"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .wrap_err("failed to decode signer response")?;

        decode_signature(&response.signature)
    }
}

fn decode_signature(signature: &str) -> eyre::Result<Vec<u8>> {
    let decoded = bs58::decode(signature)
        .with_check(None)
        .into_vec()
        .wrap_err("signature is not base58check")?;

    let Some(raw) = decoded.strip_prefix(EDSIG_PREFIX.as_slice()) else {
        bail!("signature {signature} is not an ed25519 signature");
    };
    ensure!(
        raw.len() == SIGNATURE_LEN,
        "signature has {} bytes, expected {SIGNATURE_LEN}",
        raw.len()
    );
    Ok(raw.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(prefix: &[u8], raw: &[u8]) -> String {
        bs58::encode([prefix, raw].concat()).with_check().into_string()
    }

    #[test]
    fn edsig_decodes_to_raw_bytes() {
        let raw: Vec<u8> = (0..64).collect();
        let signature = encode(&EDSIG_PREFIX, &raw);

        assert!(signature.starts_with("edsig"));
        assert_eq!(decode_signature(&signature).unwrap(), raw);
    }

    #[test]
    fn other_curves_are_rejected() {
        let spsig = encode(&[13, 115, 101, 19, 63], &[1; 64]);
        assert!(decode_signature(&spsig).is_err());

        let short = encode(&EDSIG_PREFIX, &[1; 32]);
        assert!(decode_signature(&short).is_err());

        assert!(decode_signature("edsigNotBase58Check").is_err());
    }
}

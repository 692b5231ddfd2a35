//! Minimal AWS Signature Version 4 request signing, enough for the
//! S3-compatible PUT/GET/HEAD surface the remote cache uses. Query strings
//! are never used, so the canonical query is always empty.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";

pub struct SigningKeys<'a> {
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub region: &'a str,
}

/// Headers to attach to the request: `x-amz-date`, `x-amz-content-sha256`
/// and `authorization`.
pub fn sign_headers(
    method: &str,
    host: &str,
    canonical_uri: &str,
    payload_hash: &str,
    keys: &SigningKeys<'_>,
    now: DateTime<Utc>,
) -> Vec<(&'static str, String)> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let datestamp = now.format("%Y%m%d").to_string();

    let canonical_headers = format!(
        "host:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n"
    );
    let signed_headers = "host;x-amz-content-sha256;x-amz-date";
    let canonical_request = format!(
        "{method}\n{canonical_uri}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    );

    let scope = format!("{datestamp}/{}/{SERVICE}/aws4_request", keys.region);
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let date_key = hmac(
        format!("AWS4{}", keys.secret_key).as_bytes(),
        datestamp.as_bytes(),
    );
    let region_key = hmac(&date_key, keys.region.as_bytes());
    let service_key = hmac(&region_key, SERVICE.as_bytes());
    let signing_key = hmac(&service_key, b"aws4_request");
    let signature = hex::encode(hmac(&signing_key, string_to_sign.as_bytes()));

    let authorization = format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, \
         Signature={signature}",
        keys.access_key
    );

    vec![
        ("x-amz-date", amz_date),
        ("x-amz-content-sha256", payload_hash.to_string()),
        ("authorization", authorization),
    ]
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

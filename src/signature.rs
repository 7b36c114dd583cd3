//! Verification of inbound HTTP signatures.
use crate::{
    activity::Actor,
    signer::build_signing_string,
    Error, Result,
};
use axum::http::HeaderMap;
use chrono::Utc;
use rsa::{
    pkcs1v15::{Signature as RsaSignature, VerifyingKey},
    signature::Verifier,
    RsaPublicKey,
};
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;
use tracing::debug;

/// A parsed `Signature` request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub key_id: String,
    pub algorithm: Option<String>,
    pub headers: Vec<String>,
    pub signature: String,
    pub created: Option<i64>,
    pub expires: Option<i64>,
}

impl Signature {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut fields: HashMap<String, String> = HashMap::new();

        for chunk in raw.trim().split(',') {
            let (key, value) = chunk
                .split_once('=')
                .ok_or_else(|| Error::signature(format!("malformed signature field: {chunk}")))?;

            let value = value.trim().trim_matches('"');
            fields.insert(key.trim().to_lowercase(), value.to_owned());
        }

        let key_id = fields
            .remove("keyid")
            .ok_or_else(|| Error::signature("signature missing keyId"))?;
        let signature = fields
            .remove("signature")
            .ok_or_else(|| Error::signature("signature missing signature field"))?;

        let headers = match fields.remove("headers") {
            Some(list) => list.split_whitespace().map(str::to_lowercase).collect(),
            // the draft default when no headers parameter is given
            None => vec!["date".to_owned()],
        };

        Ok(Self {
            key_id,
            algorithm: fields.remove("algorithm"),
            headers,
            signature,
            created: parse_epoch(fields.get("created"))?,
            expires: parse_epoch(fields.get("expires"))?,
        })
    }
}

fn parse_epoch(value: Option<&String>) -> Result<Option<i64>> {
    match value {
        None => Ok(None),
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|_| Error::signature(format!("invalid signature timestamp: {raw}"))),
    }
}

/// Validate a signed inbound request against the actor's published key.
///
/// `path` is the request path only; the canonical string uses the synthetic
/// `(request-target)` header `"{method_lower} {path}"`.
pub fn validate_request(
    actor: &Actor,
    sig: &Signature,
    method: &str,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<()> {
    let mut canonical: HashMap<String, String> = HashMap::new();

    for (name, value) in headers {
        let value = value
            .to_str()
            .map_err(|_| Error::signature("non-ascii header value"))?;
        let entry = canonical.entry(name.as_str().to_lowercase()).or_default();

        if entry.is_empty() {
            entry.push_str(value);
        } else {
            // repeated headers are joined in field order
            entry.push_str(", ");
            entry.push_str(value);
        }
    }

    canonical.insert(
        "(request-target)".into(),
        format!("{} {path}", method.to_lowercase()),
    );

    if let Some(digest) = canonical.get("digest") {
        validate_digest(digest, body)?;
    }

    if sig.algorithm.as_deref() == Some("hs2019") {
        if !sig.headers.iter().any(|h| h == "(created)") {
            return Err(Error::signature("'(created)' header not used"));
        }

        let now = Utc::now().timestamp();
        let created = sig
            .created
            .ok_or_else(|| Error::signature("signature missing created timestamp"))?;
        let expires = sig
            .expires
            .ok_or_else(|| Error::signature("signature missing expires timestamp"))?;

        if created > now {
            return Err(Error::signature("creation date after current date"));
        }

        if now > expires {
            return Err(Error::signature("expiration date before current date"));
        }

        canonical.insert("(created)".into(), created.to_string());
        canonical.insert("(expires)".into(), expires.to_string());
    }

    let pairs: Vec<(String, String)> = sig
        .headers
        .iter()
        .map(|name| {
            canonical
                .get(name)
                .map(|value| (name.clone(), value.clone()))
                .ok_or_else(|| Error::signature(format!("signed header missing: {name}")))
        })
        .collect::<Result<_>>()?;

    let signing_string = build_signing_string(&pairs);
    let sig_data = base64::decode(&sig.signature)
        .map_err(|_| Error::signature("signature is not valid base64"))?;
    let signature = RsaSignature::from(sig_data);
    let key = actor.key()?;

    match sig.algorithm.as_deref() {
        None | Some("hs2019") | Some("original") | Some("rsa-sha256") => {
            verify::<Sha256>(key, signing_string.as_bytes(), &signature)
        }
        Some("rsa-sha512") => verify::<Sha512>(key, signing_string.as_bytes(), &signature),
        Some(other) => Err(Error::signature(format!("unsupported algorithm: {other}"))),
    }
}

fn verify<D: Digest>(key: RsaPublicKey, data: &[u8], signature: &RsaSignature) -> Result<()> {
    let verify_key: VerifyingKey<D> = key.into();

    verify_key.verify(data, signature).map_err(|e| {
        debug!(%e, "invalid signature");
        Error::signature("signature does not match")
    })
}

/// `Digest: SHA-256=base64(sha256(body))`
fn validate_digest(header: &str, body: &[u8]) -> Result<()> {
    let (algo, encoded) = header
        .split_once('=')
        .ok_or_else(|| Error::signature("malformed digest header"))?;

    if !algo.eq_ignore_ascii_case("sha-256") {
        return Err(Error::signature(format!("unsupported digest algorithm: {algo}")));
    }

    if body.is_empty() {
        return Err(Error::signature("missing body for digest verification"));
    }

    let claimed = base64::decode(encoded)
        .map_err(|_| Error::signature("digest is not valid base64"))?;

    if claimed != hmac_sha256::Hash::hash(body) {
        return Err(Error::signature("body digest does not match"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        map,
        signer::{digest, tests::test_signer, SigAlgorithm},
    };
    use simple_test_case::test_case;

    fn signed_headers(body: Option<&str>, algorithm: SigAlgorithm) -> HeaderMap {
        let mut headers = test_signer()
            .sign_headers("post", "https://relay.example.net/inbox", body, algorithm)
            .expect("to sign");

        // the HTTP stack emits these on a real request
        headers.insert("host", "relay.example.net".parse().unwrap());
        if let Some(data) = body {
            headers.insert("content-length", data.len().to_string().parse().unwrap());
        }

        headers
    }

    #[test]
    fn signature_splitting_works() {
        let key = "https://example.com/actor#main-key";
        let headers = "foo bar baz";
        let alg = "rsa-sha256";
        let sig = "SIGNATURE";

        let raw = format!(
            "keyId=\"{key}\",algorithm=\"{alg}\",headers=\"{headers}\",signature=\"{sig}\""
        );
        let parsed = Signature::parse(&raw).expect("test signature to be valid");

        assert_eq!(parsed.key_id, key);
        assert_eq!(parsed.algorithm.as_deref(), Some(alg));
        assert_eq!(parsed.headers, vec!["foo", "bar", "baz"]);
        assert_eq!(parsed.signature, sig);
        assert_eq!(parsed.created, None);
        assert_eq!(parsed.expires, None);
    }

    #[test]
    fn hs2019_fields_are_parsed() {
        let raw = "keyId=\"k\",algorithm=\"hs2019\",created=100,expires=200,\
                   headers=\"(request-target) (created) (expires) date\",signature=\"s\"";
        let parsed = Signature::parse(raw).unwrap();

        assert_eq!(parsed.created, Some(100));
        assert_eq!(parsed.expires, Some(200));
    }

    #[test_case(Some(r#"{ "hello": "world" }"#); "with body")]
    #[test_case(None; "without body")]
    #[test]
    fn we_can_verify_our_own_signatures(body: Option<&str>) {
        let headers = signed_headers(body, SigAlgorithm::Original);
        let sig = Signature::parse(headers["signature"].to_str().unwrap()).unwrap();

        // Will provide the TEST_PUB_KEY public key for verification
        let actor = Actor::test_actor("https://relay.example.net/actor");

        let res = validate_request(
            &actor,
            &sig,
            "post",
            "/inbox",
            &headers,
            body.unwrap_or_default().as_bytes(),
        );
        assert!(res.is_ok(), "{res:?}");
    }

    #[test]
    fn hs2019_signatures_verify() {
        let body = r#"{ "hello": "world" }"#;
        let headers = signed_headers(Some(body), SigAlgorithm::Hs2019);
        let sig = Signature::parse(headers["signature"].to_str().unwrap()).unwrap();
        let actor = Actor::test_actor("https://relay.example.net/actor");

        let res = validate_request(&actor, &sig, "post", "/inbox", &headers, body.as_bytes());
        assert!(res.is_ok(), "{res:?}");
    }

    #[test]
    fn mutating_a_signed_header_breaks_verification() {
        let body = r#"{ "hello": "world" }"#;
        let mut headers = signed_headers(Some(body), SigAlgorithm::Original);
        let sig = Signature::parse(headers["signature"].to_str().unwrap()).unwrap();
        let actor = Actor::test_actor("https://relay.example.net/actor");

        headers.insert("date", "Mon, 01 Jan 2001 00:00:00 GMT".parse().unwrap());

        let res = validate_request(&actor, &sig, "post", "/inbox", &headers, body.as_bytes());
        assert!(matches!(res, Err(Error::SignatureFailure(_))));
    }

    #[test]
    fn tampered_body_fails_digest_validation() {
        let body = r#"{ "hello": "world" }"#;
        let headers = signed_headers(Some(body), SigAlgorithm::Original);
        let sig = Signature::parse(headers["signature"].to_str().unwrap()).unwrap();
        let actor = Actor::test_actor("https://relay.example.net/actor");

        let res = validate_request(&actor, &sig, "post", "/inbox", &headers, b"tampered");
        assert!(matches!(res, Err(Error::SignatureFailure(_))));
    }

    #[test]
    fn digest_validation_works() {
        let body = b"some body";
        assert!(validate_digest(&digest(body), body).is_ok());
        assert!(validate_digest(&digest(body), b"other body").is_err());
        assert!(validate_digest("SHA-512=abc", body).is_err());
    }

    #[test]
    fn expired_hs2019_signature_is_rejected() {
        let now = Utc::now().timestamp();
        let sig = Signature {
            key_id: "k".to_owned(),
            algorithm: Some("hs2019".to_owned()),
            headers: vec!["(request-target)".into(), "(created)".into(), "(expires)".into()],
            signature: base64::encode("sig"),
            created: Some(now - 1000),
            expires: Some(now - 500),
        };
        let actor = Actor::test_actor("https://relay.example.net/actor");

        let res = validate_request(&actor, &sig, "post", "/inbox", &HeaderMap::new(), b"");
        assert!(matches!(res, Err(Error::SignatureFailure(reason)) if reason.contains("expiration")));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = "keyId=\"k\",algorithm=\"rsa-sha256\",headers=\"date\",signature=\"s\",opaque=\"x\"";
        let parsed = Signature::parse(raw).unwrap();
        let expected: HashMap<&str, &str> = map! { "keyId" => "k" };

        assert_eq!(parsed.key_id, *expected["keyId"]);
    }
}

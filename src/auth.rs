//! Optional bearer-token authorization.
//!
//! A deployment may require an externally issued EdDSA JWT on every
//! request, in addition to the per-request signature. The verifier is
//! built from a JWKS document the deployment supplies; token validity is
//! orthogonal to capability ownership.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;

use service::Error;

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default)]
    crv: String,
    #[serde(default)]
    x: String,
    #[serde(default)]
    kid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {}

pub struct BearerVerifier {
    keys: Vec<(Option<String>, DecodingKey)>,
    validation: Validation,
}

impl BearerVerifier {
    /// Build a verifier from a JWKS document. Only Ed25519 keys are
    /// considered; a document without any is refused.
    pub fn from_jwks(document: &str) -> Result<Self, Error> {
        let document: JwksDocument = serde_json::from_str(document)
            .map_err(|e| Error::InvalidArgument(format!("jwks: {}", e)))?;

        let mut keys = Vec::new();
        for jwk in document.keys {
            if jwk.kty != "OKP" || jwk.crv != "Ed25519" {
                continue;
            }
            let key = DecodingKey::from_ed_components(&jwk.x)
                .map_err(|e| Error::InvalidArgument(format!("jwks key: {}", e)))?;
            keys.push((jwk.kid, key));
        }

        if keys.is_empty() {
            return Err(Error::InvalidArgument(
                "jwks document carries no Ed25519 keys".to_string(),
            ));
        }

        Ok(Self {
            keys,
            validation: Validation::new(Algorithm::EdDSA),
        })
    }

    /// Validate an `authorization` header value.
    pub fn verify(&self, header: &str) -> Result<(), Error> {
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| Error::Unauthorized("malformed authorization header".to_string()))?;

        let kid = decode_header(token)
            .map_err(|e| Error::Unauthorized(format!("bearer token: {}", e)))?
            .kid;

        let mut last = Error::Unauthorized("bearer token rejected".to_string());
        for (key_id, key) in &self.keys {
            if kid.is_some() && key_id.is_some() && kid != *key_id {
                continue;
            }
            match decode::<Claims>(token, key, &self.validation) {
                Ok(_) => return Ok(()),
                Err(error) => last = Error::Unauthorized(format!("bearer token: {}", error)),
            }
        }

        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use chrono::Utc;
    use ed25519_dalek::SigningKey;
    use ed25519_dalek::pkcs8::EncodePrivateKey;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: i64,
    }

    fn jwks_for(key: &SigningKey, kid: &str) -> String {
        serde_json::json!({
            "keys": [{
                "kty": "OKP",
                "crv": "Ed25519",
                "kid": kid,
                "x": URL_SAFE_NO_PAD.encode(key.verifying_key().to_bytes()),
            }]
        })
        .to_string()
    }

    fn token_for(key: &SigningKey, kid: &str, exp: i64) -> String {
        let der = key.to_pkcs8_der().unwrap();
        let encoding = EncodingKey::from_ed_der(der.as_bytes());

        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(kid.to_string());

        encode(
            &header,
            &TestClaims {
                sub: "svc:billing".to_string(),
                exp,
            },
            &encoding,
        )
        .unwrap()
    }

    #[test]
    fn valid_token_is_accepted() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let verifier = BearerVerifier::from_jwks(&jwks_for(&key, "k1")).unwrap();
        let token = token_for(&key, "k1", Utc::now().timestamp() + 600);

        verifier.verify(&format!("Bearer {}", token)).unwrap();
    }

    #[test]
    fn wrong_key_is_rejected() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let other = SigningKey::from_bytes(&[9u8; 32]);
        let verifier = BearerVerifier::from_jwks(&jwks_for(&key, "k1")).unwrap();
        let token = token_for(&other, "k1", Utc::now().timestamp() + 600);

        assert!(verifier.verify(&format!("Bearer {}", token)).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let verifier = BearerVerifier::from_jwks(&jwks_for(&key, "k1")).unwrap();
        let token = token_for(&key, "k1", Utc::now().timestamp() - 600);

        assert!(verifier.verify(&format!("Bearer {}", token)).is_err());
    }

    #[test]
    fn missing_bearer_prefix_is_rejected() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let verifier = BearerVerifier::from_jwks(&jwks_for(&key, "k1")).unwrap();

        assert!(verifier.verify("Basic abc").is_err());
    }

    #[test]
    fn jwks_without_ed25519_keys_is_refused() {
        let document = r#"{"keys":[{"kty":"RSA","n":"...","e":"AQAB"}]}"#;

        assert!(BearerVerifier::from_jwks(document).is_err());
    }
}

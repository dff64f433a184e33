//! JWKS-backed JWT validation.
//!
//! The validator fetches a JSON Web Key Set from an OIDC provider, keeps it
//! refreshed in the background, and verifies RS256 tokens against it. The
//! key map is replaced atomically on refresh; readers never observe a
//! partial map, and a failed refresh keeps the last-good map intact.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use chainscope_config::JwtValidatorConfig;

/// Timeout for a single JWKS fetch, independent of the refresh interval.
const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Validated claims projected from a JWT.
#[derive(Debug, Clone, Default)]
pub struct JwtClaims {
    /// User id (`sub`).
    pub subject: String,
    /// User email.
    pub email: String,
    /// Token issuer.
    pub issuer: String,
    /// Audience sequence (a bare string is normalized to one element).
    pub audience: Vec<String>,
    /// Groups/organizations the user belongs to.
    pub groups: Vec<String>,
    /// Expiry time.
    pub expires_at: Option<DateTime<Utc>>,
    /// Issue time.
    pub issued_at: Option<DateTime<Utc>>,
    /// GitHub username, when the IdP provides it.
    pub github_login: String,
    /// GitHub user id, when the IdP provides it.
    pub github_id: i64,
}

/// Why a token was rejected. Every variant surfaces to clients as a generic
/// 401; the detail is logged only.
#[derive(Debug, Error)]
pub enum JwtError {
    /// Token header carries no `kid`.
    #[error("missing kid in token header")]
    MissingKid,

    /// No key with this id in the current JWKS.
    #[error("key not found for kid: {0}")]
    UnknownKid(String),

    /// Token is not RS256.
    #[error("unsupported algorithm: {0:?}")]
    WrongAlgorithm(Algorithm),

    /// Signature did not verify.
    #[error("signature verification failed")]
    InvalidSignature,

    /// Token is expired (or not yet valid).
    #[error("token expired")]
    Expired,

    /// Token could not be parsed.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// `iss` does not match the configured issuer.
    #[error("invalid issuer: got {got:?}")]
    WrongIssuer {
        /// The issuer the token carried.
        got: String,
    },

    /// Configured audience is absent from the token's audience sequence.
    #[error("audience mismatch")]
    WrongAudience,

    /// No intersection between token groups and the allow-list.
    #[error("user not in allowed organizations")]
    GroupNotAllowed,

    /// JWKS endpoint failure.
    #[error("JWKS fetch failed: {0}")]
    Jwks(String),
}

/// Response shape of a JWKS endpoint.
#[derive(Debug, Deserialize)]
pub struct JwksResponse {
    /// The published keys.
    pub keys: Vec<JwkKey>,
}

/// A single JWK.
#[derive(Debug, Deserialize)]
pub struct JwkKey {
    /// Key type; only "RSA" is retained.
    pub kty: String,
    /// Usage; only "sig" is retained.
    #[serde(rename = "use", default)]
    pub use_: String,
    /// Key id.
    #[serde(default)]
    pub kid: String,
    /// Algorithm hint.
    #[serde(default)]
    pub alg: String,
    /// Modulus, base64url.
    #[serde(default)]
    pub n: String,
    /// Exponent, base64url.
    #[serde(default)]
    pub e: String,
}

/// Raw claim set as deserialized by the JWT library.
#[derive(Debug, Deserialize)]
struct RawClaims {
    #[serde(default)]
    sub: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    iss: String,
    #[serde(default)]
    aud: Option<Audience>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    github_login: String,
    #[serde(default)]
    github_id: i64,
}

/// `aud` may be a string or a sequence of strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    fn into_vec(self) -> Vec<String> {
        match self {
            Audience::One(aud) => vec![aud],
            Audience::Many(auds) => auds,
        }
    }
}

/// JWKS-backed RS256 validator with background refresh.
pub struct JwtValidator {
    cfg: JwtValidatorConfig,
    http: reqwest::Client,
    keys: ArcSwap<HashMap<String, DecodingKey>>,
    cancel: CancellationToken,
    refresher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl JwtValidator {
    /// Create a validator. Call [`start`](Self::start) before validating.
    pub fn new(cfg: JwtValidatorConfig) -> Self {
        Self {
            cfg,
            http: reqwest::Client::builder()
                .timeout(JWKS_FETCH_TIMEOUT)
                .build()
                .expect("reqwest client construction cannot fail with static options"),
            keys: ArcSwap::from_pointee(HashMap::new()),
            cancel: CancellationToken::new(),
            refresher: Mutex::new(None),
        }
    }

    /// Fetch the JWKS synchronously and start the background refresher.
    ///
    /// The initial fetch is fatal on failure: the proxy must not start if it
    /// cannot validate tokens.
    pub async fn start(self: &Arc<Self>) -> Result<(), JwtError> {
        self.refresh().await?;

        let mut refresher = self.refresher.lock().expect("refresher lock poisoned");
        if refresher.is_some() {
            return Ok(());
        }

        let validator = Arc::clone(self);
        let cancel = self.cancel.clone();
        let interval = Duration::from_secs(self.cfg.refresh_interval.max(1));
        *refresher = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await; // the immediate first tick; startup already fetched
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {
                        if let Err(err) = validator.refresh().await {
                            tracing::warn!(error = %err, "JWKS refresh failed; keeping last-good keys");
                        }
                    }
                }
            }
        }));

        tracing::info!(jwks_url = %self.cfg.jwks_url, "JWT validator started");
        Ok(())
    }

    /// Stop the background refresher. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.refresher.lock().expect("refresher lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Fetch the JWKS and atomically replace the key map.
    pub async fn refresh(&self) -> Result<(), JwtError> {
        let response = self
            .http
            .get(&self.cfg.jwks_url)
            .send()
            .await
            .map_err(|e| JwtError::Jwks(e.to_string()))?;

        if !response.status().is_success() {
            return Err(JwtError::Jwks(format!(
                "JWKS endpoint returned status {}",
                response.status()
            )));
        }

        let jwks: JwksResponse = response
            .json()
            .await
            .map_err(|e| JwtError::Jwks(format!("decoding JWKS: {e}")))?;

        self.install_jwks(&jwks);
        Ok(())
    }

    /// Build and swap in the key map from a parsed JWKS. Only `(RSA, sig)`
    /// entries are retained; unparseable keys are skipped with a warning.
    pub fn install_jwks(&self, jwks: &JwksResponse) {
        let mut new_keys = HashMap::with_capacity(jwks.keys.len());

        for key in &jwks.keys {
            if key.kty != "RSA" || key.use_ != "sig" {
                continue;
            }

            match DecodingKey::from_rsa_components(&key.n, &key.e) {
                Ok(decoding) => {
                    new_keys.insert(key.kid.clone(), decoding);
                }
                Err(err) => {
                    tracing::warn!(kid = %key.kid, error = %err, "failed to parse RSA key");
                }
            }
        }

        let count = new_keys.len();
        self.keys.store(Arc::new(new_keys));
        tracing::debug!(key_count = count, "refreshed JWKS cache");
    }

    /// Number of keys currently cached.
    pub fn key_count(&self) -> usize {
        self.keys.load().len()
    }

    /// Validate a token and return its claims.
    pub fn validate(&self, token: &str) -> Result<JwtClaims, JwtError> {
        let header = decode_header(token).map_err(|e| JwtError::Malformed(e.to_string()))?;

        if header.alg != Algorithm::RS256 {
            return Err(JwtError::WrongAlgorithm(header.alg));
        }

        let kid = header.kid.ok_or(JwtError::MissingKid)?;
        let keys = self.keys.load();
        let key = keys.get(&kid).ok_or_else(|| JwtError::UnknownKid(kid.clone()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        // Audience and issuer are checked manually below so that an
        // unconfigured check is skipped rather than required.
        validation.validate_aud = false;

        let data = decode::<RawClaims>(token, key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature | ErrorKind::ImmatureSignature => JwtError::Expired,
                ErrorKind::InvalidSignature => JwtError::InvalidSignature,
                _ => JwtError::Malformed(e.to_string()),
            }
        })?;

        let raw = data.claims;
        let audience = raw.aud.map(Audience::into_vec).unwrap_or_default();

        if !self.cfg.issuer.is_empty() && raw.iss != self.cfg.issuer {
            return Err(JwtError::WrongIssuer { got: raw.iss });
        }

        if !self.cfg.audience.is_empty() && !audience.iter().any(|a| a == &self.cfg.audience) {
            return Err(JwtError::WrongAudience);
        }

        let claims = JwtClaims {
            subject: raw.sub,
            email: raw.email,
            issuer: raw.iss,
            audience,
            groups: raw.groups,
            expires_at: raw.exp.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            issued_at: raw.iat.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            github_login: raw.github_login,
            github_id: raw.github_id,
        };

        // The allow-list check happens last; success requires all checks.
        if !self.cfg.allowed_orgs.is_empty()
            && !has_allowed_org(&claims.groups, &self.cfg.allowed_orgs)
        {
            return Err(JwtError::GroupNotAllowed);
        }

        Ok(claims)
    }
}

/// Whether any of `groups` appears in `allowed_orgs`.
fn has_allowed_org(groups: &[String], allowed_orgs: &[String]) -> bool {
    allowed_orgs.iter().any(|org| groups.contains(org))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use rsa::traits::PublicKeyParts;

    fn config(issuer: &str, audience: &str, allowed_orgs: &[&str]) -> JwtValidatorConfig {
        JwtValidatorConfig {
            jwks_url: "http://127.0.0.1:1/keys".to_string(),
            issuer: issuer.to_string(),
            audience: audience.to_string(),
            allowed_orgs: allowed_orgs.iter().map(|s| s.to_string()).collect(),
            refresh_interval: 3600,
        }
    }

    /// RS256 test fixture: a generated keypair plus its JWK components.
    struct TestKey {
        encoding: jsonwebtoken::EncodingKey,
        jwks: JwksResponse,
    }

    fn test_key(kid: &str) -> TestKey {
        use rsa::pkcs1::EncodeRsaPrivateKey;

        let mut rng = rand::thread_rng();
        let key = rsa::RsaPrivateKey::new(&mut rng, 2048).expect("keygen");
        let der = key.to_pkcs1_der().expect("der encode");

        TestKey {
            encoding: jsonwebtoken::EncodingKey::from_rsa_der(der.as_bytes()),
            jwks: JwksResponse {
                keys: vec![JwkKey {
                    kty: "RSA".into(),
                    use_: "sig".into(),
                    kid: kid.into(),
                    alg: "RS256".into(),
                    n: URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
                    e: URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
                }],
            },
        }
    }

    fn sign(key: &TestKey, kid: &str, claims: &serde_json::Value) -> String {
        let header = jsonwebtoken::Header {
            alg: Algorithm::RS256,
            kid: Some(kid.to_string()),
            ..Default::default()
        };
        jsonwebtoken::encode(&header, claims, &key.encoding).expect("sign")
    }

    fn future_exp() -> i64 {
        Utc::now().timestamp() + 3600
    }

    #[test]
    fn install_jwks_retains_only_rsa_sig_keys() {
        let validator = JwtValidator::new(config("", "", &[]));
        let n = URL_SAFE_NO_PAD.encode([7u8; 128]);

        validator.install_jwks(&JwksResponse {
            keys: vec![
                JwkKey {
                    kty: "RSA".into(),
                    use_: "sig".into(),
                    kid: "good".into(),
                    alg: "RS256".into(),
                    n: n.clone(),
                    e: "AQAB".into(),
                },
                JwkKey {
                    kty: "EC".into(),
                    use_: "sig".into(),
                    kid: "wrong-kty".into(),
                    alg: "ES256".into(),
                    n: String::new(),
                    e: String::new(),
                },
                JwkKey {
                    kty: "RSA".into(),
                    use_: "enc".into(),
                    kid: "wrong-use".into(),
                    alg: "RS256".into(),
                    n,
                    e: "AQAB".into(),
                },
            ],
        });

        assert_eq!(validator.key_count(), 1);
    }

    #[test]
    fn install_jwks_replaces_the_whole_map() {
        let validator = JwtValidator::new(config("", "", &[]));
        let key = test_key("old-kid");
        validator.install_jwks(&key.jwks);
        assert_eq!(validator.key_count(), 1);

        let replacement = test_key("new-kid");
        validator.install_jwks(&replacement.jwks);
        assert_eq!(validator.key_count(), 1);

        // A token signed under the vanished kid now fails with unknown-kid.
        let token = sign(
            &key,
            "old-kid",
            &serde_json::json!({"sub": "u", "exp": future_exp()}),
        );
        let err = validator.validate(&token).unwrap_err();
        assert!(matches!(err, JwtError::UnknownKid(ref kid) if kid == "old-kid"));
    }

    #[tokio::test]
    async fn failed_refresh_preserves_previous_map() {
        let validator = JwtValidator::new(config("", "", &[]));
        validator.install_jwks(&test_key("kid-1").jwks);
        assert_eq!(validator.key_count(), 1);

        // jwks_url points at a closed port.
        let err = validator.refresh().await.unwrap_err();
        assert!(matches!(err, JwtError::Jwks(_)));
        assert_eq!(validator.key_count(), 1, "last-good map must survive");
    }

    #[test]
    fn valid_token_is_accepted_with_all_checks() {
        let validator = JwtValidator::new(config(
            "https://idp",
            "chainscope",
            &["ethpandaops"],
        ));
        let key = test_key("k1");
        validator.install_jwks(&key.jwks);

        let token = sign(
            &key,
            "k1",
            &serde_json::json!({
                "sub": "user-1",
                "email": "dev@example.com",
                "iss": "https://idp",
                "aud": ["chainscope", "other"],
                "groups": ["ethpandaops", "other"],
                "exp": future_exp(),
                "iat": Utc::now().timestamp(),
            }),
        );

        let claims = validator.validate(&token).unwrap();
        assert_eq!(claims.subject, "user-1");
        assert_eq!(claims.email, "dev@example.com");
        assert_eq!(claims.groups, vec!["ethpandaops", "other"]);
        assert_eq!(claims.audience, vec!["chainscope", "other"]);
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let validator = JwtValidator::new(config("https://idp", "", &["ethpandaops"]));
        let key = test_key("k1");
        validator.install_jwks(&key.jwks);

        let token = sign(
            &key,
            "k1",
            &serde_json::json!({
                "sub": "user-1",
                "iss": "https://evil",
                "groups": ["ethpandaops"],
                "exp": future_exp(),
            }),
        );

        let err = validator.validate(&token).unwrap_err();
        assert!(matches!(err, JwtError::WrongIssuer { .. }));
    }

    #[test]
    fn audience_string_is_normalized_to_sequence() {
        let validator = JwtValidator::new(config("", "chainscope", &[]));
        let key = test_key("k1");
        validator.install_jwks(&key.jwks);

        let token = sign(
            &key,
            "k1",
            &serde_json::json!({"sub": "u", "aud": "chainscope", "exp": future_exp()}),
        );

        let claims = validator.validate(&token).unwrap();
        assert_eq!(claims.audience, vec!["chainscope"]);
    }

    #[test]
    fn missing_configured_audience_is_rejected() {
        let validator = JwtValidator::new(config("", "chainscope", &[]));
        let key = test_key("k1");
        validator.install_jwks(&key.jwks);

        let token = sign(
            &key,
            "k1",
            &serde_json::json!({"sub": "u", "aud": ["other"], "exp": future_exp()}),
        );

        assert!(matches!(
            validator.validate(&token).unwrap_err(),
            JwtError::WrongAudience
        ));
    }

    #[test]
    fn disjoint_groups_are_rejected() {
        let validator = JwtValidator::new(config("", "", &["ethpandaops"]));
        let key = test_key("k1");
        validator.install_jwks(&key.jwks);

        let token = sign(
            &key,
            "k1",
            &serde_json::json!({"sub": "u", "groups": ["strangers"], "exp": future_exp()}),
        );

        assert!(matches!(
            validator.validate(&token).unwrap_err(),
            JwtError::GroupNotAllowed
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let validator = JwtValidator::new(config("", "", &[]));
        let key = test_key("k1");
        validator.install_jwks(&key.jwks);

        let token = sign(
            &key,
            "k1",
            &serde_json::json!({"sub": "u", "exp": Utc::now().timestamp() - 100}),
        );

        assert!(matches!(
            validator.validate(&token).unwrap_err(),
            JwtError::Expired
        ));
    }

    #[test]
    fn token_without_kid_is_rejected() {
        let validator = JwtValidator::new(config("", "", &[]));
        let key = test_key("k1");
        validator.install_jwks(&key.jwks);

        let header = jsonwebtoken::Header::new(Algorithm::RS256);
        let token = jsonwebtoken::encode(
            &header,
            &serde_json::json!({"sub": "u", "exp": future_exp()}),
            &key.encoding,
        )
        .unwrap();

        assert!(matches!(
            validator.validate(&token).unwrap_err(),
            JwtError::MissingKid
        ));
    }

    #[test]
    fn signature_from_another_key_is_rejected() {
        let validator = JwtValidator::new(config("", "", &[]));
        let trusted = test_key("k1");
        validator.install_jwks(&trusted.jwks);

        // Signed by a different key but claiming the trusted kid.
        let imposter = test_key("k1");
        let token = sign(
            &imposter,
            "k1",
            &serde_json::json!({"sub": "u", "exp": future_exp()}),
        );

        assert!(matches!(
            validator.validate(&token).unwrap_err(),
            JwtError::InvalidSignature
        ));
    }

    #[test]
    fn garbage_token_is_malformed() {
        let validator = JwtValidator::new(config("", "", &[]));
        assert!(matches!(
            validator.validate("not-a-jwt").unwrap_err(),
            JwtError::Malformed(_)
        ));
    }

    #[test]
    fn group_intersection_helper() {
        let groups = vec!["a".to_string(), "b".to_string()];
        assert!(has_allowed_org(&groups, &["b".to_string()]));
        assert!(!has_allowed_org(&groups, &["c".to_string()]));
        assert!(!has_allowed_org(&[], &["c".to_string()]));
    }
}

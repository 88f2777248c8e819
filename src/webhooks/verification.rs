use crate::clock::{Clock, SystemClock, system_clock};
use crate::error::{Result, SignatureError};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;

/// Default freshness window for signature timestamps
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

/// Hash algorithm named in the signature header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl SignatureAlgorithm {
    /// Header key carrying the digest, e.g. `sha256`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Raw digest length in bytes
    pub fn digest_len(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }
}

impl std::fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SignatureAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(format!("unsupported signature algorithm: {}", other)),
        }
    }
}

/// Parsed form of a `t=<unix-seconds>,<algo>=<hex-digest>` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    pub algorithm: SignatureAlgorithm,
    pub digest: String,
}

impl SignatureHeader {
    /// Parse a header, looking for the digest under `algorithm`'s key.
    ///
    /// Keys other than `t` and the algorithm are ignored. A missing or
    /// repeated timestamp or digest is malformed.
    pub fn parse(
        header: &str,
        algorithm: SignatureAlgorithm,
    ) -> std::result::Result<Self, SignatureError> {
        let mut timestamp = None;
        let mut digest = None;

        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };

            if key == "t" {
                if timestamp.is_some() {
                    return Err(SignatureError::MalformedSignature(
                        "duplicate timestamp".to_string(),
                    ));
                }
                let parsed = value.trim().parse::<i64>().map_err(|_| {
                    SignatureError::MalformedSignature("timestamp is not an integer".to_string())
                })?;
                timestamp = Some(parsed);
            } else if key == algorithm.as_str() {
                if digest.is_some() {
                    return Err(SignatureError::MalformedSignature(format!(
                        "duplicate {} digest",
                        algorithm
                    )));
                }
                digest = Some(value.trim().to_string());
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| SignatureError::MalformedSignature("missing timestamp".to_string()))?;
        let digest = digest.ok_or_else(|| {
            SignatureError::MalformedSignature(format!("missing {} digest", algorithm))
        })?;

        Ok(Self {
            timestamp,
            algorithm,
            digest,
        })
    }

    /// Render back into wire format
    pub fn to_header_value(&self) -> String {
        format!("t={},{}={}", self.timestamp, self.algorithm, self.digest)
    }
}

/// Outcome of [`SignatureVerifier::verify`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub valid: bool,
    /// Parsed header timestamp, present once parsing succeeded
    pub timestamp: Option<i64>,
    pub error: Option<SignatureError>,
}

impl VerificationResult {
    fn ok(timestamp: i64) -> Self {
        Self {
            valid: true,
            timestamp: Some(timestamp),
            error: None,
        }
    }

    fn failed(timestamp: Option<i64>, error: SignatureError) -> Self {
        Self {
            valid: false,
            timestamp,
            error: Some(error),
        }
    }

    /// Convert into a `Result` carrying the verified timestamp
    pub fn into_result(self) -> std::result::Result<i64, SignatureError> {
        match (self.valid, self.timestamp, self.error) {
            (true, Some(ts), _) => Ok(ts),
            (_, _, Some(err)) => Err(err),
            _ => Err(SignatureError::SignatureMismatch),
        }
    }
}

/// Hash `"<timestamp>.<payload>"` followed by the secret
pub fn compute_digest(
    algorithm: SignatureAlgorithm,
    timestamp: i64,
    payload: &[u8],
    secret: &[u8],
) -> Vec<u8> {
    fn hash<D: Digest>(timestamp: i64, payload: &[u8], secret: &[u8]) -> Vec<u8> {
        let mut hasher = D::new();
        hasher.update(timestamp.to_string().as_bytes());
        hasher.update(b".");
        hasher.update(payload);
        hasher.update(secret);
        hasher.finalize().to_vec()
    }

    match algorithm {
        SignatureAlgorithm::Sha256 => hash::<Sha256>(timestamp, payload, secret),
        SignatureAlgorithm::Sha512 => hash::<Sha512>(timestamp, payload, secret),
    }
}

/// Produce a signature header for `payload`.
///
/// Uses the current system time when `timestamp` is `None`.
pub fn generate(
    payload: &[u8],
    secret: &str,
    algorithm: SignatureAlgorithm,
    timestamp: Option<i64>,
) -> String {
    let ts = timestamp.unwrap_or_else(|| SystemClock.unix_seconds());
    let digest = compute_digest(algorithm, ts, payload, secret.as_bytes());
    format!("t={},{}={}", ts, algorithm, hex::encode(digest))
}

/// Verify `header` against `payload` using the system clock
pub fn verify(
    payload: &[u8],
    header: &str,
    secret: &str,
    algorithm: SignatureAlgorithm,
    tolerance: Duration,
) -> VerificationResult {
    verify_at(
        payload,
        header,
        secret.as_bytes(),
        algorithm,
        tolerance,
        SystemClock.unix_seconds(),
    )
}

fn verify_at(
    payload: &[u8],
    header: &str,
    secret: &[u8],
    algorithm: SignatureAlgorithm,
    tolerance: Duration,
    now: i64,
) -> VerificationResult {
    let parsed = match SignatureHeader::parse(header, algorithm) {
        Ok(parsed) => parsed,
        Err(err) => return VerificationResult::failed(None, err),
    };
    let ts = parsed.timestamp;

    if now.abs_diff(ts) > tolerance.as_secs() {
        return VerificationResult::failed(
            Some(ts),
            SignatureError::StaleSignature {
                timestamp: ts,
                now,
                tolerance_secs: tolerance.as_secs(),
            },
        );
    }

    let provided = match hex::decode(&parsed.digest) {
        Ok(bytes) => bytes,
        Err(_) => {
            return VerificationResult::failed(
                Some(ts),
                SignatureError::MalformedSignature("digest is not valid hex".to_string()),
            );
        }
    };

    let expected = compute_digest(algorithm, ts, payload, secret);

    if constant_time_compare(&expected, &provided) {
        VerificationResult::ok(ts)
    } else {
        VerificationResult::failed(Some(ts), SignatureError::SignatureMismatch)
    }
}

/// Constant-time comparison to prevent timing attacks
///
/// Digest length is public (fixed per algorithm), so a length mismatch
/// returns early. Content comparison goes through `subtle`, which keeps
/// LLVM from turning it back into a short-circuiting loop.
fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}

/// Trait for verifying webhook signatures
///
/// The pipeline holds a `dyn WebhookVerifier` so development setups can
/// swap in [`NoVerification`].
#[async_trait]
pub trait WebhookVerifier: Send + Sync {
    /// Verify the raw body against the signature header value
    ///
    /// Returns `Err(TidehookError::Signature(_))` when the delivery must be
    /// rejected.
    async fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<()>;
}

/// No-op verifier that accepts all webhooks
///
/// **WARNING:** only for local development and tests. Never deploy this in
/// front of a provider that signs its deliveries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVerification;

#[async_trait]
impl WebhookVerifier for NoVerification {
    async fn verify_signature(&self, _payload: &[u8], _signature: &str) -> Result<()> {
        tracing::warn!(
            "NoVerification webhook verifier used - all webhooks accepted without verification"
        );
        Ok(())
    }
}

/// Verifier for timestamped `t=...,<algo>=...` signatures
///
/// The secret is stored as a [`SecretString`] and never appears in debug
/// output.
///
/// # Example
///
/// ```rust
/// use tidehook::webhooks::{SignatureAlgorithm, SignatureVerifier};
///
/// let verifier = SignatureVerifier::new("whsec_test");
/// let header = verifier.generate(b"{\"id\":\"evt_1\"}", None);
/// assert!(verifier.verify(b"{\"id\":\"evt_1\"}", &header).valid);
/// ```
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    secret: SecretString,
    algorithm: SignatureAlgorithm,
    tolerance: Duration,
    clock: Arc<dyn Clock>,
}

impl SignatureVerifier {
    /// Create a SHA-256 verifier with the default 300s tolerance
    pub fn new(secret: impl Into<SecretString>) -> Self {
        Self {
            secret: secret.into(),
            algorithm: SignatureAlgorithm::default(),
            tolerance: DEFAULT_TOLERANCE,
            clock: system_clock(),
        }
    }

    pub fn with_algorithm(mut self, algorithm: SignatureAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Sign `payload`, at the verifier's current time when `timestamp` is `None`
    pub fn generate(&self, payload: &[u8], timestamp: Option<i64>) -> String {
        let ts = timestamp.unwrap_or_else(|| self.clock.unix_seconds());
        generate(payload, self.secret.expose_secret(), self.algorithm, Some(ts))
    }

    /// Check authenticity and freshness of `payload`
    pub fn verify(&self, payload: &[u8], header: &str) -> VerificationResult {
        let result = verify_at(
            payload,
            header,
            self.secret.expose_secret().as_bytes(),
            self.algorithm,
            self.tolerance,
            self.clock.unix_seconds(),
        );

        if let Some(ref err) = result.error {
            match err {
                SignatureError::SignatureMismatch => {
                    tracing::warn!(
                        target: "tidehook::webhooks::verification",
                        timestamp = ?result.timestamp,
                        "Webhook signature mismatch"
                    );
                }
                _ => {
                    tracing::debug!(
                        target: "tidehook::webhooks::verification",
                        error = %err,
                        "Webhook signature rejected"
                    );
                }
            }
        }

        result
    }

    /// Like [`verify`](Self::verify), returning the verified timestamp or an error
    pub fn verify_strict(&self, payload: &[u8], header: &str) -> Result<i64> {
        Ok(self.verify(payload, header).into_result()?)
    }
}

#[async_trait]
impl WebhookVerifier for SignatureVerifier {
    async fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<()> {
        self.verify_strict(payload, signature).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::TidehookError;

    const NOW: i64 = 1_700_000_000;
    const SECRET: &str = "whsec_test_secret";

    fn verifier_at(now: i64) -> SignatureVerifier {
        SignatureVerifier::new(SECRET).with_clock(Arc::new(ManualClock::at_unix(now)))
    }

    /// Replace the hex character at `index` of the digest with a different one
    fn flip_digest_char(header: &str, index: usize) -> String {
        let (prefix, digest) = header.split_once("sha256=").unwrap();
        let mut chars: Vec<char> = digest.chars().collect();
        chars[index] = if chars[index] == '0' { '1' } else { '0' };
        format!("{}sha256={}", prefix, chars.into_iter().collect::<String>())
    }

    // ============ header parsing ============

    #[test]
    fn test_parse_header() {
        let header =
            SignatureHeader::parse("t=1700000000,sha256=abcd", SignatureAlgorithm::Sha256)
                .unwrap();
        assert_eq!(header.timestamp, 1_700_000_000);
        assert_eq!(header.algorithm, SignatureAlgorithm::Sha256);
        assert_eq!(header.digest, "abcd");
        assert_eq!(header.to_header_value(), "t=1700000000,sha256=abcd");
    }

    #[test]
    fn test_parse_header_tolerates_whitespace_and_extra_keys() {
        let header = SignatureHeader::parse(
            " t=5 , v0=zzz, sha512=ff ",
            SignatureAlgorithm::Sha512,
        )
        .unwrap();
        assert_eq!(header.timestamp, 5);
        assert_eq!(header.digest, "ff");
    }

    #[test]
    fn test_parse_header_missing_fields() {
        let missing_ts = SignatureHeader::parse("sha256=abcd", SignatureAlgorithm::Sha256);
        assert!(matches!(
            missing_ts,
            Err(SignatureError::MalformedSignature(_))
        ));

        let missing_digest = SignatureHeader::parse("t=123", SignatureAlgorithm::Sha256);
        assert!(matches!(
            missing_digest,
            Err(SignatureError::MalformedSignature(_))
        ));

        // Digest under a different algorithm than configured
        let wrong_algo = SignatureHeader::parse("t=123,sha512=ab", SignatureAlgorithm::Sha256);
        assert!(matches!(wrong_algo, Err(SignatureError::MalformedSignature(_))));

        let empty = SignatureHeader::parse("", SignatureAlgorithm::Sha256);
        assert!(matches!(empty, Err(SignatureError::MalformedSignature(_))));
    }

    #[test]
    fn test_parse_header_rejects_duplicates_and_bad_timestamp() {
        assert!(SignatureHeader::parse("t=1,t=2,sha256=ab", SignatureAlgorithm::Sha256).is_err());
        assert!(
            SignatureHeader::parse("t=1,sha256=ab,sha256=cd", SignatureAlgorithm::Sha256).is_err()
        );
        assert!(SignatureHeader::parse("t=soon,sha256=ab", SignatureAlgorithm::Sha256).is_err());
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("SHA256".parse::<SignatureAlgorithm>(), Ok(SignatureAlgorithm::Sha256));
        assert_eq!("sha512".parse::<SignatureAlgorithm>(), Ok(SignatureAlgorithm::Sha512));
        assert!("md5".parse::<SignatureAlgorithm>().is_err());
    }

    // ============ generate ============

    #[test]
    fn test_generate_format_and_digest_length() {
        let header = generate(b"payload", SECRET, SignatureAlgorithm::Sha256, Some(NOW));
        let parsed = SignatureHeader::parse(&header, SignatureAlgorithm::Sha256).unwrap();
        assert_eq!(parsed.timestamp, NOW);
        assert_eq!(parsed.digest.len(), 64);

        let header = generate(b"payload", SECRET, SignatureAlgorithm::Sha512, Some(NOW));
        let parsed = SignatureHeader::parse(&header, SignatureAlgorithm::Sha512).unwrap();
        assert_eq!(parsed.digest.len(), 128);
    }

    #[test]
    fn test_generate_hashes_timestamp_payload_then_secret() {
        let header = generate(b"body", "key", SignatureAlgorithm::Sha256, Some(7));
        let expected = hex::encode(Sha256::digest(b"7.bodykey"));
        assert_eq!(header, format!("t=7,sha256={}", expected));
    }

    #[test]
    fn test_generate_is_deterministic() {
        let a = generate(b"x", SECRET, SignatureAlgorithm::Sha256, Some(NOW));
        let b = generate(b"x", SECRET, SignatureAlgorithm::Sha256, Some(NOW));
        assert_eq!(a, b);
    }

    // ============ verify ============

    #[test]
    fn test_verify_round_trip() {
        let verifier = verifier_at(NOW);
        for payload in [
            b"".as_slice(),
            br#"{"id":"evt_1","type":"payment.succeeded"}"#.as_slice(),
            &[0x00, 0xff, 0x80],
        ] {
            let header = verifier.generate(payload, Some(NOW));
            let result = verifier.verify(payload, &header);
            assert!(result.valid, "payload {:?} should verify", payload);
            assert_eq!(result.timestamp, Some(NOW));
            assert_eq!(result.error, None);
        }
    }

    #[test]
    fn test_verify_round_trip_sha512() {
        let verifier = verifier_at(NOW).with_algorithm(SignatureAlgorithm::Sha512);
        let header = verifier.generate(b"payload", None);
        assert!(header.contains("sha512="));
        assert!(verifier.verify(b"payload", &header).valid);
    }

    #[test]
    fn test_free_functions_round_trip() {
        let header = generate(b"payload", SECRET, SignatureAlgorithm::Sha256, None);
        let result = verify(
            b"payload",
            &header,
            SECRET,
            SignatureAlgorithm::Sha256,
            DEFAULT_TOLERANCE,
        );
        assert!(result.valid);
    }

    #[test]
    fn test_flipping_any_digest_char_is_mismatch() {
        let verifier = verifier_at(NOW);
        let header = verifier.generate(b"payload", Some(NOW));

        for index in [0, 1, 31, 32, 62, 63] {
            let tampered = flip_digest_char(&header, index);
            let result = verifier.verify(b"payload", &tampered);
            assert!(!result.valid);
            assert_eq!(result.error, Some(SignatureError::SignatureMismatch));
        }
    }

    #[test]
    fn test_modified_payload_is_mismatch() {
        let verifier = verifier_at(NOW);
        let header = verifier.generate(b"original", Some(NOW));
        let result = verifier.verify(b"modified", &header);
        assert_eq!(result.error, Some(SignatureError::SignatureMismatch));
    }

    #[test]
    fn test_wrong_secret_is_mismatch() {
        let header = generate(b"payload", "other-secret", SignatureAlgorithm::Sha256, Some(NOW));
        let result = verifier_at(NOW).verify(b"payload", &header);
        assert_eq!(result.error, Some(SignatureError::SignatureMismatch));
    }

    #[test]
    fn test_truncated_digest_is_mismatch() {
        let verifier = verifier_at(NOW);
        let header = verifier.generate(b"payload", Some(NOW));
        let truncated = &header[..header.len() - 2];
        let result = verifier.verify(b"payload", truncated);
        assert_eq!(result.error, Some(SignatureError::SignatureMismatch));
    }

    #[test]
    fn test_non_hex_digest_is_malformed() {
        let result = verifier_at(NOW).verify(b"payload", &format!("t={},sha256=zz", NOW));
        assert!(matches!(
            result.error,
            Some(SignatureError::MalformedSignature(_))
        ));
        assert_eq!(result.timestamp, Some(NOW));
    }

    #[test]
    fn test_staleness_boundary() {
        let tolerance = DEFAULT_TOLERANCE.as_secs() as i64;
        let verifier = verifier_at(NOW);

        let too_old = verifier.generate(b"payload", Some(NOW - tolerance - 1));
        let result = verifier.verify(b"payload", &too_old);
        assert!(!result.valid);
        assert!(matches!(
            result.error,
            Some(SignatureError::StaleSignature { .. })
        ));

        let just_fresh = verifier.generate(b"payload", Some(NOW - tolerance + 1));
        assert!(verifier.verify(b"payload", &just_fresh).valid);

        let exactly_tolerance = verifier.generate(b"payload", Some(NOW - tolerance));
        assert!(verifier.verify(b"payload", &exactly_tolerance).valid);
    }

    #[test]
    fn test_future_timestamps_outside_tolerance_are_stale() {
        let verifier = verifier_at(NOW).with_tolerance(Duration::from_secs(10));
        let future = verifier.generate(b"payload", Some(NOW + 11));
        assert!(matches!(
            verifier.verify(b"payload", &future).error,
            Some(SignatureError::StaleSignature { .. })
        ));

        let skewed = verifier.generate(b"payload", Some(NOW + 10));
        assert!(verifier.verify(b"payload", &skewed).valid);
    }

    #[test]
    fn test_staleness_checked_before_digest() {
        // A stale header with garbage digest reports staleness, not mismatch
        let result = verifier_at(NOW).verify(b"payload", "t=1,sha256=00");
        assert!(matches!(
            result.error,
            Some(SignatureError::StaleSignature { .. })
        ));
    }

    #[test]
    fn test_verify_strict() {
        let verifier = verifier_at(NOW);
        let header = verifier.generate(b"payload", None);
        assert_eq!(verifier.verify_strict(b"payload", &header).unwrap(), NOW);

        let err = verifier.verify_strict(b"payload", "garbage").unwrap_err();
        assert!(matches!(
            err,
            TidehookError::Signature(SignatureError::MalformedSignature(_))
        ));
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let verifier = SignatureVerifier::new("super-secret-value");
        let debug = format!("{:?}", verifier);
        assert!(!debug.contains("super-secret-value"));
    }

    // ============ constant_time_compare ============

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(&[], &[]));
        assert!(constant_time_compare(&[1, 2, 3], &[1, 2, 3]));
        assert!(!constant_time_compare(&[1, 2, 3], &[1, 2, 4]));
        assert!(!constant_time_compare(&[0; 32], &[0xff; 32]));
        assert!(!constant_time_compare(&[1, 2], &[1, 2, 3]));
    }

    // ============ WebhookVerifier trait ============

    #[tokio::test]
    async fn test_no_verification_accepts_everything() {
        let verifier = NoVerification;
        assert!(verifier.verify_signature(b"anything", "").await.is_ok());
        assert!(verifier.verify_signature(&[], "garbage").await.is_ok());
    }

    #[tokio::test]
    async fn test_signature_verifier_as_dyn_trait() {
        let concrete = verifier_at(NOW);
        let header = concrete.generate(b"payload", None);
        let verifier: Arc<dyn WebhookVerifier> = Arc::new(concrete);

        assert!(verifier.verify_signature(b"payload", &header).await.is_ok());
        let err = verifier
            .verify_signature(b"tampered", &header)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TidehookError::Signature(SignatureError::SignatureMismatch)
        ));
    }
}

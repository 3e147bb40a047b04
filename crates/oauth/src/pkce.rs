//! Proof Key for Code Exchange (RFC 7636), `S256` only.
//!
//! ```text
//! code_challenge = BASE64URL-NOPAD(SHA256(ASCII(code_verifier)))
//! ```
//!
//! The `plain` method is rejected: it offers no protection once the
//! authorization request itself is observed.

use std::{fmt, str::FromStr};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};

use crate::error::OAuthError;

/// Shortest verifier RFC 7636 allows.
pub const MIN_VERIFIER_LEN: usize = 43;

/// Longest verifier RFC 7636 allows.
pub const MAX_VERIFIER_LEN: usize = 128;

/// Length of a base64url-encoded SHA-256 digest.
pub const S256_CHALLENGE_LEN: usize = 43;

/// Supported challenge methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodeChallengeMethod {
    /// SHA-256, base64url without padding.
    #[default]
    S256,
}

impl CodeChallengeMethod {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S256 => "S256",
        }
    }

    /// Parses an optional request parameter, defaulting to `S256` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::InvalidRequest`] for `plain` or any unknown method.
    pub fn from_param(param: Option<&str>) -> Result<Self, OAuthError> {
        param.map_or(Ok(Self::S256), str::parse)
    }
}

impl FromStr for CodeChallengeMethod {
    type Err = OAuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S256" => Ok(Self::S256),
            other => Err(OAuthError::invalid_request(format!(
                "unsupported code_challenge_method: {other}"
            ))),
        }
    }
}

impl fmt::Display for CodeChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

/// Derives the `S256` challenge for a verifier.
#[must_use]
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Checks a verifier's length and alphabet.
///
/// # Errors
///
/// Returns [`OAuthError::InvalidGrant`]; by the time a verifier is checked
/// the code has already been consumed.
pub fn validate_verifier(verifier: &str) -> Result<(), OAuthError> {
    if !(MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&verifier.len()) {
        return Err(OAuthError::invalid_grant(format!(
            "code_verifier must be {MIN_VERIFIER_LEN}-{MAX_VERIFIER_LEN} characters"
        )));
    }
    if !verifier.bytes().all(is_unreserved) {
        return Err(OAuthError::invalid_grant("code_verifier contains invalid characters"));
    }
    Ok(())
}

/// Checks that a challenge is a well-formed `S256` digest.
///
/// # Errors
///
/// Returns [`OAuthError::InvalidRequest`] if it is not 43 base64url characters.
pub fn validate_challenge(challenge: &str, method: CodeChallengeMethod) -> Result<(), OAuthError> {
    match method {
        CodeChallengeMethod::S256 => {
            let well_formed = challenge.len() == S256_CHALLENGE_LEN
                && challenge.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
            if !well_formed {
                return Err(OAuthError::invalid_request(
                    "code_challenge must be a base64url SHA-256 digest",
                ));
            }
            Ok(())
        },
    }
}

/// Recomputes the challenge from `verifier` and compares it to `challenge`
/// in constant time.
#[must_use]
pub fn verify(verifier: &str, challenge: &str, method: CodeChallengeMethod) -> bool {
    let computed = match method {
        CodeChallengeMethod::S256 => challenge_for(verifier),
    };
    constant_time_eq(computed.as_bytes(), challenge.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;

    // RFC 7636 Appendix B.
    const RFC_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const RFC_CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn test_rfc_vector() {
        assert_eq!(challenge_for(RFC_VERIFIER), RFC_CHALLENGE);
        assert!(verify(RFC_VERIFIER, RFC_CHALLENGE, CodeChallengeMethod::S256));
        validate_challenge(RFC_CHALLENGE, CodeChallengeMethod::S256).unwrap();
        validate_verifier(RFC_VERIFIER).unwrap();
    }

    #[test]
    fn test_wrong_verifier_fails() {
        let other = "x".repeat(43);
        assert!(!verify(&other, RFC_CHALLENGE, CodeChallengeMethod::S256));
    }

    #[rstest]
    #[case("short")]
    #[case(&"a".repeat(129))]
    #[case(&format!("{}!", "a".repeat(43)))]
    #[case(&format!("{} ", "a".repeat(43)))]
    fn test_bad_verifiers(#[case] verifier: &str) {
        assert!(matches!(validate_verifier(verifier), Err(OAuthError::InvalidGrant(_))));
    }

    #[rstest]
    #[case(None, true)]
    #[case(Some("S256"), true)]
    #[case(Some("plain"), false)]
    #[case(Some("s256"), false)]
    fn test_method_param(#[case] param: Option<&str>, #[case] ok: bool) {
        assert_eq!(CodeChallengeMethod::from_param(param).is_ok(), ok);
    }

    #[test]
    fn test_padded_challenge_rejected() {
        let padded = format!("{}=", &RFC_CHALLENGE[..42]);
        assert!(validate_challenge(&padded, CodeChallengeMethod::S256).is_err());
    }
}

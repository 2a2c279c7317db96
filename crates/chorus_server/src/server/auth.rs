#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chorus_domain::Identity;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::util::secret::SecretString;
use crate::util::time::unix_secs_now;

/// Why a handshake credential was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthenticationFailed {
	#[error("missing credential")]
	Missing,

	#[error("malformed credential: {0}")]
	Malformed(String),

	#[error("invalid credential signature")]
	BadSignature,

	#[error("credential expired")]
	Expired,

	#[error("credential rejected")]
	Rejected,
}

/// Resolves the credential presented at connection upgrade into an identity.
///
/// Runs inside the upgrade handshake, before any frame is exchanged.
pub trait HandshakeAuthenticator: Send + Sync {
	fn authenticate(&self, credential: Option<&str>) -> Result<Identity, AuthenticationFailed>;
}

/// Claims carried by a `v1.<payload>.<signature>` token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,

	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub extra: BTreeMap<String, String>,
}

impl From<AuthClaims> for Identity {
	fn from(claims: AuthClaims) -> Self {
		Identity {
			id: claims.sub,
			extra: claims.extra,
		}
	}
}

/// Issue a signed token for `claims`.
pub fn sign_hmac_token(claims: &AuthClaims, secret: &str) -> Result<String, serde_json::Error> {
	let payload = serde_json::to_vec(claims)?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

pub fn verify_hmac_token(token: &str, secret: &str) -> Result<AuthClaims, AuthenticationFailed> {
	verify_hmac_token_at(token, secret, unix_secs_now())
}

fn verify_hmac_token_at(token: &str, secret: &str, now: u64) -> Result<AuthClaims, AuthenticationFailed> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(AuthenticationFailed::Malformed("invalid token format".to_string()));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD
		.decode(payload_b64)
		.map_err(|e| AuthenticationFailed::Malformed(format!("decode token payload: {e}")))?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD
		.decode(sig_b64)
		.map_err(|e| AuthenticationFailed::Malformed(format!("decode token signature: {e}")))?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(AuthenticationFailed::BadSignature);
	}

	let claims: AuthClaims = serde_json::from_slice(&payload)
		.map_err(|e| AuthenticationFailed::Malformed(format!("parse token claims: {e}")))?;
	if claims.sub.trim().is_empty() {
		return Err(AuthenticationFailed::Malformed("empty subject".to_string()));
	}
	if claims.exp <= now {
		return Err(AuthenticationFailed::Expired);
	}

	Ok(claims)
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// Stateless HMAC-SHA256 signed tokens.
#[derive(Debug, Clone)]
pub struct HmacTokenAuthenticator {
	secret: SecretString,
}

impl HmacTokenAuthenticator {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}
}

impl HandshakeAuthenticator for HmacTokenAuthenticator {
	fn authenticate(&self, credential: Option<&str>) -> Result<Identity, AuthenticationFailed> {
		let token = credential.map(str::trim).filter(|t| !t.is_empty());
		let Some(token) = token else {
			return Err(AuthenticationFailed::Missing);
		};
		verify_hmac_token(token, self.secret.expose()).map(Identity::from)
	}
}

/// A single shared token mapped to a fixed identity.
#[derive(Debug, Clone)]
pub struct StaticTokenAuthenticator {
	token: SecretString,
	identity: Identity,
}

impl StaticTokenAuthenticator {
	pub fn new(token: SecretString, identity: Identity) -> Self {
		Self { token, identity }
	}
}

impl HandshakeAuthenticator for StaticTokenAuthenticator {
	fn authenticate(&self, credential: Option<&str>) -> Result<Identity, AuthenticationFailed> {
		let token = credential.map(str::trim).filter(|t| !t.is_empty());
		let Some(token) = token else {
			return Err(AuthenticationFailed::Missing);
		};
		if constant_time_eq(token.as_bytes(), self.token.expose().as_bytes()) {
			Ok(self.identity.clone())
		} else {
			Err(AuthenticationFailed::Rejected)
		}
	}
}

/// Accepts every connection under a fixed identity.
#[derive(Debug, Clone)]
pub struct AnonymousAuthenticator {
	identity: Identity,
}

impl AnonymousAuthenticator {
	pub const DEFAULT_USER_ID: &'static str = "anonymous";

	pub fn new() -> Self {
		Self {
			identity: Identity::new(Self::DEFAULT_USER_ID),
		}
	}
}

impl Default for AnonymousAuthenticator {
	fn default() -> Self {
		Self::new()
	}
}

impl HandshakeAuthenticator for AnonymousAuthenticator {
	fn authenticate(&self, _credential: Option<&str>) -> Result<Identity, AuthenticationFailed> {
		Ok(self.identity.clone())
	}
}

/// Tries each authenticator in order; the first success wins.
#[derive(Default)]
pub struct AuthenticatorChain {
	authenticators: Vec<Box<dyn HandshakeAuthenticator>>,
}

impl AuthenticatorChain {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with(mut self, authenticator: impl HandshakeAuthenticator + 'static) -> Self {
		self.authenticators.push(Box::new(authenticator));
		self
	}

	pub fn is_empty(&self) -> bool {
		self.authenticators.is_empty()
	}

	pub fn len(&self) -> usize {
		self.authenticators.len()
	}
}

impl HandshakeAuthenticator for AuthenticatorChain {
	fn authenticate(&self, credential: Option<&str>) -> Result<Identity, AuthenticationFailed> {
		let mut last = AuthenticationFailed::Missing;
		for authenticator in &self.authenticators {
			match authenticator.authenticate(credential) {
				Ok(identity) => return Ok(identity),
				// A missing credential is the least specific reason; keep a better one.
				Err(AuthenticationFailed::Missing) => {}
				Err(e) => {
					debug!(error = %e, "authenticator refused credential");
					last = e;
				}
			}
		}
		Err(last)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const SECRET: &str = "test-secret";

	fn claims(sub: &str, exp: u64) -> AuthClaims {
		AuthClaims {
			sub: sub.to_string(),
			exp,
			extra: BTreeMap::new(),
		}
	}

	#[test]
	fn signed_token_verifies_and_carries_extras() {
		let mut c = claims("alice", unix_secs_now() + 60);
		c.extra.insert("tenant".to_string(), "acme".to_string());
		let token = sign_hmac_token(&c, SECRET).unwrap();
		assert!(token.starts_with("v1."));

		let identity = HmacTokenAuthenticator::new(SecretString::new(SECRET))
			.authenticate(Some(&token))
			.unwrap();
		assert_eq!(identity.id, "alice");
		assert_eq!(identity.extra.get("tenant").map(String::as_str), Some("acme"));
	}

	#[test]
	fn wrong_secret_is_a_bad_signature() {
		let token = sign_hmac_token(&claims("alice", unix_secs_now() + 60), SECRET).unwrap();
		assert_eq!(
			verify_hmac_token(&token, "other-secret"),
			Err(AuthenticationFailed::BadSignature)
		);
	}

	#[test]
	fn expired_token_is_rejected() {
		let token = sign_hmac_token(&claims("alice", 1_000), SECRET).unwrap();
		assert_eq!(verify_hmac_token_at(&token, SECRET, 999).map(|c| c.sub), Ok("alice".to_string()));
		assert_eq!(verify_hmac_token_at(&token, SECRET, 1_000), Err(AuthenticationFailed::Expired));
	}

	#[test]
	fn malformed_tokens_are_rejected() {
		for bad in ["", "v1", "v2.a.b", "v1.***.sig", "v1.a.b.c"] {
			assert!(
				matches!(verify_hmac_token(bad, SECRET), Err(AuthenticationFailed::Malformed(_))),
				"expected malformed for {bad:?}"
			);
		}
	}

	#[test]
	fn hmac_requires_a_credential() {
		let auth = HmacTokenAuthenticator::new(SecretString::new(SECRET));
		assert_eq!(auth.authenticate(None), Err(AuthenticationFailed::Missing));
		assert_eq!(auth.authenticate(Some("  ")), Err(AuthenticationFailed::Missing));
	}

	#[test]
	fn static_token_matches_exactly() {
		let auth = StaticTokenAuthenticator::new(SecretString::new("letmein"), Identity::new("ops"));
		assert_eq!(auth.authenticate(Some("letmein")).unwrap().id, "ops");
		assert_eq!(auth.authenticate(Some("letmein2")), Err(AuthenticationFailed::Rejected));
		assert_eq!(auth.authenticate(None), Err(AuthenticationFailed::Missing));
	}

	#[test]
	fn chain_falls_through_and_reports_the_most_specific_failure() {
		let chain = AuthenticatorChain::new()
			.with(StaticTokenAuthenticator::new(SecretString::new("letmein"), Identity::new("ops")))
			.with(HmacTokenAuthenticator::new(SecretString::new(SECRET)));
		assert_eq!(chain.len(), 2);

		let token = sign_hmac_token(&claims("alice", unix_secs_now() + 60), SECRET).unwrap();
		assert_eq!(chain.authenticate(Some(&token)).unwrap().id, "alice");
		assert_eq!(chain.authenticate(Some("letmein")).unwrap().id, "ops");
		assert_eq!(chain.authenticate(None), Err(AuthenticationFailed::Missing));
		assert!(matches!(
			chain.authenticate(Some("garbage")),
			Err(AuthenticationFailed::Malformed(_))
		));
	}

	#[test]
	fn anonymous_accepts_anything_and_empty_chain_accepts_nothing() {
		let chain = AuthenticatorChain::new().with(AnonymousAuthenticator::new());
		assert_eq!(chain.authenticate(None).unwrap().id, AnonymousAuthenticator::DEFAULT_USER_ID);
		assert_eq!(AuthenticatorChain::new().authenticate(Some("x")), Err(AuthenticationFailed::Missing));
	}
}

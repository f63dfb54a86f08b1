#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use meshchat_domain::SecretString;
use sha2::Sha256;
use tracing::warn;

/// How stored passwords are compared against presented ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialScheme {
	/// Stored value is the password itself.
	#[default]
	Plaintext,
	/// Stored value is base64url-nopad HMAC-SHA256(secret, password).
	HmacSha256,
}

impl CredentialScheme {
	pub const fn as_str(self) -> &'static str {
		match self {
			CredentialScheme::Plaintext => "plaintext",
			CredentialScheme::HmacSha256 => "hmac-sha256",
		}
	}
}

impl fmt::Display for CredentialScheme {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for CredentialScheme {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"plaintext" | "plain" => Ok(CredentialScheme::Plaintext),
			"hmac-sha256" | "hmac_sha256" | "hmac" => Ok(CredentialScheme::HmacSha256),
			other => Err(anyhow!("unknown credential scheme: {other}")),
		}
	}
}

pub trait CredentialVerifier: Send + Sync + fmt::Debug {
	fn scheme(&self) -> CredentialScheme;

	/// Whether `presented` matches the `stored` credential.
	fn verify(&self, stored: &str, presented: &SecretString) -> bool;

	/// Stored form of a new password.
	fn encode(&self, password: &SecretString) -> anyhow::Result<String>;
}

/// Equality against the stored password. Insecure: passwords sit in the store as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextVerifier;

impl CredentialVerifier for PlaintextVerifier {
	fn scheme(&self) -> CredentialScheme {
		CredentialScheme::Plaintext
	}

	fn verify(&self, stored: &str, presented: &SecretString) -> bool {
		constant_time_eq(stored.as_bytes(), presented.expose().as_bytes())
	}

	fn encode(&self, password: &SecretString) -> anyhow::Result<String> {
		Ok(password.expose().to_string())
	}
}

#[derive(Debug, Clone)]
pub struct HmacSha256Verifier {
	secret: SecretString,
}

impl HmacSha256Verifier {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}

	/// Stored form of `password` under this verifier's secret.
	pub fn digest(&self, password: &str) -> Option<String> {
		sign(password.as_bytes(), self.secret.expose().as_bytes()).map(|sig| URL_SAFE_NO_PAD.encode(sig))
	}
}

impl CredentialVerifier for HmacSha256Verifier {
	fn scheme(&self) -> CredentialScheme {
		CredentialScheme::HmacSha256
	}

	fn verify(&self, stored: &str, presented: &SecretString) -> bool {
		let Ok(expected) = URL_SAFE_NO_PAD.decode(stored.trim()) else {
			return false;
		};
		let Some(actual) = sign(presented.expose().as_bytes(), self.secret.expose().as_bytes()) else {
			return false;
		};
		constant_time_eq(&expected, &actual)
	}

	fn encode(&self, password: &SecretString) -> anyhow::Result<String> {
		self.digest(password.expose())
			.ok_or_else(|| anyhow!("hmac-sha256: secret rejected as key"))
	}
}

/// Build the verifier for `scheme`. `hmac-sha256` needs a secret.
pub fn build_verifier(
	scheme: CredentialScheme,
	secret: Option<&SecretString>,
) -> anyhow::Result<Arc<dyn CredentialVerifier>> {
	match scheme {
		CredentialScheme::Plaintext => {
			warn!("credential store: plaintext password comparison is enabled; stored passwords are not hashed");
			Ok(Arc::new(PlaintextVerifier))
		}
		CredentialScheme::HmacSha256 => {
			let secret = secret
				.filter(|s| !s.expose().trim().is_empty())
				.ok_or_else(|| anyhow!("credential_scheme hmac-sha256 requires credential_hmac_secret"))?;
			Ok(Arc::new(HmacSha256Verifier::new(secret.clone())))
		}
	}
}

fn sign(payload: &[u8], secret: &[u8]) -> Option<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).ok()?;
	mac.update(payload);
	Some(mac.finalize().into_bytes().to_vec())
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

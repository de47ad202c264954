//! Credential checking for both WebSocket planes.

use std::fmt;

/// Why an auth attempt was rejected. The reason strings are part of the
/// wire contract (`auth_error.reason`, data-plane close reasons).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    InvalidToken,
    InvalidPassword,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::InvalidToken => write!(f, "invalid token"),
            AuthError::InvalidPassword => write!(f, "invalid password"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Holds the shared token and optional password every client must present.
pub struct AuthService {
    token: String,
    password: Option<String>,
}

impl AuthService {
    pub fn new(token: String, password: Option<String>) -> Self {
        Self { token, password }
    }

    pub fn requires_password(&self) -> bool {
        self.password.is_some()
    }

    /// Token is checked first; a configured password is only consulted
    /// once the token matches.
    pub fn verify(&self, token: Option<&str>, password: Option<&str>) -> Result<(), AuthError> {
        let presented = token.ok_or(AuthError::InvalidToken)?;
        if !constant_time_eq(presented.as_bytes(), self.token.as_bytes()) {
            return Err(AuthError::InvalidToken);
        }

        if let Some(expected) = &self.password {
            let presented = password.ok_or(AuthError::InvalidPassword)?;
            if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
                return Err(AuthError::InvalidPassword);
            }
        }

        Ok(())
    }
}

/// Byte comparison that does not short-circuit on the first mismatch.
/// Length is still observable; the secrets compared here are fixed-size
/// tokens and a password whose length is not the secret.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Generate a 256-bit URL-safe hex token.
pub fn generate_token() -> String {
    let mut rng = rand::rng();
    let bytes: Vec<u8> = (0..32).map(|_| rand::Rng::random(&mut rng)).collect();
    hex::encode(&bytes)
}

/// Generate a 96-bit hex client id.
pub fn generate_client_id() -> String {
    let mut rng = rand::rng();
    let bytes: Vec<u8> = (0..12).map(|_| rand::Rng::random(&mut rng)).collect();
    hex::encode(&bytes)
}

// Inline hex encoding to avoid extra dependency
mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(password: Option<&str>) -> AuthService {
        AuthService::new("secret-token".to_string(), password.map(String::from))
    }

    #[test]
    fn verify_token_only() {
        let auth = service(None);
        assert!(auth.verify(Some("secret-token"), None).is_ok());
    }

    #[test]
    fn verify_missing_token() {
        let auth = service(None);
        assert_eq!(auth.verify(None, None), Err(AuthError::InvalidToken));
    }

    #[test]
    fn verify_wrong_token() {
        let auth = service(None);
        assert_eq!(
            auth.verify(Some("nope"), None),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn verify_password_required() {
        let auth = service(Some("correct-horse"));
        assert_eq!(
            auth.verify(Some("secret-token"), None),
            Err(AuthError::InvalidPassword)
        );
        assert_eq!(
            auth.verify(Some("secret-token"), Some("wrong")),
            Err(AuthError::InvalidPassword)
        );
        assert!(auth.verify(Some("secret-token"), Some("correct-horse")).is_ok());
    }

    #[test]
    fn verify_token_checked_before_password() {
        let auth = service(Some("correct-horse"));
        assert_eq!(
            auth.verify(Some("bad"), Some("correct-horse")),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn extra_password_ignored_when_not_configured() {
        let auth = service(None);
        assert!(auth.verify(Some("secret-token"), Some("anything")).is_ok());
    }

    #[test]
    fn requires_password_flag() {
        assert!(!service(None).requires_password());
        assert!(service(Some("p")).requires_password());
    }

    #[test]
    fn error_reason_strings() {
        assert_eq!(AuthError::InvalidToken.to_string(), "invalid token");
        assert_eq!(AuthError::InvalidPassword.to_string(), "invalid password");
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn generated_token_is_256_bit_hex() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_client_ids_are_unique_hex() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert_eq!(a.len(), 24);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

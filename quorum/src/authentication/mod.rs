//! Pluggable authentication performed while a connection is set up.
//!
//! Protocol v2 and later run a SASL exchange (AUTH_RESPONSE / AUTH_CHALLENGE /
//! AUTH_SUCCESS) driven by an [`AuthenticatorSession`]. Protocol v1 sends a single
//! CREDENTIALS map instead, taken from [`AuthenticatorProvider::credentials`].

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

/// Type to represent an authentication error message.
pub type AuthError = String;

/// Trait used to represent a user-defined custom authentication.
#[async_trait]
pub trait AuthenticatorSession: Send + Sync {
    /// To handle an authentication challenge initiated by the server.
    /// The information contained in the token parameter is authentication protocol specific.
    /// It may be NULL or empty.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// To handle the success phase of exchange.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), AuthError>;
}

/// Trait used to represent a factory of [`AuthenticatorSession`] instances.
/// A new [`AuthenticatorSession`] instance will be created for each connection.
///
/// The custom authenticator can be set using `DispatcherBuilder::authenticator_provider`.
/// [`PlainTextAuthenticator`] is set by `DispatcherBuilder::user("user", "pass")`.
#[async_trait]
pub trait AuthenticatorProvider: Sync + Send {
    /// A pair of initial response and boxed [`AuthenticatorSession`]
    /// should be returned if authentication is required by the server.
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError>;

    /// The map sent in a CREDENTIALS request when the connection speaks protocol v1.
    ///
    /// Providers that cannot express themselves as a plain map return `None`, which makes
    /// authentication against v1 servers fail.
    fn credentials(&self) -> Option<HashMap<String, String>> {
        None
    }
}

struct PlainTextAuthenticatorSession;

#[async_trait]
impl AuthenticatorSession for PlainTextAuthenticatorSession {
    async fn evaluate_challenge(
        &mut self,
        _token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Err("Challenges are not expected during PlainTextAuthentication".to_string())
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Default authenticator provider that requires username and password if authentication is required.
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    /// Creates new [`PlainTextAuthenticator`] instance with provided username and password.
    pub fn new(username: String, password: String) -> Self {
        PlainTextAuthenticator { username, password }
    }

    fn initial_token(&self) -> Vec<u8> {
        let mut response = BytesMut::new();
        response.put_u8(0);
        response.put_slice(self.username.as_bytes());
        response.put_u8(0);
        response.put_slice(self.password.as_bytes());
        response.to_vec()
    }
}

#[async_trait]
impl AuthenticatorProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        Ok((
            Some(self.initial_token()),
            Box::new(PlainTextAuthenticatorSession),
        ))
    }

    fn credentials(&self) -> Option<HashMap<String, String>> {
        let mut credentials = HashMap::new();
        credentials.insert("username".to_string(), self.username.clone());
        credentials.insert("password".to_string(), self.password.clone());
        Some(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthenticatorProvider, PlainTextAuthenticator};

    #[tokio::test]
    async fn plain_text_token_is_nul_separated() {
        let provider = PlainTextAuthenticator::new("cassandra".to_string(), "pw".to_string());
        let (token, mut session) = provider
            .start_authentication_session("org.apache.cassandra.auth.PasswordAuthenticator")
            .await
            .unwrap();

        assert_eq!(token.unwrap(), b"\0cassandra\0pw".to_vec());
        assert!(session.evaluate_challenge(None).await.is_err());
        session.success(None).await.unwrap();
    }

    #[test]
    fn plain_text_offers_v1_credentials() {
        let provider = PlainTextAuthenticator::new("u".to_string(), "p".to_string());
        let credentials = provider.credentials().unwrap();
        assert_eq!(credentials["username"], "u");
        assert_eq!(credentials["password"], "p");
    }
}

use async_trait::async_trait;

use crate::ledger::CallError;
use crate::EngineError;

/// Remote authentication session. The sign-in challenge and its message
/// format belong to the implementation; the engine only asks for a token.
#[async_trait(?Send)]
pub trait Auth {
    fn is_authenticated(&self) -> bool;

    /// The session token, if signed in and not expired.
    fn token(&self) -> Option<String>;

    async fn sign_in(&self, account: &str) -> Result<(), CallError>;

    async fn sign_out(&self) -> Result<(), CallError>;
}

/// Gate for any call to the history API.
pub fn require_token(auth: &dyn Auth) -> Result<String, EngineError> {
    if !auth.is_authenticated() {
        return Err(EngineError::NotAuthenticated);
    }
    auth.token()
        .filter(|token| !token.is_empty())
        .ok_or(EngineError::NotAuthenticated)
}

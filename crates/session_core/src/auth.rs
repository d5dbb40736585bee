//! Code and password verification on top of the connection registry.
//!
//! `Unauthenticated → CodeSent → [PasswordRequired] → Authorized`. A rejected
//! attempt leaves the phase untouched so the caller can retry. The phase only
//! becomes `Authorized` once the session blob is stored and the hub attached;
//! if that bookkeeping fails after the service accepted the sign-in, the next
//! submission retries the bookkeeping without signing in again.

use shared::domain::{Phase, Phone};
use tracing::{info, warn};

use crate::{
    error::CoreError,
    registry::{Connection, ConnectionRegistry},
    remote::{SignInError, SignInOutcome},
};

impl ConnectionRegistry {
    pub async fn submit_code(&self, phone: &Phone, code: &str) -> Result<Phase, CoreError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(CoreError::InvalidInput("verification code is empty".into()));
        }

        let slot = self
            .existing_slot(phone)
            .await
            .ok_or_else(|| CoreError::no_connection(phone))?;
        let mut current = slot.lock().await;
        let connection = current
            .as_mut()
            .ok_or_else(|| CoreError::no_connection(phone))?;

        match connection.phase {
            Phase::Authorized => return Ok(Phase::Authorized),
            Phase::Unauthenticated => return Err(CoreError::no_connection(phone)),
            Phase::CodeSent | Phase::PasswordRequired => {}
        }
        if connection.sign_in_accepted {
            return self.finish_sign_in(phone, connection).await;
        }

        match connection.client.sign_in_code(phone, code).await {
            Ok(SignInOutcome::Authorized) => {
                let phase = self.finish_sign_in(phone, connection).await?;
                info!(%phone, "signed in with one-time code");
                Ok(phase)
            }
            Ok(SignInOutcome::PasswordRequired) => {
                connection.phase = Phase::PasswordRequired;
                info!(%phone, "code accepted; two-factor password required");
                Ok(Phase::PasswordRequired)
            }
            Err(SignInError::Rejected(reason)) => {
                warn!(%phone, %reason, "one-time code rejected");
                Err(CoreError::VerificationRejected(reason))
            }
            Err(SignInError::Transport(source)) => Err(CoreError::connection(phone, source)),
        }
    }

    pub async fn submit_password(&self, phone: &Phone, password: &str) -> Result<Phase, CoreError> {
        if password.is_empty() {
            return Err(CoreError::InvalidInput("password is empty".into()));
        }

        let slot = self
            .existing_slot(phone)
            .await
            .ok_or_else(|| CoreError::no_connection(phone))?;
        let mut current = slot.lock().await;
        let connection = current
            .as_mut()
            .ok_or_else(|| CoreError::no_connection(phone))?;

        if connection.phase.is_authorized() {
            return Ok(Phase::Authorized);
        }
        if connection.sign_in_accepted {
            return self.finish_sign_in(phone, connection).await;
        }

        match connection.client.sign_in_password(password).await {
            Ok(()) => {
                let phase = self.finish_sign_in(phone, connection).await?;
                info!(%phone, "signed in with two-factor password");
                Ok(phase)
            }
            Err(SignInError::Rejected(reason)) => {
                warn!(%phone, "two-factor password rejected");
                Err(CoreError::VerificationRejected(reason))
            }
            Err(SignInError::Transport(source)) => Err(CoreError::connection(phone, source)),
        }
    }

    async fn finish_sign_in(
        &self,
        phone: &Phone,
        connection: &mut Connection,
    ) -> Result<Phase, CoreError> {
        connection.sign_in_accepted = true;
        self.complete_authorization(
            phone,
            &connection.client,
            connection.generation,
            &connection.credentials,
        )
        .await?;
        connection.sign_in_accepted = false;
        connection.phase = Phase::Authorized;
        Ok(Phase::Authorized)
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;

use serde::{Deserialize, Serialize};
use statig::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    FirstFactorAccepted,
    TokenRejected,
    TokenExpired,
    TokenAccepted,
    SessionLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HandshakePhase {
    #[default]
    LoggedOut,
    AwaitingToken,
    Authenticated,
}

/// Tracks the registry login: password first, then a one-time token.
#[derive(Debug, Default)]
pub struct SecondFactorHandshake {
    phase: HandshakePhase,
    logins: u32,
    token_attempts: u32,
    rejected_tokens: u32,
}

impl SecondFactorHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    fn start_login(&mut self) {
        self.logins += 1;
        self.token_attempts = 0;
        self.phase = HandshakePhase::AwaitingToken;
        tracing::debug!(logins = self.logins, "Registry first factor accepted");
    }

    fn drop_session(&mut self) {
        self.phase = HandshakePhase::LoggedOut;
    }
}

#[state_machine(initial = "State::logged_out()")]
impl SecondFactorHandshake {
    #[state]
    fn logged_out(&mut self, event: &HandshakeEvent) -> Outcome<State> {
        match event {
            HandshakeEvent::FirstFactorAccepted => {
                self.start_login();
                Transition(State::awaiting_token())
            }
            _ => Handled,
        }
    }

    #[state]
    fn awaiting_token(&mut self, event: &HandshakeEvent) -> Outcome<State> {
        match event {
            HandshakeEvent::TokenRejected => {
                self.token_attempts += 1;
                self.rejected_tokens += 1;
                tracing::warn!(
                    attempts = self.token_attempts,
                    "Registry rejected the second-factor token"
                );
                Handled
            }
            HandshakeEvent::TokenExpired => {
                self.token_attempts += 1;
                self.drop_session();
                tracing::warn!("Registry second-factor challenge expired");
                Transition(State::logged_out())
            }
            HandshakeEvent::TokenAccepted => {
                self.token_attempts += 1;
                self.phase = HandshakePhase::Authenticated;
                tracing::info!(
                    attempts = self.token_attempts,
                    "Registry second factor accepted"
                );
                Transition(State::authenticated())
            }
            HandshakeEvent::SessionLost => {
                self.drop_session();
                Transition(State::logged_out())
            }
            HandshakeEvent::FirstFactorAccepted => {
                self.start_login();
                Handled
            }
        }
    }

    #[state]
    fn authenticated(&mut self, event: &HandshakeEvent) -> Outcome<State> {
        match event {
            HandshakeEvent::SessionLost | HandshakeEvent::TokenExpired => {
                self.drop_session();
                tracing::warn!("Registry session lost");
                Transition(State::logged_out())
            }
            HandshakeEvent::FirstFactorAccepted => {
                self.start_login();
                Transition(State::awaiting_token())
            }
            _ => Handled,
        }
    }
}

impl SecondFactorHandshake {
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == HandshakePhase::Authenticated
    }

    pub fn is_awaiting_token(&self) -> bool {
        self.phase == HandshakePhase::AwaitingToken
    }

    /// Password logins performed so far
    pub fn logins(&self) -> u32 {
        self.logins
    }

    /// Tokens tried since the last password login
    pub fn token_attempts(&self) -> u32 {
        self.token_attempts
    }

    pub fn rejected_tokens(&self) -> u32 {
        self.rejected_tokens
    }
}

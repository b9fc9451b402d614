// Sources of the registry's one-time second-factor token

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Clone, PartialEq, Eq)]
pub struct SecondFactorToken(String);

impl SecondFactorToken {
    pub fn new(token: impl Into<String>) -> Result<Self, TokenError> {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            return Err(TokenError::Empty);
        }
        Ok(Self(token))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecondFactorToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecondFactorToken(<redacted>)")
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("no further second-factor token is available")]
    Unavailable,

    #[error("second-factor token is empty")]
    Empty,

    #[error("token prompt failed: {0}")]
    Prompt(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// `attempt` starts at 1 and counts every token requested during the run
    async fn token(&self, attempt: u32) -> Result<SecondFactorToken, TokenError>;
}

/// A token known before the run started. One-time tokens cannot be reused,
/// so it is only offered once.
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: SecondFactorToken,
}

impl StaticToken {
    pub fn new(token: SecondFactorToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self, attempt: u32) -> Result<SecondFactorToken, TokenError> {
        if attempt == 1 {
            Ok(self.token.clone())
        } else {
            Err(TokenError::Unavailable)
        }
    }
}

/// Asks the operator on the terminal without echoing the input
#[derive(Debug, Clone)]
pub struct PromptToken {
    prompt: String,
}

impl Default for PromptToken {
    fn default() -> Self {
        Self {
            prompt: "Registry 2FA token: ".to_string(),
        }
    }
}

impl PromptToken {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for PromptToken {
    async fn token(&self, attempt: u32) -> Result<SecondFactorToken, TokenError> {
        let prompt = if attempt > 1 {
            format!("(attempt {}) {}", attempt, self.prompt)
        } else {
            self.prompt.clone()
        };
        let entered = tokio::task::spawn_blocking(move || rpassword::prompt_password(prompt))
            .await
            .map_err(|e| TokenError::Prompt(e.to_string()))?
            .map_err(|e| TokenError::Prompt(e.to_string()))?;
        SecondFactorToken::new(entered)
    }
}

/// Uses `--token` for the first attempt and prompts for any further one
#[derive(Debug, Clone, Default)]
pub struct PresetThenPrompt {
    preset: Option<SecondFactorToken>,
    prompt: PromptToken,
}

impl PresetThenPrompt {
    pub fn new(preset: Option<SecondFactorToken>, prompt: PromptToken) -> Self {
        Self { preset, prompt }
    }
}

#[async_trait]
impl TokenProvider for PresetThenPrompt {
    async fn token(&self, attempt: u32) -> Result<SecondFactorToken, TokenError> {
        match (&self.preset, attempt) {
            (Some(token), 1) => Ok(token.clone()),
            _ => self.prompt.token(attempt).await,
        }
    }
}

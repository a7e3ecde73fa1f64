//! Two-phase request authentication.
//!
//! The one-time token (OTT) arrives with the request parameters; the
//! token-granting token (TGT) arrives inside the encrypted request. Payload
//! received before the TGT is validated is held back and released, in order,
//! exactly once.
//!
//! Unreachable states: once [`AuthStateMachine::terminate`] has run, every
//! operation except [`AuthStateMachine::abandon`] panics, as does a second
//! `terminate`. The job drives the machine from a single task and terminates
//! it last, so reaching these is a bug in the job, not in the peer.

use crate::error::{JobError, Result};
use crate::promise::Promise;
use crate::services::TokenValidator;
use crate::transport::DecryptedChunk;
use std::sync::Arc;

/// The validated credential, handed to workers the job proxies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAndSalt {
    pub token_granting_token: Vec<u8>,
    pub salt: Vec<u8>,
}

#[derive(Debug)]
enum AuthState {
    AwaitingOneTimeToken {
        buffered: Vec<DecryptedChunk>,
    },
    AwaitingTokenGrantingToken {
        one_time_token: Vec<u8>,
        buffered: Vec<DecryptedChunk>,
    },
    Validated(TokenAndSalt),
    Abandoning,
    Terminated {
        was_abandoned: bool,
    },
}

pub struct AuthStateMachine {
    state: AuthState,
    request_bypass: bool,
    enforce: bool,
    token: Arc<Promise<TokenAndSalt>>,
}

impl AuthStateMachine {
    pub fn new(enforce: bool) -> Self {
        Self {
            state: AuthState::AwaitingOneTimeToken {
                buffered: Vec::new(),
            },
            request_bypass: false,
            enforce,
            token: Arc::new(Promise::new()),
        }
    }

    /// Handle for tasks that need the validated token.
    pub fn token(&self) -> Arc<Promise<TokenAndSalt>> {
        self.token.clone()
    }

    pub async fn await_token_and_salt(&self) -> Result<TokenAndSalt> {
        self.token.wait().await
    }

    pub fn is_validated(&self) -> bool {
        matches!(self.state, AuthState::Validated(_))
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, AuthState::Terminated { .. })
    }

    pub fn was_abandoned(&self) -> bool {
        matches!(
            self.state,
            AuthState::Abandoning
                | AuthState::Terminated {
                    was_abandoned: true
                }
        )
    }

    fn buffered_len(&self) -> usize {
        match &self.state {
            AuthState::AwaitingOneTimeToken { buffered }
            | AuthState::AwaitingTokenGrantingToken { buffered, .. } => buffered.len(),
            _ => 0,
        }
    }

    fn assert_live(&self, op: &str) {
        if self.is_terminated() {
            panic!("auth state machine: {op} after terminate");
        }
    }

    pub fn receive_request_bypass_mode(&mut self, enabled: bool) -> Result<()> {
        self.assert_live("receive_request_bypass_mode");
        if enabled && self.buffered_len() > 0 {
            return Err(JobError::ReceivedApplicationPayloadWithRequestBypassEnabled);
        }
        self.request_bypass = enabled;
        Ok(())
    }

    pub fn request_bypass(&self) -> bool {
        self.request_bypass
    }

    pub fn receive_one_time_token(&mut self, one_time_token: Vec<u8>) -> Result<()> {
        self.assert_live("receive_one_time_token");
        match std::mem::replace(&mut self.state, AuthState::Abandoning) {
            AuthState::AwaitingOneTimeToken { buffered } => {
                self.state = AuthState::AwaitingTokenGrantingToken {
                    one_time_token,
                    buffered,
                };
                Ok(())
            }
            state @ (AuthState::AwaitingTokenGrantingToken { .. } | AuthState::Validated(_)) => {
                self.state = state;
                Err(JobError::ReceivedOneTimeTokenTwice)
            }
            state => {
                self.state = state;
                Ok(())
            }
        }
    }

    /// Accept one application chunk. Returns it if it may be released now.
    pub fn receive_chunk(&mut self, chunk: DecryptedChunk) -> Result<Option<DecryptedChunk>> {
        self.assert_live("receive_chunk");
        if self.request_bypass {
            return Err(JobError::ReceivedApplicationPayloadWithRequestBypassEnabled);
        }
        match &mut self.state {
            AuthState::AwaitingOneTimeToken { buffered }
            | AuthState::AwaitingTokenGrantingToken { buffered, .. } => {
                buffered.push(chunk);
                Ok(None)
            }
            AuthState::Validated(_) => Ok(Some(chunk)),
            AuthState::Abandoning => Ok(None),
            AuthState::Terminated { .. } => unreachable!("checked by assert_live"),
        }
    }

    /// Validate the TGT and release everything buffered so far.
    pub async fn receive_auth_token(
        &mut self,
        token_granting_token: Vec<u8>,
        salt: Vec<u8>,
        validator: &dyn TokenValidator,
    ) -> Result<Vec<DecryptedChunk>> {
        self.assert_live("receive_auth_token");
        let one_time_token = match &self.state {
            AuthState::AwaitingOneTimeToken { .. } => return Err(JobError::MissingOneTimeToken),
            AuthState::AwaitingTokenGrantingToken { one_time_token, .. } => one_time_token,
            AuthState::Validated(_) => return Err(JobError::ReceivedTokenGrantingTokenTwice),
            AuthState::Abandoning => return Ok(Vec::new()),
            AuthState::Terminated { .. } => unreachable!("checked by assert_live"),
        };

        if let Err(e) = validator
            .validate(&token_granting_token, one_time_token, &salt)
            .await
        {
            if self.enforce {
                return Err(JobError::TokenValidation(format!("{e:#}")));
            }
            tracing::warn!(err = %e, "token validation failed; enforcement disabled");
        }

        let validated = TokenAndSalt {
            token_granting_token,
            salt,
        };
        match std::mem::replace(&mut self.state, AuthState::Validated(validated.clone())) {
            AuthState::AwaitingTokenGrantingToken { buffered, .. } => {
                self.token.resolve(validated);
                Ok(buffered)
            }
            _ => unreachable!("state changed while validating"),
        }
    }

    /// Fail unless both tokens were received. Called at end of request input.
    pub fn require_validated(&self) -> Result<()> {
        self.assert_live("require_validated");
        match self.state {
            AuthState::AwaitingOneTimeToken { .. } => Err(JobError::MissingOneTimeToken),
            AuthState::AwaitingTokenGrantingToken { .. } => {
                Err(JobError::MissingTokenGrantingToken)
            }
            _ => Ok(()),
        }
    }

    /// Stop authenticating. Pending and future token waiters fail.
    pub fn abandon(&mut self) {
        if self.is_terminated() {
            return;
        }
        self.state = AuthState::Abandoning;
        self.token.fail(JobError::Abandoned);
    }

    pub fn terminate(&mut self) -> Result<()> {
        let previous = std::mem::replace(
            &mut self.state,
            AuthState::Terminated {
                was_abandoned: false,
            },
        );
        self.token.fail(JobError::Abandoned);
        match previous {
            AuthState::AwaitingOneTimeToken { .. } => Err(JobError::MissingOneTimeToken),
            AuthState::AwaitingTokenGrantingToken { .. } => {
                Err(JobError::MissingTokenGrantingToken)
            }
            AuthState::Validated(_) => Ok(()),
            AuthState::Abandoning => {
                self.state = AuthState::Terminated {
                    was_abandoned: true,
                };
                Ok(())
            }
            AuthState::Terminated { .. } => panic!("auth state machine terminated twice"),
        }
    }
}

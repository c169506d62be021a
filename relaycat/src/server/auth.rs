// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Bearer-token authentication of agent streams against an external identity
//! service.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::common::protocol::headers::{
  StreamMetadata, AUTHENTICATION_TOKEN, AUTHENTICATION_TOKEN_SCHEME_PREFIX,
};

/// Verdict returned by the identity service for one token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenReview {
  pub authenticated: bool,
  /// Principal the token belongs to; for service accounts this is
  /// `system:serviceaccount:<namespace>:<name>`.
  #[serde(default)]
  pub username: String,
  /// Non-empty when the lookup itself failed.
  #[serde(default)]
  pub error: String,
}

/// Contract with the external identity service: submit a token and the
/// audiences it must be valid for, get back a [`TokenReview`].
pub trait TokenReviewer: Send + Sync {
  fn review(&self, token: &str, audiences: &[String])
    -> BoxFuture<'_, anyhow::Result<TokenReview>>;
}

/// Configuration for agent authentication; absence disables it.
pub struct AgentAuthenticationOptions {
  /// Audience the token must have been issued for.
  pub audience: String,
  /// Namespace the agent's service account must live in.
  pub agent_namespace: String,
  /// Name the agent's service account must have.
  pub agent_service_account: String,
  pub reviewer: Arc<dyn TokenReviewer>,
}

#[derive(thiserror::Error, Debug)]
pub enum AuthenticationError {
  #[error("no authentication token in stream metadata")]
  MissingToken,
  #[error("too many ({0}) authentication tokens received")]
  TooManyTokens(usize),
  #[error("received token does not use the bearer scheme")]
  BadScheme,
  #[error("identity service failed to review the token: {0}")]
  ReviewFailed(String),
  #[error("token lookup failed: {0}")]
  Lookup(String),
  #[error("token is not authenticated")]
  NotAuthenticated,
  #[error("unexpected username format {0:?}")]
  UsernameFormat(String),
  #[error("principal {0:?} is not a service account")]
  NotServiceAccount(String),
  #[error("agent from namespace {got:?}, expected {expected:?}")]
  WrongNamespace { got: String, expected: String },
  #[error("agent from service account {got:?}, expected {expected:?}")]
  WrongServiceAccount { got: String, expected: String },
}

/// Authenticates one agent stream from its metadata. Any failure fails the
/// whole stream; there is no partial access.
pub async fn authenticate_agent(
  options: &AgentAuthenticationOptions,
  metadata: &StreamMetadata,
) -> Result<(), AuthenticationError> {
  let tokens = metadata.get_all(AUTHENTICATION_TOKEN);
  let token = match tokens {
    [] => return Err(AuthenticationError::MissingToken),
    [token] => token,
    tokens => return Err(AuthenticationError::TooManyTokens(tokens.len())),
  };
  let token = token
    .strip_prefix(AUTHENTICATION_TOKEN_SCHEME_PREFIX)
    .ok_or(AuthenticationError::BadScheme)?;

  let review = options
    .reviewer
    .review(token, std::slice::from_ref(&options.audience))
    .await
    .map_err(|error| AuthenticationError::ReviewFailed(error.to_string()))?;
  validate_review(options, &review)?;
  tracing::info!("agent successfully authenticated via token");
  Ok(())
}

fn validate_review(
  options: &AgentAuthenticationOptions,
  review: &TokenReview,
) -> Result<(), AuthenticationError> {
  if !review.error.is_empty() {
    return Err(AuthenticationError::Lookup(review.error.clone()));
  }
  if !review.authenticated {
    return Err(AuthenticationError::NotAuthenticated);
  }
  let parts: Vec<&str> = review.username.split(':').collect();
  let [system, kind, namespace, account] = parts.as_slice() else {
    return Err(AuthenticationError::UsernameFormat(review.username.clone()));
  };
  if *system != "system" || *kind != "serviceaccount" {
    return Err(AuthenticationError::NotServiceAccount(
      review.username.clone(),
    ));
  }
  if *namespace != options.agent_namespace {
    return Err(AuthenticationError::WrongNamespace {
      got: namespace.to_string(),
      expected: options.agent_namespace.clone(),
    });
  }
  if *account != options.agent_service_account {
    return Err(AuthenticationError::WrongServiceAccount {
      got: account.to_string(),
      expected: options.agent_service_account.clone(),
    });
  }
  Ok(())
}

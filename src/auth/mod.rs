//! Bearer credential lifecycle: grants, persistence and single-flight refresh.

pub mod credential;
pub mod endpoint;
pub mod manager;
pub mod store;

pub use credential::{Credential, CredentialStatus, TokenResponse};
pub use endpoint::{OAuthClient, TokenEndpoint};
pub use manager::{CredentialManager, DEFAULT_REFRESH_SKEW_MINUTES};
pub use store::TokenStore;

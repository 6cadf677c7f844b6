mod session;
mod token;

pub use session::{authenticate_session, issue_session, purge_expired_sessions, revoke_session};
pub use token::{MintedToken, SecretHasher, parse_token, random_alphanumeric};

//! Authentication module for Passgate

pub mod claims;
pub mod codec;
#[cfg(test)]
mod edge_case_tests;
pub mod flow;
pub mod guard;
pub mod keys;
pub mod middleware;
pub mod password;
pub mod scope;
pub mod timebox;
pub mod two_factor;

pub use claims::{ClaimSet, ClaimSetBuilder, ClaimValue};
pub use codec::{CodecError, KeyRole, TokenCodec};
pub use flow::{AuthEvents, AuthenticationFlow, AuthenticationResponse, ChallengeDispatcher};
pub use guard::{CredentialGuard, Credentials, LoginRequest};
pub use keys::{
    generate_rsa_key_pair, FsKeyStore, KeyGenError, KeyStore, MemoryKeyStore, RsaKeyLength,
};
pub use middleware::{
    extract_bearer_token, guest_only, require_auth, require_full_access,
    require_two_factor_challenge, AuthUser,
};
pub use password::{hash_password, verify_password};
pub use scope::{Scope, ScopeError, ScopeSet};
pub use timebox::{EarlyReturn, Timebox};
pub use two_factor::{generate_secret, SecondFactorService, TwoFactorError, TwoFactorMethod};

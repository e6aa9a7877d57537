//! Credential primitives for Gatehouse.
//!
//! Everything in this crate is free of I/O and clocks: callers pass the
//! current time in, which keeps the validation logic deterministic.

pub mod api;
pub mod duration;
pub mod error;
pub mod identity;
pub mod replay;
pub mod signed_value;

pub use api::{
    ApiCredential, SIGNATURE_METHOD, SUPPORTED_API_VERSION, generate_api_key, sign_api_request,
};
pub use duration::{DurationParseError, parse_duration};
pub use error::{AuthError, AuthResponse, ErrorResponse};
pub use identity::{ANONYMOUS, AUTHENTICATED, Identity, generate_session_id};
pub use replay::SignatureRecord;
pub use signed_value::{SignedValueError, create_signed_value, decode_signed_value};

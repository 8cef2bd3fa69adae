mod credential_codec_jwt;
mod credential_hasher_argon2;
mod session_service_impl;

pub use credential_codec_jwt::*;
pub use credential_hasher_argon2::*;
pub use session_service_impl::*;

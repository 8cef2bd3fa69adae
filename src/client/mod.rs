//! Client side of the session lifecycle: keeps a token pair, attaches the
//! access token to calls, and funnels concurrent refreshes into one.

mod coordinator;
mod error;
mod http;
mod vault;

pub use coordinator::*;
pub use error::*;
pub use http::*;
pub use vault::*;

mod clock;
mod principal;
mod refresh_session;

pub use clock::*;
pub use principal::*;
pub use refresh_session::*;

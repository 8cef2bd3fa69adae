// store

mod refresh_session_store;

pub use refresh_session_store::*;

// repo

mod principal_repo;

pub use principal_repo::*;

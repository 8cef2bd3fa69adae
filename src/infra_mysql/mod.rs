mod principal_repo_mysql;
mod refresh_session_store_mysql;

pub use principal_repo_mysql::*;
pub use refresh_session_store_mysql::*;

mod util;

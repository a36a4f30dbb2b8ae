mod indexer;
mod projects;
mod reader;
mod store;
mod watch;

pub use indexer::*;
pub use projects::*;
pub use reader::*;
pub use store::*;
pub use watch::*;

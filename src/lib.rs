#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod config;
pub mod coordinator;
pub mod game_info;
pub mod gamelist;
pub mod packet;

pub use config::CoordinatorConfig;
pub use coordinator::{CoordinatorClient, CoordinatorError, JoinError, ServerGameType};
pub use game_info::{GameInfo, GameInfoProvider};
pub use gamelist::{GameList, GameListEntry};

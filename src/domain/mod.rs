pub mod lead;
pub mod phone;
pub mod search_task;

pub use lead::*;
pub use search_task::*;

pub mod lead_db;
pub mod lead_file;

pub use lead_db::PgLeadStore;
pub use lead_file::JsonLeadStore;

// Repository layer for database operations

pub mod binding;
pub mod catalog;
pub mod execution;
pub mod queries;
pub mod sync_record;

pub use binding::BindingRepository;
pub use catalog::CatalogRepository;
pub use execution::ExecutionRepository;
pub use sync_record::SyncRecordRepository;

// Pipeline storage: family tables on disk and the combine stage

pub mod combine;
pub mod table;

pub use combine::{combine, WideTable};
pub use table::{Table, TableSchema, TableStore, WriteSummary};

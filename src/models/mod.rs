pub mod enums;
pub mod structs;

pub use enums::{ExplainMode, ExportFormat};
pub use structs::{
    CellValue, ConnectionInfo, ConnectionTarget, HistoryEntry, HistoryPage, QueryResult,
};

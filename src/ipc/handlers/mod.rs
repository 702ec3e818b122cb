pub mod backup_exchange;
pub mod calc;
pub mod core;
pub mod grades;
pub mod import_consolidado;
pub mod reports;
pub mod sections;
pub mod students;

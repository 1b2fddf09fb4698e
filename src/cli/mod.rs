pub mod provision;
pub mod report;

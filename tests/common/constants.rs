//! Names shared by every integration test area.

pub const PREFIX: &str = "mediarelay";
pub const DATA_CENTER: &str = "EU-RO-1";

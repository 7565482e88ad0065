// Library module for hashlookup
// Re-exports modules for use in integration tests and the command line tool

pub mod hash;
pub mod ingest;

// Test binary entry point for hash set tests
// All hash set and classification tests organized here

mod common;

mod config_tests;
mod hash_set_tests;
mod indexer_tests;
mod parser_tests;

// Test modules for Peerstate
// Each module holds the unit tests of the corresponding source module

mod activity_tests;
mod chat_tests;
mod crypto_tests;
mod mutation_tests;

//! In-memory fakes of every external collaborator trait, used by this crate's own unit tests
//! and by the integration tests in `tests/`. Gated behind `cfg(test)` (so the crate's own
//! `#[cfg(test)]` modules can use them without callers opting in) or the `testing` feature (so
//! downstream integration tests can too). Not a production backend.

pub mod fake_auth;
pub mod fake_rpc;
pub mod fake_store;

pub use fake_auth::{FakeAuthenticator, FakeKeychain, FakeSyncStateStorage};
pub use fake_rpc::{ErrorSpec, FakeNoteStore, FakeNoteStoreClientFactory, FakeUserStore, ScriptedChunk};
pub use fake_store::FakeStore;

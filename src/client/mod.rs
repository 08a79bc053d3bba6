//! Keystone's client functionality modules.

mod apistub;

pub use apistub::ClientApiStub;

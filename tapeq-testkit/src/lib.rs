//! Test doubles and fixtures for tapeq.
//!
//! - [`MockCatalogue`]: disk systems and tape file locations set by the test
//! - [`StaticFreeSpace`]: fixed free-space readings, with query counting
//! - [`FaultInjectingBackend`]: wraps a backend and fails chosen operations
//! - [`request_fixture`] and friends: retrieve requests with sensible defaults

mod backend;
mod catalogue;
mod free_space;
mod job;

pub use backend::{FaultInjectingBackend, Operation};
pub use catalogue::MockCatalogue;
pub use free_space::StaticFreeSpace;
pub use job::{TestEnv, disk_system, mount_info, request_fixture, requests_on_disk_system};

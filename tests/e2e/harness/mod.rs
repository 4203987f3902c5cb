//! E2E test harness for texd.
//!
//! Some helpers are only used by a subset of scenarios.

#![allow(dead_code)]

pub mod fixture;
pub mod toolchain;
pub mod workspace;

pub use fixture::{git_available, GitFixture};
pub use toolchain::PaperToolchain;
pub use workspace::TestWorkspace;

/// Returns from the calling test when git is not installed.
#[macro_export]
macro_rules! require_git {
    () => {
        if !$crate::harness::git_available() {
            eprintln!("git not available, skipping");
            return;
        }
    };
}

//! `utils` is intended to be a place to put code that is shared
//! between the other crates in this repository.

// byte positions in the append-only commit log
pub mod offset;

// logging setup for binaries and tests
pub mod logging;

/// Expose the git revision this binary was built from as a constant.
///
/// Requires the calling crate to depend on `git-version`. The fallback kicks
/// in for builds from an exported source tree.
#[macro_export]
macro_rules! project_git_version {
    ($const_identifier:ident) => {
        const $const_identifier: &::core::primitive::str = ::git_version::git_version! {
            prefix = "git:",
            fallback = "unknown",
            args = ["--abbrev=40", "--always", "--dirty=-modified"]
        };
    };
}

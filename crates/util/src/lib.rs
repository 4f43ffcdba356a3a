//! Small helpers shared by every rampart crate.

/// Declares a module and re-exports everything in it.
#[macro_export]
macro_rules! glob_export {
    ($module: ident) => {
        mod $module;
        pub use $module::*;
    };
}

pub mod join;
pub mod time;

pub use join::Joinable;

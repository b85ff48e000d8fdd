pub mod callback;
pub mod color;
pub mod common;
pub mod expr;
pub mod lower;
pub mod measure;
pub mod pprint;
pub mod record;
pub mod runtime;
pub mod schedule;
pub mod session;
pub mod space;
pub mod target;
pub mod task;
pub mod template;
pub mod tensor;
pub mod tuner;
pub mod utils;
#[cfg(feature = "verification")]
pub mod verification;
pub mod workloads;

// Re-exported so callers can build a `Shape` without naming the dependency.
pub use smallvec;

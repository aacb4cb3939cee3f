mod error;
mod record;

pub use error::{OscarError, Result};
pub use record::Versioned;

/// Wall-clock time as nanoseconds since the Unix epoch. The core never
/// calls `SystemTime::now()` itself outside of the adapters/runner that
/// embed it. This is a plain alias, not a distinct type — it documents
/// intent at call sites but doesn't stop a bare `i64` or a `DbTime` from
/// being passed where a `WallNanos` is expected.
pub type WallNanos = i64;

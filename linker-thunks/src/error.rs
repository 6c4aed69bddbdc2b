pub type Error = anyhow::Error;

/// Defaults the success type to `()` so that functions that only fail can be declared as
/// returning bare `Result`.
pub type Result<T = (), E = Error> = core::result::Result<T, E>;

//! Application-level error classification for the command line.

use std::process::{ExitCode, Termination};

/// Failure classes of the command line interface, mapped to process
/// exit codes (0 ok, 2 input error, 3 internal error).
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    /// Unreadable or malformed inputs, unknown query terms.
    #[error("input error: {0:#}")]
    Input(#[source] anyhow::Error),
    /// Failures inside the scoring core.
    #[error("internal error: {0:#}")]
    Internal(#[source] anyhow::Error),
}

impl Termination for AppError {
    fn report(self) -> ExitCode {
        match self {
            AppError::Input(_) => ExitCode::from(2),
            AppError::Internal(_) => ExitCode::from(3),
        }
    }
}

#[cfg(test)]
mod test {
    use std::process::Termination;

    use super::AppError;

    #[test]
    fn exit_codes() {
        let input = AppError::Input(anyhow::anyhow!("no such file"));
        assert_eq!(
            format!("{:?}", input.report()),
            format!("{:?}", std::process::ExitCode::from(2))
        );

        let internal = AppError::Internal(anyhow::anyhow!("boom"));
        assert_eq!(
            format!("{:?}", internal.report()),
            format!("{:?}", std::process::ExitCode::from(3))
        );
    }
}

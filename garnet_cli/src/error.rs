//! Exit codes and host-side error formatting.

use std::process::ExitCode;

/// Successful execution.
pub const EXIT_SUCCESS: u8 = 0;
/// Uncaught top-level exception.
pub const EXIT_ERROR: u8 = 1;
/// Command-line usage error (bad flags).
pub const EXIT_USAGE_ERROR: u8 = 2;

/// Report a usage error on stderr and return the matching exit code.
pub fn usage_error(error: &crate::args::UsageError) -> ExitCode {
    eprintln!("garnet: {error}");
    eprintln!("{}", crate::args::HELP);
    ExitCode::from(EXIT_USAGE_ERROR)
}

/// Map a runtime exit status (from `SystemExit` or the top-level handler)
/// to a process exit code.
pub fn exit_code_from_status(status: i32) -> ExitCode {
    ExitCode::from(status.clamp(0, 255) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_clamping() {
        assert_eq!(exit_code_from_status(0), ExitCode::from(0));
        assert_eq!(exit_code_from_status(3), ExitCode::from(3));
        assert_eq!(exit_code_from_status(-1), ExitCode::from(0));
        assert_eq!(exit_code_from_status(1000), ExitCode::from(255));
    }
}

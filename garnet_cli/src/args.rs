//! Command-line argument scanning.
//!
//! Hand-rolled for zero-overhead startup. The host has no script
//! front-end; flags select a mode and everything after them lands in the
//! runtime's `ARGV`.

use std::ffi::OsString;

/// What the host should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Boot the runtime and run the embedded program.
    Run,
    /// Boot the runtime and run the built-in self-test program.
    SelfTest,
    /// Print version and exit.
    PrintVersion,
    /// Print help and exit.
    PrintHelp,
}

/// Parsed command line.
#[derive(Debug)]
pub struct GarnetArgs {
    /// Selected mode.
    pub mode: ExecutionMode,
    /// Dump collection counters to stderr.
    pub gc_stats: bool,
    /// Positional arguments, exposed as `ARGV`.
    pub positional: Vec<String>,
}

/// A flag the scanner did not recognize.
#[derive(Debug)]
pub struct UsageError {
    /// The offending argument.
    pub flag: String,
}

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown option: {}", self.flag)
    }
}

/// Scan the raw arguments (program name first).
pub fn parse(raw: impl Iterator<Item = OsString>) -> Result<GarnetArgs, UsageError> {
    let mut args = GarnetArgs {
        mode: ExecutionMode::Run,
        gc_stats: false,
        positional: Vec::new(),
    };

    let mut saw_separator = false;
    for arg in raw.skip(1) {
        let text = arg.to_string_lossy().into_owned();
        if saw_separator || !text.starts_with('-') {
            args.positional.push(text);
            continue;
        }
        match text.as_str() {
            "--" => saw_separator = true,
            "-h" | "--help" => args.mode = ExecutionMode::PrintHelp,
            "-V" | "--version" => args.mode = ExecutionMode::PrintVersion,
            "--selftest" => args.mode = ExecutionMode::SelfTest,
            "--gc-stats" => args.gc_stats = true,
            _ => return Err(UsageError { flag: text }),
        }
    }
    Ok(args)
}

/// Help text.
pub const HELP: &str = "\
usage: garnet [options] [args...]

options:
  -h, --help      print this help and exit
  -V, --version   print the version and exit
  --selftest      run the built-in runtime self-test
  --gc-stats      dump collection counters to stderr
  --              everything after goes to ARGV verbatim
";

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_strs(args: &[&str]) -> Result<GarnetArgs, UsageError> {
        parse(
            std::iter::once(OsString::from("garnet"))
                .chain(args.iter().map(OsString::from)),
        )
    }

    #[test]
    fn test_default_mode() {
        let args = parse_strs(&[]).unwrap();
        assert_eq!(args.mode, ExecutionMode::Run);
        assert!(args.positional.is_empty());
        assert!(!args.gc_stats);
    }

    #[test]
    fn test_positional_args() {
        let args = parse_strs(&["one", "two"]).unwrap();
        assert_eq!(args.positional, vec!["one", "two"]);
    }

    #[test]
    fn test_flags() {
        assert_eq!(parse_strs(&["-V"]).unwrap().mode, ExecutionMode::PrintVersion);
        assert_eq!(parse_strs(&["--help"]).unwrap().mode, ExecutionMode::PrintHelp);
        assert_eq!(parse_strs(&["--selftest"]).unwrap().mode, ExecutionMode::SelfTest);
        assert!(parse_strs(&["--gc-stats"]).unwrap().gc_stats);
    }

    #[test]
    fn test_separator_stops_flag_scanning() {
        let args = parse_strs(&["--", "--not-a-flag"]).unwrap();
        assert_eq!(args.positional, vec!["--not-a-flag"]);
    }

    #[test]
    fn test_unknown_flag_is_usage_error() {
        assert!(parse_strs(&["--bogus"]).is_err());
    }
}

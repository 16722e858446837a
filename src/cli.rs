use crate::error::{Result, SubprocessError};
use crate::redirect::Redirect;
use crate::request::{Command, SpawnRequest};
use clap::Parser;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::str::FromStr;

/// subproc - run a command with redirected standard streams
///
/// Each stream can be inherited, connected to a pipe that subproc drains, merged
/// into stdout (stderr only), or bound to a file.
#[derive(Parser, Debug)]
#[command(
    name = "subproc",
    version = "0.1.0",
    about = "Run a command with redirected standard streams",
    long_about = "Run a command with each standard stream inherited, piped through subproc,\n\
                  merged into stdout, or bound to a file, and exit with its status.\n\
                  A single COMMAND word is run by /bin/sh -c; several are executed directly."
)]
pub struct Cli {
    /// Where the command's stdin comes from: inherit, pipe, or a file
    #[arg(short = 'i', long = "stdin", value_name = "spec", default_value = "inherit")]
    pub stdin: StreamSpec,

    /// Where the command's stdout goes: inherit, pipe, or a file
    #[arg(short = 'o', long = "stdout", value_name = "spec", default_value = "inherit")]
    pub stdout: StreamSpec,

    /// Where the command's stderr goes: inherit, pipe, stdout, or a file
    #[arg(short = 'e', long = "stderr", value_name = "spec", default_value = "inherit")]
    pub stderr: StreamSpec,

    /// Append to output files instead of truncating them
    #[arg(long = "append")]
    pub append: bool,

    /// Text fed to the command's stdin (implies --stdin pipe)
    #[arg(long = "input", value_name = "text")]
    pub input: Option<String>,

    /// Working directory for the command
    #[arg(short = 'C', long = "cwd", value_name = "dir")]
    pub cwd: Option<PathBuf>,

    /// Set an environment variable for the command
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Start the command with an empty environment
    #[arg(long = "env-clear")]
    pub env_clear: bool,

    /// Program to execute instead of the one named by the command
    #[arg(long = "executable", value_name = "path")]
    pub executable: Option<PathBuf>,

    /// Close inherited descriptors above stderr in the command
    #[arg(long = "close-fds")]
    pub close_fds: bool,

    /// Report a failure if the command does not exit successfully
    #[arg(long = "check")]
    pub check: bool,

    /// Be verbose about what you're doing
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Command and its arguments to execute
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// A stream option as given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSpec {
    Inherit,
    Pipe,
    Stdout,
    File(PathBuf),
}

impl FromStr for StreamSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "" => Err("empty stream spec".to_string()),
            "inherit" => Ok(StreamSpec::Inherit),
            "pipe" => Ok(StreamSpec::Pipe),
            "stdout" => Ok(StreamSpec::Stdout),
            path => Ok(StreamSpec::File(PathBuf::from(path))),
        }
    }
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Validate the parsed arguments
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(SubprocessError::InvalidConfig(
                "No command specified".to_string(),
            ));
        }

        if self.input.is_some() && !matches!(self.stdin, StreamSpec::Inherit | StreamSpec::Pipe) {
            return Err(SubprocessError::InvalidConfig(
                "--input needs the stdin pipe".to_string(),
            ));
        }

        for entry in &self.env {
            if split_env(entry).is_none() {
                return Err(SubprocessError::InvalidConfig(format!(
                    "expected KEY=VALUE, got {:?}",
                    entry
                )));
            }
        }

        if let Some(ref dir) = self.cwd {
            if !dir.is_dir() {
                return Err(SubprocessError::InvalidConfig(format!(
                    "Not a directory: {}",
                    dir.display()
                )));
            }
        }

        Ok(())
    }

    /// Default log filter for the verbosity level
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    }

    /// One word runs through the shell, several are executed directly
    pub fn to_command(&self) -> Command {
        match self.command.as_slice() {
            [line] => Command::Line(line.clone()),
            argv => Command::Argv(argv.to_vec()),
        }
    }

    fn redirect(&self, spec: &StreamSpec, output: bool) -> Result<Redirect> {
        Ok(match spec {
            StreamSpec::Inherit => Redirect::Inherit,
            StreamSpec::Pipe => Redirect::Pipe,
            StreamSpec::Stdout => Redirect::Stdout,
            StreamSpec::File(path) => {
                let file = if output {
                    OpenOptions::new()
                        .write(true)
                        .create(true)
                        .append(self.append)
                        .truncate(!self.append)
                        .open(path)?
                } else {
                    File::open(path)?
                };
                Redirect::from(file)
            }
        })
    }

    /// Build the spawn request described by the arguments
    pub fn build_request(&self) -> Result<SpawnRequest> {
        let stdin = if self.input.is_some() {
            Redirect::Pipe
        } else {
            self.redirect(&self.stdin, false)?
        };

        let mut request = SpawnRequest::new(self.to_command())
            .stdin(stdin)
            .stdout(self.redirect(&self.stdout, true)?)
            .stderr(self.redirect(&self.stderr, true)?)
            .close_fds(self.close_fds);

        if let Some(ref dir) = self.cwd {
            request = request.cwd(dir);
        }
        if let Some(ref exe) = self.executable {
            request = request.executable(exe);
        }
        if self.env_clear {
            request = request.env_clear();
        }
        for (key, value) in self.env.iter().filter_map(|e| split_env(e)) {
            request = request.env(key, value);
        }

        Ok(request)
    }
}

fn split_env(entry: &str) -> Option<(&str, &str)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Some((key, value)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_stream_specs() {
        let cli = parse(&["subproc", "-o", "pipe", "-e", "stdout", "-i", "/tmp/in", "cat"]);
        assert_eq!(cli.stdout, StreamSpec::Pipe);
        assert_eq!(cli.stderr, StreamSpec::Stdout);
        assert_eq!(cli.stdin, StreamSpec::File(PathBuf::from("/tmp/in")));
        assert_eq!(cli.to_command(), Command::Line("cat".to_string()));
    }

    #[test]
    fn test_argv_command_keeps_hyphens() {
        let cli = parse(&["subproc", "--", "ls", "-l", "-a"]);
        assert_eq!(
            cli.to_command(),
            Command::Argv(vec!["ls".into(), "-l".into(), "-a".into()])
        );
    }

    #[test]
    fn test_validate_env_entries() {
        let cli = parse(&["subproc", "--env", "NOVALUE", "true"]);
        assert!(matches!(
            cli.validate(),
            Err(SubprocessError::InvalidConfig(_))
        ));

        let cli = parse(&["subproc", "--env", "A=b=c", "true"]);
        assert!(cli.validate().is_ok());
        assert_eq!(split_env("A=b=c"), Some(("A", "b=c")));
    }

    #[test]
    fn test_input_conflicts_with_file_stdin() {
        let cli = parse(&["subproc", "-i", "/etc/hostname", "--input", "x", "cat"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(parse(&["subproc", "true"]).log_level(), "warn");
        assert_eq!(parse(&["subproc", "-v", "true"]).log_level(), "debug");
        assert_eq!(parse(&["subproc", "-vv", "true"]).log_level(), "trace");
    }

    #[test]
    fn test_build_request_with_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let out_arg = out.to_str().unwrap();
        let cli = parse(&["subproc", "-o", out_arg, "echo", "hello"]);
        let status = cli.build_request().unwrap().call().unwrap();
        assert!(status.success());
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello\n");
    }
}

//! Process creation: build a child plan before forking, then fork and exec.
//!
//! Everything that allocates happens in [`ChildPlan::new`]. After `fork` the
//! child only runs async-signal-safe calls until it either replaces its image
//! or `_exit`s.

use crate::error::{Result, ReturnCode, SubprocessError};
use crate::pipe::{ChildStderr, ChildStdin, ChildStdout, Pipe};
use crate::process::Process;
use crate::redirect::{RedirectionAction, Slot};
use crate::request::ResolvedRequest;
use nix::sys::signal::{sigprocmask, signal, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::{fork, ForkResult};
use std::ffi::{CString, OsStr, OsString};
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

const DEFAULT_PATH: &str = "/bin:/usr/bin";

/// Where a redirected slot gets its descriptor from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    /// A descriptor prepared by the parent (pipe child end or bound handle)
    Fd(RawFd),
    /// Another slot of the child, after it has been rewired
    Slot(Slot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FdMove {
    source: Source,
    target: Slot,
}

/// Everything the child needs, prepared in the parent
struct ChildPlan {
    /// Applied in stdin, stdout, stderr order
    moves: [Option<FdMove>; 3],
    candidates: Vec<CString>,
    // Storage behind argv_ptrs / envp_ptrs
    #[allow(dead_code)]
    argv: Vec<CString>,
    #[allow(dead_code)]
    envp: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
    cwd: Option<CString>,
    close_fds: bool,
    not_found_msg: Vec<u8>,
    cannot_exec_msg: Vec<u8>,
    setup_failed_msg: Vec<u8>,
}

fn to_cstring(bytes: &[u8], what: &str) -> Result<CString> {
    CString::new(bytes).map_err(|_| {
        SubprocessError::InvalidConfig(format!(
            "{} contains a NUL byte: {:?}",
            what,
            String::from_utf8_lossy(bytes)
        ))
    })
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Inherited environment with the request's overrides applied
fn build_environment(env: &[(String, String)], env_clear: bool) -> Result<Vec<(OsString, OsString)>> {
    let mut vars: Vec<(OsString, OsString)> = if env_clear {
        Vec::new()
    } else {
        std::env::vars_os().collect()
    };

    for (key, value) in env {
        if key.is_empty() || key.contains('=') {
            return Err(SubprocessError::InvalidConfig(format!(
                "invalid environment variable name: {:?}",
                key
            )));
        }
        vars.retain(|(k, _)| k.as_os_str() != OsStr::new(key));
        vars.push((OsString::from(key), OsString::from(value)));
    }

    Ok(vars)
}

/// Paths to try for `program`, in order
fn exec_candidates(program: &Path, search_path: Option<&OsStr>) -> Vec<PathBuf> {
    if program.as_os_str().as_bytes().contains(&b'/') {
        return vec![program.to_path_buf()];
    }

    let search_path = search_path.unwrap_or_else(|| OsStr::new(DEFAULT_PATH));
    search_path
        .as_bytes()
        .split(|&b| b == b':')
        .map(|dir| {
            if dir.is_empty() {
                PathBuf::from(".").join(program)
            } else {
                Path::new(OsStr::from_bytes(dir)).join(program)
            }
        })
        .collect()
}

impl ChildPlan {
    fn new(
        program: &Path,
        argv: &[String],
        cwd: Option<&Path>,
        env: &[(String, String)],
        env_clear: bool,
        close_fds: bool,
        moves: [Option<FdMove>; 3],
    ) -> Result<Self> {
        let vars = build_environment(env, env_clear)?;
        let search_path = vars
            .iter()
            .find(|(k, _)| k.as_os_str() == OsStr::new("PATH"))
            .map(|(_, v)| v.as_os_str());

        let candidates = exec_candidates(program, search_path)
            .into_iter()
            .map(|p| to_cstring(p.as_os_str().as_bytes(), "program path"))
            .collect::<Result<Vec<_>>>()?;

        let argv = argv
            .iter()
            .map(|arg| to_cstring(arg.as_bytes(), "argument"))
            .collect::<Result<Vec<_>>>()?;

        let envp = vars
            .into_iter()
            .map(|(k, v)| {
                let mut entry = k.into_vec();
                entry.push(b'=');
                entry.extend(v.into_vec());
                to_cstring(&entry, "environment entry")
            })
            .collect::<Result<Vec<_>>>()?;

        let cwd = cwd
            .map(|dir| to_cstring(dir.as_os_str().as_bytes(), "working directory"))
            .transpose()?;

        let shown = program.display();
        let not_found_msg = format!("subproc: {}: command not found\n", shown).into_bytes();
        let cannot_exec_msg = format!("subproc: {}: cannot execute\n", shown).into_bytes();
        let setup_failed_msg = match &cwd {
            Some(dir) => format!(
                "subproc: {}: failed to prepare child (cwd {})\n",
                shown,
                dir.to_string_lossy()
            ),
            None => format!("subproc: {}: failed to prepare child\n", shown),
        }
        .into_bytes();

        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);

        Ok(Self {
            moves,
            candidates,
            argv,
            envp,
            argv_ptrs,
            envp_ptrs,
            cwd,
            close_fds,
            not_found_msg,
            cannot_exec_msg,
            setup_failed_msg,
        })
    }

    /// Runs in the forked child. Never returns.
    ///
    /// # Safety
    ///
    /// Must only be called in the child right after `fork`.
    unsafe fn exec_child(&self, old_mask: &SigSet) -> ! {
        // The Rust runtime ignores SIGPIPE; programs expect the default.
        let _ = signal(Signal::SIGPIPE, SigHandler::SigDfl);
        let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(old_mask), None);

        if self.apply_moves().is_err() {
            self.fail(&self.setup_failed_msg, ReturnCode::CannotExecute);
        }

        if let Some(dir) = &self.cwd {
            if libc::chdir(dir.as_ptr()) != 0 {
                self.fail(&self.setup_failed_msg, ReturnCode::CannotExecute);
            }
        }

        if self.close_fds {
            close_descriptors_from(3);
        }

        let mut code = ReturnCode::NotFound;
        for candidate in &self.candidates {
            libc::execve(
                candidate.as_ptr(),
                self.argv_ptrs.as_ptr(),
                self.envp_ptrs.as_ptr(),
            );
            match nix::errno::Errno::last() {
                nix::errno::Errno::ENOENT | nix::errno::Errno::ENOTDIR => continue,
                nix::errno::Errno::EACCES => {
                    code = ReturnCode::CannotExecute;
                    continue;
                }
                _ => {
                    code = ReturnCode::CannotExecute;
                    break;
                }
            }
        }

        let msg = match code {
            ReturnCode::NotFound => &self.not_found_msg,
            _ => &self.cannot_exec_msg,
        };
        self.fail(msg, code)
    }

    /// Rewire the standard slots. Sources sitting on a low descriptor are
    /// first lifted above stderr so an earlier `dup2` cannot clobber them.
    unsafe fn apply_moves(&self) -> std::result::Result<(), ()> {
        let mut moves = self.moves;

        for mv in moves.iter_mut().flatten() {
            if let Source::Fd(fd) = mv.source {
                if fd <= libc::STDERR_FILENO && fd != mv.target.fd() {
                    let lifted = libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 3);
                    if lifted < 0 {
                        return Err(());
                    }
                    mv.source = Source::Fd(lifted);
                }
            }
        }

        for mv in moves.iter().flatten() {
            let source = match mv.source {
                Source::Fd(fd) => fd,
                Source::Slot(slot) => slot.fd(),
            };
            let target = mv.target.fd();
            if source == target {
                // dup2 onto itself keeps FD_CLOEXEC; clear it by hand.
                if libc::fcntl(target, libc::F_SETFD, 0) < 0 {
                    return Err(());
                }
                continue;
            }
            loop {
                if libc::dup2(source, target) >= 0 {
                    break;
                }
                if nix::errno::Errno::last() != nix::errno::Errno::EINTR {
                    return Err(());
                }
            }
        }

        // Close the originals; parent ends of our pipes are close-on-exec.
        for mv in moves.iter().flatten() {
            if let Source::Fd(fd) = mv.source {
                if fd > libc::STDERR_FILENO {
                    libc::close(fd);
                }
            }
        }

        Ok(())
    }

    unsafe fn fail(&self, msg: &[u8], code: ReturnCode) -> ! {
        libc::write(
            libc::STDERR_FILENO,
            msg.as_ptr() as *const libc::c_void,
            msg.len(),
        );
        libc::_exit(code.as_exit_code())
    }
}

#[cfg(target_os = "linux")]
unsafe fn close_descriptors_from(lowest: RawFd) {
    let done = libc::syscall(libc::SYS_close_range, lowest as libc::c_uint, libc::c_uint::MAX, 0);
    if done != 0 {
        close_descriptors_slow(lowest);
    }
}

#[cfg(not(target_os = "linux"))]
unsafe fn close_descriptors_from(lowest: RawFd) {
    close_descriptors_slow(lowest);
}

unsafe fn close_descriptors_slow(lowest: RawFd) {
    let limit = libc::sysconf(libc::_SC_OPEN_MAX);
    let limit: RawFd = if limit <= 0 { 1024 } else { limit.min(65536) as RawFd };
    for fd in lowest..limit {
        libc::close(fd);
    }
}

/// Parent-side bookkeeping while preparing redirections
#[derive(Default)]
struct Wiring {
    moves: [Option<FdMove>; 3],
    /// Descriptors that belong to the child; closed in the parent after fork
    child_ends: Vec<OwnedFd>,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
    stdin_bound: bool,
}

impl Wiring {
    fn add(&mut self, slot: Slot, action: RedirectionAction) -> Result<()> {
        let index = slot.fd() as usize;
        match action {
            RedirectionAction::Inherit => {}
            RedirectionAction::CreatePipe => {
                let pipe = Pipe::new(slot.direction())?;
                self.moves[index] = Some(FdMove {
                    source: Source::Fd(pipe.child.as_raw_fd()),
                    target: slot,
                });
                self.child_ends.push(pipe.child);
                let parent = Some(pipe.parent);
                match slot {
                    Slot::Stdin => self.stdin = parent,
                    Slot::Stdout => self.stdout = parent,
                    Slot::Stderr => self.stderr = parent,
                }
            }
            RedirectionAction::MergeWithStdout => {
                self.moves[index] = Some(FdMove {
                    source: Source::Slot(Slot::Stdout),
                    target: slot,
                });
            }
            RedirectionAction::BindExternalHandle(fd) => {
                self.moves[index] = Some(FdMove {
                    source: Source::Fd(fd.as_raw_fd()),
                    target: slot,
                });
                self.child_ends.push(fd);
                self.stdin_bound |= slot == Slot::Stdin;
            }
        }
        Ok(())
    }
}

/// Create pipes, fork, and exec the resolved request in the child
pub(crate) fn spawn(request: ResolvedRequest) -> Result<Process> {
    let ResolvedRequest {
        program,
        argv,
        streams,
        cwd,
        env,
        env_clear,
        close_fds,
    } = request;

    // Buffered output must not be duplicated into the child.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    let mut wiring = Wiring::default();
    wiring.add(Slot::Stdin, streams.stdin)?;
    wiring.add(Slot::Stdout, streams.stdout)?;
    wiring.add(Slot::Stderr, streams.stderr)?;

    let plan = ChildPlan::new(
        &program,
        &argv,
        cwd.as_deref(),
        &env,
        env_clear,
        close_fds,
        wiring.moves,
    )?;
    tracing::trace!(moves = ?plan.moves, argv = ?argv, "prepared child plan");

    // Block signals across fork so no handler runs in the child before exec
    let mut old_mask = SigSet::empty();
    sigprocmask(
        SigmaskHow::SIG_SETMASK,
        Some(&SigSet::all()),
        Some(&mut old_mask),
    )?;

    // SAFETY: the child branch only calls async-signal-safe functions on data
    // prepared above, then execs or _exits.
    let forked = unsafe { fork() };

    match forked {
        Ok(ForkResult::Child) => unsafe { plan.exec_child(&old_mask) },
        Ok(ForkResult::Parent { child }) => {
            sigprocmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None)?;
            drop(wiring.child_ends);

            tracing::debug!(pid = %child, program = %program.display(), "spawned child process");

            Ok(Process::new(
                child,
                wiring.stdin.map(ChildStdin::from_owned),
                wiring.stdout.map(ChildStdout::from_owned),
                wiring.stderr.map(ChildStderr::from_owned),
                wiring.stdin_bound,
            ))
        }
        Err(e) => {
            let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None);
            Err(SubprocessError::ForkError(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_for_path_with_slash() {
        let candidates = exec_candidates(Path::new("./run.sh"), Some(OsStr::new("/usr/bin")));
        assert_eq!(candidates, vec![PathBuf::from("./run.sh")]);
    }

    #[test]
    fn test_candidates_search_path() {
        let candidates = exec_candidates(Path::new("ls"), Some(OsStr::new("/a:/b::/c")));
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/a/ls"),
                PathBuf::from("/b/ls"),
                PathBuf::from("./ls"),
                PathBuf::from("/c/ls"),
            ]
        );
    }

    #[test]
    fn test_candidates_default_path() {
        let candidates = exec_candidates(Path::new("sh"), None);
        assert_eq!(candidates, vec![PathBuf::from("/bin/sh"), PathBuf::from("/usr/bin/sh")]);
    }

    #[test]
    fn test_environment_overrides_replace() {
        let vars = build_environment(
            &[
                ("SUBPROC_TEST_A".to_string(), "1".to_string()),
                ("SUBPROC_TEST_A".to_string(), "2".to_string()),
            ],
            true,
        )
        .unwrap();
        assert_eq!(
            vars,
            vec![(OsString::from("SUBPROC_TEST_A"), OsString::from("2"))]
        );
    }

    #[test]
    fn test_environment_rejects_bad_names() {
        let err = build_environment(&[("A=B".to_string(), "x".to_string())], true).unwrap_err();
        assert!(matches!(err, SubprocessError::InvalidConfig(_)));
    }

    #[test]
    fn test_plan_rejects_nul_argument() {
        let result = ChildPlan::new(
            Path::new("/bin/echo"),
            &["echo".to_string(), "a\0b".to_string()],
            None,
            &[],
            true,
            false,
            [None; 3],
        );
        assert!(matches!(result, Err(SubprocessError::InvalidConfig(_))));
    }

    #[test]
    fn test_plan_pointer_tables_are_null_terminated() {
        let plan = ChildPlan::new(
            Path::new("echo"),
            &["echo".to_string(), "hi".to_string()],
            None,
            &[("PATH".to_string(), "/bin".to_string())],
            true,
            false,
            [None; 3],
        )
        .unwrap();
        assert_eq!(plan.argv_ptrs.len(), 3);
        assert!(plan.argv_ptrs[2].is_null());
        assert_eq!(plan.envp_ptrs.len(), 2);
        assert_eq!(plan.candidates, vec![CString::new("/bin/echo").unwrap()]);
    }

    #[test]
    fn test_wiring_merge_and_pipe() {
        let mut wiring = Wiring::default();
        wiring.add(Slot::Stdout, RedirectionAction::CreatePipe).unwrap();
        wiring
            .add(Slot::Stderr, RedirectionAction::MergeWithStdout)
            .unwrap();

        assert!(wiring.stdout.is_some());
        assert!(wiring.stderr.is_none());
        assert_eq!(wiring.child_ends.len(), 1);
        assert_eq!(
            wiring.moves[2],
            Some(FdMove {
                source: Source::Slot(Slot::Stdout),
                target: Slot::Stderr,
            })
        );
    }
}

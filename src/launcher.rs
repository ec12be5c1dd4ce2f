//! Turns a normalized `ProgramConfig` into a running child process.
use nix::pty::{OpenptyResult, openpty};
use nix::unistd::dup;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use crate::config::{OutputTarget, ProgramConfig};
use crate::error::SpawnError;
use crate::privilege::{UserContext, apply_umask};

/// A spawned child plus the pty master fd, if `console: true` allocated one.
pub struct SpawnedProcess {
    /// The freshly spawned child.
    pub child: Child,
    /// Master side of the pty bridging this child's console, if allocated.
    pub pty_master: Option<OwnedFd>,
}

/// Splits a command line into argv-style words, honoring single and double quotes.
/// There is no shell involved: `$VAR` expansion already happened at config-load time,
/// and globbing is never performed.
pub fn split_command(cmd: &str) -> Result<Vec<String>, SpawnError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = cmd.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                '\\' => {
                    if let Some(&next) = chars.peek() {
                        current.push(next);
                        chars.next();
                    }
                    in_word = true;
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if in_word || quote.is_some() {
        words.push(current);
    }

    if words.is_empty() {
        return Err(SpawnError::Exec {
            program: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line"),
        });
    }
    Ok(words)
}

fn open_output(program: &ProgramConfig, target: &OutputTarget) -> Result<Stdio, SpawnError> {
    match target {
        OutputTarget::Discard => Ok(Stdio::null()),
        OutputTarget::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| SpawnError::Output {
                    program: program.name.clone(),
                    path: path.display().to_string(),
                    source,
                })?;
            Ok(Stdio::from(file))
        }
    }
}

fn dup_stdio(fd: RawFd) -> std::io::Result<Stdio> {
    let dup_fd = dup(fd).map_err(std::io::Error::from)?;
    let owned = unsafe { OwnedFd::from_raw_fd(dup_fd) };
    Ok(Stdio::from(File::from(owned)))
}

/// Spawns one instance of `program`. `instance` is the 1-based index among the
/// program's `numprocs` siblings, exposed to the child as `TASKMASTER_INSTANCE`.
pub fn spawn(program: &ProgramConfig, instance: u32) -> Result<SpawnedProcess, SpawnError> {
    let words = split_command(&program.cmd).map_err(|_| SpawnError::Exec {
        program: program.name.clone(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line"),
    })?;

    let user_ctx = UserContext::resolve(program)?;

    let mut command = Command::new(&words[0]);
    if words.len() > 1 {
        command.args(&words[1..]);
    }

    command.envs(&program.env);
    command.env("TASKMASTER_INSTANCE", instance.to_string());
    if let Some(home) = user_ctx.home() {
        command.env("HOME", home.display().to_string());
    }

    if let Some(dir) = &program.workingdir {
        command.current_dir(dir);
    }

    let pty_master = if program.console {
        let OpenptyResult { master, slave } = openpty(None, None).map_err(|err| {
            SpawnError::Pty(program.name.clone(), err)
        })?;
        let slave_fd = slave.as_raw_fd();
        command.stdin(dup_stdio(slave_fd).map_err(|err| {
            SpawnError::Exec {
                program: program.name.clone(),
                source: err,
            }
        })?);
        command.stdout(dup_stdio(slave_fd).map_err(|err| SpawnError::Exec {
            program: program.name.clone(),
            source: err,
        })?);
        command.stderr(dup_stdio(slave_fd).map_err(|err| SpawnError::Exec {
            program: program.name.clone(),
            source: err,
        })?);
        drop(slave);
        Some(master)
    } else {
        command.stdin(Stdio::null());
        command.stdout(open_output(program, &program.stdout)?);
        command.stderr(open_output(program, &program.stderr)?);
        None
    };

    let umask = program.umask;
    unsafe {
        command.pre_exec(move || {
            apply_umask(umask);
            user_ctx.apply()?;
            Ok(())
        });
    }

    let child = command.spawn().map_err(|source| SpawnError::Exec {
        program: program.name.clone(),
        source,
    })?;

    Ok(SpawnedProcess { child, pty_master })
}

//! CLI-facing control-plane client: sends one framed request per invocation and,
//! for `attach`, takes over the terminal as a raw byte bridge (§4.6, §6).
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;

use nix::sys::termios::{self, LocalFlags, SetArg};
use tracing::warn;

use crate::constants::ATTACH_ESCAPE_BYTE;
use crate::control::{ControlReply, ControlRequest};
use crate::error::ControlError;

fn connect() -> Result<UnixStream, ControlError> {
    let path = crate::runtime::socket_path();
    if !path.exists() {
        return Err(ControlError::NotAvailable);
    }
    Ok(UnixStream::connect(&path)?)
}

/// Sends a single `cmd`/`target` request and returns the daemon's reply.
pub fn send(cmd: &str, target: Option<String>) -> Result<ControlReply, ControlError> {
    let mut stream = connect()?;
    let request = ControlRequest::new(cmd, target);
    let mut payload = serde_json::to_vec(&request)?;
    payload.push(b'\n');
    stream.write_all(&payload)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Err(ControlError::Protocol("empty reply from supervisor".to_string()));
    }
    let reply: ControlReply = serde_json::from_str(line.trim())?;
    Ok(reply)
}

/// Attaches to `name`'s console: sends the `attach` request, then bridges the
/// local terminal to the daemon's byte stream until the user hits Ctrl-] or the
/// connection closes.
pub fn run_attach(name: &str) -> Result<(), ControlError> {
    let mut stream = connect()?;
    let request = ControlRequest::new("attach", Some(name.to_string()));
    let mut payload = serde_json::to_vec(&request)?;
    payload.push(b'\n');
    stream.write_all(&payload)?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let reply: ControlReply = serde_json::from_str(line.trim())?;
    if !reply.ok {
        return Err(ControlError::Protocol(reply.message));
    }
    if reply.attach != Some(true) {
        return Err(ControlError::Protocol("supervisor did not confirm attach".to_string()));
    }

    println!("attached to '{name}', press Ctrl-] to detach");

    let original_termios = termios::tcgetattr(io::stdin()).ok();
    if let Some(original) = &original_termios {
        let mut raw = original.clone();
        raw.local_flags
            .remove(LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::ISIG);
        let _ = termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &raw);
    }

    let result = bridge_terminal(reader, stream);

    if let Some(original) = &original_termios {
        let _ = termios::tcsetattr(io::stdin(), SetArg::TCSANOW, original);
    }
    println!("\ndetached from '{name}'");
    result
}

fn bridge_terminal(mut from_daemon: BufReader<UnixStream>, mut to_daemon: UnixStream) -> Result<(), ControlError> {
    let reader_handle = {
        let mut stdout = io::stdout();
        std::thread::spawn(move || -> io::Result<()> {
            let mut buf = [0u8; 4096];
            loop {
                let n = from_daemon.read(&mut buf)?;
                if n == 0 {
                    return Ok(());
                }
                stdout.write_all(&buf[..n])?;
                stdout.flush()?;
            }
        })
    };

    let mut stdin = io::stdin();
    let mut buf = [0u8; 1];
    loop {
        match stdin.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if buf[0] == ATTACH_ESCAPE_BYTE {
                    break;
                }
                if to_daemon.write_all(&buf).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!("attach stdin read failed: {err}");
                break;
            }
        }
    }

    let _ = to_daemon.shutdown(std::net::Shutdown::Both);
    let _ = reader_handle.join();
    Ok(())
}

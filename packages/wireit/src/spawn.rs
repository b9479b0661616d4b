//! Child process spawning for script commands.
//!
//! Commands run through the host shell (`sh -c` / `cmd /C`) from the
//! declaring package directory, with `PATH` rebuilt so that locally
//! installed tools win: every ancestor's `node_modules/.bin` is prepended,
//! and any `node_modules/.bin` entries inherited at the front of the
//! caller's `PATH` are stripped before the rest is appended.
//!
//! On unix each child gets its own process group so that termination
//! signals reach the whole tree the shell spawned.

use std::{path::Path, process::Stdio, time::Duration};

use color_eyre::{Result, eyre::Context};
use tokio::{io::AsyncReadExt, process::{Child, Command}};
use tracing::{debug, instrument, trace};

/// How long a child gets to exit after a termination signal before the
/// signal escalates to SIGKILL.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// The path separator inside `PATH`.
#[cfg(unix)]
const PATH_SEPARATOR: char = ':';
#[cfg(not(unix))]
const PATH_SEPARATOR: char = ';';

/// Rebuild `PATH` for a command running in `package`.
pub fn augmented_path(package: &Path, inherited: Option<&str>) -> String {
    let mut parts: Vec<String> = Vec::new();
    for dir in package.ancestors() {
        parts.push(
            dir.join("node_modules")
                .join(".bin")
                .to_string_lossy()
                .into_owned(),
        );
    }

    if let Some(inherited) = inherited {
        let mut leading = true;
        for part in inherited.split(PATH_SEPARATOR) {
            let is_bin_dir = Path::new(part)
                .ends_with(Path::new("node_modules").join(".bin"));
            if leading && is_bin_dir {
                continue;
            }
            leading = false;
            parts.push(part.to_owned());
        }
    }

    parts.join(&PATH_SEPARATOR.to_string())
}

/// Quote one argument for inclusion in a shell command line.
fn shell_quote(arg: &str) -> String {
    #[cfg(unix)]
    {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
    #[cfg(not(unix))]
    {
        format!("\"{arg}\"")
    }
}

/// Build (but do not spawn) the shell invocation for a script command.
pub fn build_command(package: &Path, command: &str, extra_args: Option<&[String]>) -> Command {
    let mut command_line = command.to_owned();
    if let Some(args) = extra_args {
        for arg in args {
            command_line.push(' ');
            command_line.push_str(&shell_quote(arg));
        }
    }

    #[cfg(unix)]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&command_line);
        cmd
    };
    #[cfg(not(unix))]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(&command_line);
        cmd
    };

    cmd.current_dir(package);
    cmd.env(
        "PATH",
        augmented_path(package, std::env::var("PATH").ok().as_deref()),
    );
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    trace!(?package, command = %command_line, "built command");
    cmd
}

/// Send a signal to the child's whole process group.
#[cfg(unix)]
fn signal_group(child: &Child, signal: i32) {
    if let Some(pid) = child.id() {
        // The child is its own process group leader (process_group(0)), so
        // the negative pid addresses the group.
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

/// Terminate the child: polite signal first, SIGKILL after the grace
/// period. Returns once the child has exited. Bounded even for children
/// that ignore signals.
#[instrument(skip(child))]
pub async fn terminate(child: &mut Child, grace: Duration) -> Result<()> {
    #[cfg(unix)]
    {
        signal_group(child, libc::SIGINT);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                status.context("await terminated child")?;
                return Ok(());
            }
            Err(_elapsed) => {
                debug!("child survived the grace period; escalating to SIGKILL");
                signal_group(child, libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
        child.start_kill().context("kill child")?;
    }
    child.wait().await.context("await killed child")?;
    Ok(())
}

/// Drain an output stream in chunks, invoking `on_chunk` for each.
pub async fn read_chunks(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    mut on_chunk: impl FnMut(Vec<u8>),
) -> Result<()> {
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let len = reader.read(&mut buf).await.context("read child output")?;
        if len == 0 {
            return Ok(());
        }
        on_chunk(buf[..len].to_vec());
    }
}

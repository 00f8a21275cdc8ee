use std::ffi::OsStr;
use std::process::Command;

pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    configure_for_background(&mut cmd);
    cmd
}

/// Like [`command`], but the child becomes the leader of its own process group
/// so the whole tree can be signalled at once.
pub fn supervised_command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = command(program);
    configure_process_group(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    // Prevent console windows from stealing focus on Windows while running tools.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}

#[cfg(unix)]
fn configure_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    cmd.process_group(0);
}

// taskkill /T walks the tree by parent pid, no grouping needed.
#[cfg(not(unix))]
fn configure_process_group(_cmd: &mut Command) {}

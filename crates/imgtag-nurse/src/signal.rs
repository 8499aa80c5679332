//! Best-effort POSIX signal delivery to a supervised child. On non-unix
//! targets these are no-ops and callers fall back to `Child::kill` (hard
//! termination) for everything.

use tokio::process::Child;

#[cfg(unix)]
pub fn send(child: &Child, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        log::debug!("no child pid to signal, child already reaped");
        return;
    };

    if let Err(err) = kill(Pid::from_raw(pid as i32), signal) {
        log::warn!("failed to send {signal:?} to child {pid}: {err}");
    }
}

#[cfg(not(unix))]
pub fn send(_child: &Child, _signal: ()) {}

#[cfg(unix)]
pub fn interrupt(child: &Child) {
    send(child, nix::sys::signal::Signal::SIGINT);
}

#[cfg(not(unix))]
pub fn interrupt(_child: &Child) {}

#[cfg(unix)]
pub fn terminate(child: &Child) {
    send(child, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(not(unix))]
pub fn terminate(_child: &Child) {}

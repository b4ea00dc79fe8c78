//! TCP keepalive tuning shared by both ends of a machine link.
//!
//! A half-open connection is detected after roughly
//! `IDLE + INTERVAL * COUNT` seconds of silence.

/// Seconds of idleness before the first probe
pub const KEEPALIVE_IDLE_SECS: u32 = 60;
/// Seconds between probes
pub const KEEPALIVE_INTERVAL_SECS: u32 = 60;
/// Unanswered probes before the peer is declared dead
pub const KEEPALIVE_COUNT: u32 = 3;

/// Turns keepalive on for a connected socket (tokio or std `TcpStream`).
#[cfg(unix)]
pub fn enable_keepalive<F: std::os::fd::AsFd>(socket: &F) -> std::io::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};

    setsockopt(socket, sockopt::KeepAlive, &true)?;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        setsockopt(socket, sockopt::TcpKeepIdle, &KEEPALIVE_IDLE_SECS)?;
        setsockopt(socket, sockopt::TcpKeepInterval, &KEEPALIVE_INTERVAL_SECS)?;
        setsockopt(socket, sockopt::TcpKeepCount, &KEEPALIVE_COUNT)?;
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn enable_keepalive<F>(_socket: &F) -> std::io::Result<()> {
    Ok(())
}

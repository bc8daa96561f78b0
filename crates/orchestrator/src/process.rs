//! Structured child-process spawn for world-server instances, via
//! `tokio::process::{Child, Command}` with inherited stdio.

use std::path::Path;

use anyhow::Context as _;
use tokio::process::{Child, Command};

/// Arguments passed to a freshly spawned world-server process:
/// `{ip, port, mapID, instanceID, cloneID, maxPlayers}`.
pub struct SpawnArgs<'a> {
    pub ip: &'a str,
    pub port: u16,
    pub map_id: u16,
    pub instance_id: u16,
    pub clone_id: u32,
    pub max_players: u32,
}

/// Launches a world-server binary. The call is fire-and-forget: it must not
/// block on child readiness: readiness is signalled later over the
/// transport by `WORLD_READY`.
pub fn spawn_world(binary: &Path, args: &SpawnArgs<'_>, use_sudo: bool) -> anyhow::Result<Child> {
    let mut command = if use_sudo {
        let mut c = Command::new("sudo");
        c.arg(binary);
        c
    } else {
        Command::new(binary)
    };

    command
        .arg("--ip")
        .arg(args.ip)
        .arg("--port")
        .arg(args.port.to_string())
        .arg("--map-id")
        .arg(args.map_id.to_string())
        .arg("--instance-id")
        .arg(args.instance_id.to_string())
        .arg("--clone-id")
        .arg(args.clone_id.to_string())
        .arg("--max-players")
        .arg(args.max_players.to_string())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::inherit())
        .stderr(std::process::Stdio::inherit())
        // The child must outlive a master restart; dropping our handle must
        // not send a kill signal.
        .kill_on_drop(false);

    command.spawn().with_context(|| format!("spawning world-server binary at {}", binary.display()))
}

/// Binds an ephemeral TCP listener to discover a free port, then releases it.
/// There is an unavoidable race between release and the child's own bind,
/// which is why placement here is deterministic-by-zone rather than a
/// health-checked reservation.
pub async fn choose_free_port(host: &str) -> anyhow::Result<u16> {
    let listener = tokio::net::TcpListener::bind((host, 0)).await.context("probing for a free port")?;
    let port = listener.local_addr().context("reading probe listener's local address")?.port();

    Ok(port)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn chooses_a_nonzero_free_port() {
        let port = choose_free_port("127.0.0.1").await.unwrap();
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn distinct_probes_can_return_distinct_ports() {
        let a = choose_free_port("127.0.0.1").await.unwrap();
        let b = choose_free_port("127.0.0.1").await.unwrap();
        // Not guaranteed distinct by the OS, but overwhelmingly likely, and
        // at minimum both must be valid ephemeral ports.
        assert!(a > 0 && b > 0);
    }
}

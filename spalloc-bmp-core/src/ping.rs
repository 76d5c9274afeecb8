use std::net::IpAddr;
use std::process::Stdio;
use tokio::process::Command;

/// One ICMP echo via the system `ping` binary, bounded to roughly a second.
/// Used to prime ARP caches after power-on and to pace transceiver
/// construction retries. Failure is informational only.
pub async fn ping(host: IpAddr) -> bool {
    let status = Command::new("ping")
        .args(["-c", "1", "-W", "1"])
        .arg(host.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(s) => s.success(),
        Err(e) => {
            tracing::debug!(%host, error = %e, "could not spawn ping");
            false
        }
    }
}

//! Local broker lifecycle
//!
//! [`BrokerLifecycle`] is the only view the rest of the crate has of the local
//! broker process. All calls are blocking and must run on a blocking thread.
//!
//! Liveness is an MQTT-level probe, not a port check:
//!
//! ```text
//! probe ── TCP connect ──► broker
//!       ── CONNECT ──────►
//!       ◄──── CONNACK ───     (0x20: running, anything else: not running)
//!       ── DISCONNECT ───►
//! ```

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub trait BrokerLifecycle: Send + Sync {
    /// Whether an MQTT broker answers on `port`
    fn is_running(&self, port: u16) -> bool;

    /// Starts a broker with the given config; true once it answers the probe
    fn start(&self, config_path: &Path) -> bool;

    /// Stops a broker started through `start`. No-op otherwise.
    fn stop(&self);
}

const PROBE_CLIENT_ID: &[u8] = b"padbridge-probe";
const CONNACK: u8 = 0x20;
const DISCONNECT: [u8; 2] = [0xE0, 0x00];

/// MQTT 3.1.1 CONNECT with clean session and a 10s keep-alive
fn connect_packet() -> Vec<u8> {
    let mut body = vec![0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x0A];
    body.extend_from_slice(&(PROBE_CLIENT_ID.len() as u16).to_be_bytes());
    body.extend_from_slice(PROBE_CLIENT_ID);

    let mut packet = vec![0x10, body.len() as u8];
    packet.extend(body);
    packet
}

fn probe(addr: SocketAddr, timeout: Duration) -> std::io::Result<bool> {
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    stream.write_all(&connect_packet())?;
    let mut ack = [0u8; 4];
    stream.read_exact(&mut ack)?;

    let _ = stream.write_all(&DISCONNECT);
    Ok(ack[0] == CONNACK)
}

/// Spawns and supervises a `mosquitto` process
pub struct MosquittoBroker {
    executable: String,
    host: String,
    port: u16,
    probe_timeout: Duration,
    startup_grace: Duration,
    child: Mutex<Option<Child>>,
}

impl MosquittoBroker {
    pub fn new(
        executable: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        probe_timeout: Duration,
        startup_grace: Duration,
    ) -> Self {
        Self {
            executable: executable.into(),
            host: host.into(),
            port,
            probe_timeout,
            startup_grace,
            child: Mutex::new(None),
        }
    }

    fn resolve(&self, port: u16) -> Option<SocketAddr> {
        (self.host.as_str(), port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
    }
}

impl BrokerLifecycle for MosquittoBroker {
    fn is_running(&self, port: u16) -> bool {
        let Some(addr) = self.resolve(port) else {
            warn!("Cannot resolve broker host {}", self.host);
            return false;
        };

        match probe(addr, self.probe_timeout) {
            Ok(true) => {
                debug!("Broker answered on {}", addr);
                true
            }
            Ok(false) => {
                warn!("Something listens on {} but it is not an MQTT broker", addr);
                false
            }
            Err(e) => {
                debug!("No broker on {}: {}", addr, e);
                false
            }
        }
    }

    fn start(&self, config_path: &Path) -> bool {
        if !config_path.exists() {
            error!("Broker config not found: {}", config_path.display());
            return false;
        }

        let mut guard = match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(child) = guard.as_mut() {
            if let Ok(None) = child.try_wait() {
                debug!("Broker process already running, probing");
                return self.is_running(self.port);
            }
        }

        info!(
            "Starting {} -v -c {}",
            self.executable,
            config_path.display()
        );
        let mut child = match Command::new(&self.executable)
            .arg("-v")
            .arg("-c")
            .arg(config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to start broker: {}", e);
                return false;
            }
        };

        std::thread::sleep(self.startup_grace);

        if let Ok(Some(status)) = child.try_wait() {
            error!("Broker exited during startup: {}", status);
            return false;
        }
        *guard = Some(child);
        drop(guard);

        let running = self.is_running(self.port);
        if running {
            info!("Local broker is up on port {}", self.port);
        } else {
            warn!("Broker started but does not answer on port {}", self.port);
        }
        running
    }

    fn stop(&self) {
        let mut guard = match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(mut child) = guard.take() {
            info!("Stopping local broker (pid {})", child.id());
            if let Err(e) = child.kill() {
                warn!("Failed to stop broker: {}", e);
            }
            let _ = child.wait();
        }
    }
}

/// Address other hosts on the LAN can reach us at.
///
/// A connected UDP socket reveals the outbound interface without sending
/// anything. Falls back to loopback.
pub fn local_ip() -> IpAddr {
    let detected = UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip());

    match detected {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) | Err(_) => {
            warn!("Could not detect local IP, falling back to 127.0.0.1");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Default path of the broker config shipped next to the application config
pub fn default_broker_config() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("padbridge");
    path.push("mosquitto.conf");
    path
}

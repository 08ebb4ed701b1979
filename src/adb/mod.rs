//! adb plumbing for the device-side agent
//!
//! Pushes the agent binary, manages the local TCP forward into the agent's
//! abstract socket, and launches the agent process over `adb shell`. All
//! commands run against a specific device serial.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::session::config::SessionConfig;

/// Agent protocol version passed on the server command line
pub const SERVER_VERSION: &str = "3.1";

/// Java entry point of the device-side agent
const SERVER_CLASS: &str = "com.genymobile.scrcpy.Server";

/// adb client wrapper bound to one `adb` binary
#[derive(Debug, Clone)]
pub struct Adb {
    program: PathBuf,
}

impl Adb {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, serial: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program)
            .arg("-s")
            .arg(serial)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                GatewayError::Resource(format!("failed to invoke {:?}: {}", self.program, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GatewayError::Resource(format!(
                "adb {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Push the agent binary to the device.
    pub async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<()> {
        let local = local.to_string_lossy();
        debug!(serial, %local, remote, "pushing agent binary");
        self.run(serial, &["push", &local, remote]).await?;
        Ok(())
    }

    /// Forward a local TCP port to the agent's abstract socket.
    pub async fn forward(&self, serial: &str, local_port: u16, socket_name: &str) -> Result<()> {
        let local = format!("tcp:{}", local_port);
        let remote = format!("localabstract:{}", socket_name);
        debug!(serial, %local, %remote, "establishing port forward");
        self.run(serial, &["forward", &local, &remote]).await?;
        Ok(())
    }

    /// Remove a previously established forward. Best-effort on teardown.
    pub async fn remove_forward(&self, serial: &str, local_port: u16) -> Result<()> {
        let local = format!("tcp:{}", local_port);
        self.run(serial, &["forward", "--remove", &local]).await?;
        Ok(())
    }

    /// Launch the agent process on the device with parameters derived from
    /// the session config. The returned child is killed when dropped.
    pub fn spawn_server(
        &self,
        serial: &str,
        remote_path: &str,
        scid: &str,
        config: &SessionConfig,
    ) -> Result<Child> {
        let mut shell_cmd = vec![
            format!("CLASSPATH={}", remote_path),
            "app_process".to_string(),
            "/".to_string(),
            SERVER_CLASS.to_string(),
            SERVER_VERSION.to_string(),
        ];
        shell_cmd.extend(server_options(scid, config));

        debug!(serial, scid, "launching device agent");
        let child = Command::new(&self.program)
            .arg("-s")
            .arg(serial)
            .arg("shell")
            .args(&shell_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GatewayError::Resource(format!("failed to spawn device agent: {}", e))
            })?;

        Ok(child)
    }
}

/// Key=value parameters for the agent command line.
fn server_options(scid: &str, config: &SessionConfig) -> Vec<String> {
    let mut options = vec![
        format!("scid={}", scid),
        format!("log_level={}", config.log_level),
        format!("video={}", config.video),
        format!("audio={}", config.audio),
        format!("control={}", config.control),
        // The gateway dials in through an adb forward, so the agent must
        // listen instead of connecting back to the host.
        "tunnel_forward=true".to_string(),
        "cleanup=true".to_string(),
    ];

    if config.max_size > 0 {
        options.push(format!("max_size={}", config.max_size));
    }
    if config.max_fps > 0 {
        options.push(format!("max_fps={}", config.max_fps));
    }
    if config.video_bit_rate > 0 {
        options.push(format!("video_bit_rate={}", config.video_bit_rate));
    }
    if !config.video_codec_options.is_empty() {
        options.push(format!("video_codec_options={}", config.video_codec_options));
    }
    if config.audio && !config.audio_codec.is_empty() {
        options.push(format!("audio_codec={}", config.audio_codec));
    }

    options
}

/// Drain the agent's stdout/stderr into the log so device-side failures are
/// visible from the gateway's own output.
pub fn spawn_output_loggers(child: &mut Child, device_id: &str) {
    if let Some(stdout) = child.stdout.take() {
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(%device_id, "agent: {}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(%device_id, "agent: {}", line);
            }
        });
    }
}

/// Ask the OS for a free ephemeral TCP port.
pub fn allocate_ephemeral_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| GatewayError::Resource(format!("ephemeral port allocation failed: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| GatewayError::Resource(format!("ephemeral port allocation failed: {}", e)))?
        .port();
    Ok(port)
}

/// Generate a session correlation id: 31-bit random value, lowercase hex,
/// used to address the agent's abstract socket.
pub fn generate_scid() -> String {
    use rand::Rng;
    let value: u32 = rand::thread_rng().gen_range(0..0x8000_0000);
    format!("{:08x}", value)
}

/// Abstract socket name derived from the scid.
pub fn socket_name(scid: &str) -> String {
    format!("scrcpy_{}", scid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_options_reflect_config() {
        let config = SessionConfig {
            video: true,
            audio: true,
            control: true,
            max_fps: 30,
            video_bit_rate: 4_000_000,
            max_size: 1280,
            video_codec_options: "profile=1,level=4096".to_string(),
            audio_codec: "opus".to_string(),
            log_level: "info".to_string(),
        };
        let options = server_options("1a2b3c4d", &config);
        assert!(options.contains(&"scid=1a2b3c4d".to_string()));
        assert!(options.contains(&"tunnel_forward=true".to_string()));
        assert!(options.contains(&"max_size=1280".to_string()));
        assert!(options.contains(&"max_fps=30".to_string()));
        assert!(options.contains(&"video_bit_rate=4000000".to_string()));
        assert!(options.contains(&"audio_codec=opus".to_string()));
    }

    #[test]
    fn test_zero_valued_limits_are_omitted() {
        let config = SessionConfig::default();
        let options = server_options("00000000", &config);
        assert!(!options.iter().any(|o| o.starts_with("max_size=")));
        assert!(!options.iter().any(|o| o.starts_with("max_fps=")));
    }

    #[test]
    fn test_scid_is_31_bit_hex() {
        for _ in 0..32 {
            let scid = generate_scid();
            assert_eq!(scid.len(), 8);
            let value = u32::from_str_radix(&scid, 16).unwrap();
            assert!(value < 0x8000_0000);
        }
    }

    #[test]
    fn test_ephemeral_port_allocation() {
        let port = allocate_ephemeral_port().unwrap();
        assert!(port > 0);
    }
}

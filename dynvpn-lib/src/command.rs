use thiserror::Error;
use tokio::process::Command;

use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

pub const SET_ONLINE_SCRIPT: &str = "vpn-set-online.sh";
pub const SET_OFFLINE_SCRIPT: &str = "vpn-set-offline.sh";
pub const CHECK_ONLINE_SCRIPT: &str = "vpn-check-online.sh";
pub const CHECK_PID_SCRIPT: &str = "check-pid.sh";
pub const ADD_ROUTE_SCRIPT: &str = "add-vpn-route.sh";
pub const DELETE_ROUTE_SCRIPT: &str = "delete-vpn-route.sh";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to execute `{script}`: {error}")]
    Exec { script: String, error: io::Error },
}

/// Captured result of one script invocation. A non-zero exit code is not an
/// error at this layer; callers interpret it.
#[derive(Debug)]
pub struct CmdOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs the external VPN management scripts.
///
/// The scripts own all persistent state (PID files under the state dir,
/// kernel routes, VPN processes); this type only passes arguments through and
/// reports exit codes.
#[derive(Clone, Debug)]
pub struct ScriptRunner {
    script_path: PathBuf,
    state_dir: PathBuf,
}

impl ScriptRunner {
    pub fn new(script_path: PathBuf, state_dir: PathBuf) -> Self {
        ScriptRunner { script_path, state_dir }
    }

    async fn run(&self, script: &str, args: &[String]) -> Result<CmdOutput, Error> {
        let path = self.script_path.join(script);
        tracing::info!(script = %path.display(), ?args, "running script");

        let output = Command::new(&path).args(args).output().await.map_err(|error| Error::Exec {
            script: path.display().to_string(),
            error,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let code = output.status.code().unwrap_or(-1);

        if code != 0 {
            tracing::debug!(script, code, %stdout, %stderr, "script exited non-zero");
        } else if !stderr.is_empty() {
            tracing::warn!(script, %stderr, "non empty stderr on successful script");
        }

        Ok(CmdOutput { code, stdout, stderr })
    }

    fn state_dir_arg(&self) -> String {
        self.state_dir.display().to_string()
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub async fn vpn_set_online(
        &self,
        name: &str,
        local_addr: Ipv4Addr,
        site_id: &str,
        gateway_addr: Ipv4Addr,
    ) -> Result<CmdOutput, Error> {
        self.run(
            SET_ONLINE_SCRIPT,
            &[
                name.to_string(),
                local_addr.to_string(),
                self.state_dir_arg(),
                site_id.to_string(),
                gateway_addr.to_string(),
            ],
        )
        .await
    }

    pub async fn vpn_set_offline(&self, name: &str, local_addr: Ipv4Addr) -> Result<CmdOutput, Error> {
        self.run(
            SET_OFFLINE_SCRIPT,
            &[name.to_string(), local_addr.to_string(), self.state_dir_arg()],
        )
        .await
    }

    pub async fn vpn_check_online(
        &self,
        local_addr: Ipv4Addr,
        timeout_secs: u64,
        name: &str,
    ) -> Result<CmdOutput, Error> {
        self.run(
            CHECK_ONLINE_SCRIPT,
            &[local_addr.to_string(), timeout_secs.to_string(), name.to_string()],
        )
        .await
    }

    pub async fn check_pid(&self, name: &str, local_addr: Ipv4Addr) -> Result<CmdOutput, Error> {
        self.run(
            CHECK_PID_SCRIPT,
            &[name.to_string(), local_addr.to_string(), self.state_dir_arg()],
        )
        .await
    }

    pub async fn add_vpn_route(&self, anycast_addr: Ipv4Addr, gateway_addr: Ipv4Addr) -> Result<CmdOutput, Error> {
        self.run(
            ADD_ROUTE_SCRIPT,
            &[anycast_addr.to_string(), gateway_addr.to_string()],
        )
        .await
    }

    pub async fn delete_vpn_route(&self, anycast_addr: Ipv4Addr) -> Result<CmdOutput, Error> {
        self.run(DELETE_ROUTE_SCRIPT, &[anycast_addr.to_string()]).await
    }
}

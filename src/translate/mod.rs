// Translation stage
//
// The parent never loads the translation model itself. It hands a manifest
// to an isolated worker process and consumes the result files it publishes:
// - Manifest: job list and the transient file names
// - Pivot: optional single-job pass into the pivot language
// - Orchestrator: missing-language detection, polling, checkpointing

pub mod manifest;
pub mod orchestrator;
pub mod pivot;

use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

pub use manifest::*;
pub use orchestrator::*;
pub use pivot::*;

/// Environment variable carrying the parent's config file to the worker.
pub const CONFIG_ENV: &str = "SUBFORGE_CONFIG";

/// Builds the base command for one worker run; callers append the mode
/// arguments (`--batch <manifest>` or the legacy positional list).
pub trait WorkerLauncher: Send + Sync {
    fn command(&self) -> Command;
}

/// Launches the `subforge-worker` binary.
#[derive(Debug, Clone)]
pub struct BinaryLauncher {
    binary: PathBuf,
    config_path: Option<PathBuf>,
    force_cpu: bool,
}

impl BinaryLauncher {
    pub fn new(binary: PathBuf, config_path: Option<PathBuf>, force_cpu: bool) -> Self {
        Self {
            binary,
            config_path,
            force_cpu,
        }
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }
}

impl WorkerLauncher for BinaryLauncher {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(config) = &self.config_path {
            cmd.env(CONFIG_ENV, config);
        }
        if self.force_cpu {
            // hides every accelerator from the worker's hardware probe
            cmd.env("CUDA_VISIBLE_DEVICES", "");
        }
        // the worker leads its own group so its sidecar goes down with it
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launcher_forwards_config_and_cpu_flag() {
        let launcher = BinaryLauncher::new(
            PathBuf::from("/opt/subforge-worker"),
            Some(PathBuf::from("/etc/subforge.toml")),
            true,
        );
        let cmd = launcher.command();
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), "/opt/subforge-worker");
        let envs: Vec<_> = std_cmd.get_envs().collect();
        assert!(envs.iter().any(|(k, v)| *k == CONFIG_ENV && v.map(|v| v == "/etc/subforge.toml").unwrap_or(false)));
        assert!(envs.iter().any(|(k, v)| *k == "CUDA_VISIBLE_DEVICES" && v.map(|v| v.is_empty()).unwrap_or(false)));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn worker_leads_its_own_process_group() {
        let launcher = BinaryLauncher::new(PathBuf::from("sh"), None, false);
        let mut cmd = launcher.command();
        cmd.arg("-c").arg("echo $$ $(cut -d' ' -f5 /proc/$$/stat)");
        let out = cmd.output().await.unwrap();

        let text = String::from_utf8(out.stdout).unwrap();
        let ids: Vec<&str> = text.split_whitespace().collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);
    }
}

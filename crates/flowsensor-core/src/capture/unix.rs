//! Unix capture backend: drives the system `tcpdump` binary per interface
//! and merges the results with `mergecap` when more than one interface is
//! requested.
//!
//! Grounded on `patronus-diagnostics::packet_capture`'s
//! spawn/SIGTERM-then-wait/stats-via-subprocess shape.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::command::CommandFactory;
use super::{CaptureError, CaptureState, TraceCapturer};
use crate::model::{CaptureRequest, TraceArtifact};

const DEFAULT_SNAPLEN: &str = "262144";

pub struct UnixCapturer {
    command_factory: CommandFactory,
    state: CaptureState,
    capture_tool: &'static str,
    merge_tool: &'static str,
}

impl UnixCapturer {
    pub fn new(command_factory: CommandFactory) -> Self {
        Self {
            command_factory,
            state: CaptureState::new(),
            capture_tool: "tcpdump",
            merge_tool: "mergecap",
        }
    }

    fn build_capture_command(&self, interface: &str, dest: &Path) -> tokio::process::Command {
        let mut cmd = (self.command_factory)(self.capture_tool);
        cmd.arg("-i")
            .arg(interface)
            .arg("-w")
            .arg(dest)
            .arg("-s")
            .arg(DEFAULT_SNAPLEN)
            .arg("-U"); // flush to disk after each packet so SIGTERM leaves a valid file
        cmd
    }

    async fn run_single_interface(
        &self,
        ctx: &CancellationToken,
        interface: &str,
        dest: &Path,
        window: Duration,
    ) -> Result<(), CaptureError> {
        let mut child: Child = self
            .build_capture_command(interface, dest)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CaptureError::ToolMissing(self.capture_tool)
                } else {
                    CaptureError::Io(e)
                }
            })?;

        let pid = child
            .id()
            .ok_or_else(|| CaptureError::Io(std::io::Error::other("child exited immediately")))?;

        tokio::select! {
            _ = sleep(window) => {}
            _ = ctx.cancelled() => {}
        }

        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

        let cancelled = ctx.is_cancelled();
        let status = child.wait().await.map_err(CaptureError::Io)?;
        if !status.success() && !cancelled {
            let mut stderr = String::new();
            if let Some(mut out) = child.stderr.take() {
                let _ = out.read_to_string(&mut stderr).await;
            }
            // tcpdump commonly exits non-zero on SIGTERM even on a clean
            // stop; only treat this as a real failure if it produced no
            // output file at all.
            if tokio::fs::metadata(dest).await.is_err() {
                return Err(CaptureError::ToolFailed {
                    status: status.code().unwrap_or(-1),
                    stderr,
                });
            }
        }
        if cancelled {
            return Err(CaptureError::Cancelled);
        }
        Ok(())
    }

    async fn merge(&self, parts: &[PathBuf], dest: &Path) -> Result<(), CaptureError> {
        let mut cmd = (self.command_factory)(self.merge_tool);
        cmd.arg("-w").arg(dest);
        for part in parts {
            cmd.arg(part);
        }
        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CaptureError::MergeToolMissing(parts.len())
            } else {
                CaptureError::Io(e)
            }
        })?;
        if !output.status.success() {
            return Err(CaptureError::ToolFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TraceCapturer for UnixCapturer {
    async fn capture(
        &self,
        ctx: CancellationToken,
        req: &CaptureRequest,
    ) -> Result<TraceArtifact, CaptureError> {
        if !self.state.try_start() {
            return Err(CaptureError::AlreadyCapturing);
        }
        let result = self.capture_inner(&ctx, req).await;
        self.state.finish();
        result
    }
}

impl UnixCapturer {
    /// Removes any leftover `*.pcap` file in the output directory so that a
    /// stale file from a previous (possibly crashed) iteration can never be
    /// mistaken for this iteration's output.
    async fn clear_stale_pcaps(&self, output_dir: &Path) -> Result<(), CaptureError> {
        let Ok(mut entries) = tokio::fs::read_dir(output_dir).await else {
            return Ok(());
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("pcap") {
                tokio::fs::remove_file(&path).await.map_err(CaptureError::Io)?;
            }
        }
        Ok(())
    }

    async fn capture_inner(
        &self,
        ctx: &CancellationToken,
        req: &CaptureRequest,
    ) -> Result<TraceArtifact, CaptureError> {
        self.clear_stale_pcaps(&req.output_dir).await?;

        let created_at = Utc::now();
        let final_path = req
            .output_dir
            .join(format!("capture_{}.pcap", created_at.format("%Y%m%dT%H%M%SZ")));

        if req.interfaces.len() == 1 {
            let iface = req.interfaces[0].as_str();
            self.run_single_interface(ctx, iface, &final_path, req.window)
                .await?;
            return Ok(TraceArtifact {
                path: final_path,
                created_at,
            });
        }

        // Each per-interface capture runs independently; one interface's
        // failure must not sink the others — the iteration proceeds with
        // whatever succeeded, and only fails outright if every interface
        // failed.
        let mut part_paths = Vec::with_capacity(req.interfaces.len());
        let mut tasks = Vec::with_capacity(req.interfaces.len());
        for (i, iface) in req.interfaces.iter().enumerate() {
            let part = req.output_dir.join(format!(".part_{i}.pcap"));
            part_paths.push(part.clone());
            tasks.push(self.run_single_interface(ctx, iface.as_str(), &part, req.window));
        }
        let results = futures::future::join_all(tasks).await;

        if results.iter().any(|r| matches!(r, Err(CaptureError::Cancelled))) {
            for part in &part_paths {
                let _ = tokio::fs::remove_file(part).await;
            }
            return Err(CaptureError::Cancelled);
        }

        let succeeded: Vec<PathBuf> = part_paths
            .iter()
            .zip(results.iter())
            .filter(|(_, r)| r.is_ok())
            .map(|(p, _)| p.clone())
            .collect();

        if succeeded.is_empty() {
            for part in &part_paths {
                let _ = tokio::fs::remove_file(part).await;
            }
            return Err(CaptureError::ToolFailed {
                status: -1,
                stderr: "every per-interface capture failed".to_string(),
            });
        }

        if succeeded.len() == 1 {
            tokio::fs::rename(&succeeded[0], &final_path)
                .await
                .map_err(CaptureError::Io)?;
        } else {
            self.merge(&succeeded, &final_path).await?;
        }
        for part in &part_paths {
            let _ = tokio::fs::remove_file(part).await;
        }

        Ok(TraceArtifact {
            path: final_path,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::parse_interfaces;
    use tempfile::tempdir;

    const FAKE_TCPDUMP: &str = "#!/bin/sh\nout=\"\"\nwhile [ $# -gt 0 ]; do\n  case \"$1\" in\n    -w) out=\"$2\"; shift 2 ;;\n    *) shift ;;\n  esac\ndone\ntrap 'exit 0' TERM\ntouch \"$out\"\nwhile true; do sleep 0.05; done\n";

    const FAILING_TCPDUMP: &str = "#!/bin/sh\nexit 1\n";

    fn write_script(dir: &Path, name: &str, script: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, script).unwrap();
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn factory_with(tcpdump: PathBuf, mergecap: Option<PathBuf>) -> CommandFactory {
        Box::new(move |program: &str| {
            let resolved = match program {
                "tcpdump" => tcpdump.clone(),
                "mergecap" => mergecap
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("flowsensor-test-mergecap-missing")),
                other => PathBuf::from(other),
            };
            let mut cmd = tokio::process::Command::new(resolved);
            cmd.stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped());
            cmd
        })
    }

    #[tokio::test]
    async fn single_interface_capture_produces_one_canonical_file() {
        let bin_dir = tempdir().unwrap();
        let out_dir = tempdir().unwrap();
        let tcpdump = write_script(bin_dir.path(), "tcpdump", FAKE_TCPDUMP);

        let capturer = UnixCapturer::new(factory_with(tcpdump, None));
        let req = CaptureRequest {
            window: Duration::from_millis(50),
            output_dir: out_dir.path().to_path_buf(),
            interfaces: parse_interfaces("eth0").unwrap(),
        };

        let artifact = capturer
            .capture(CancellationToken::new(), &req)
            .await
            .unwrap();
        assert!(artifact.path.exists());
        assert_eq!(artifact.path.extension().unwrap(), "pcap");
    }

    #[tokio::test]
    async fn clears_stale_pcap_before_capturing() {
        let bin_dir = tempdir().unwrap();
        let out_dir = tempdir().unwrap();
        let tcpdump = write_script(bin_dir.path(), "tcpdump", FAKE_TCPDUMP);
        let stale = out_dir.path().join("capture_stale.pcap");
        std::fs::write(&stale, b"old").unwrap();

        let capturer = UnixCapturer::new(factory_with(tcpdump, None));
        let req = CaptureRequest {
            window: Duration::from_millis(50),
            output_dir: out_dir.path().to_path_buf(),
            interfaces: parse_interfaces("eth0").unwrap(),
        };

        capturer
            .capture(CancellationToken::new(), &req)
            .await
            .unwrap();
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn second_concurrent_call_is_rejected() {
        let bin_dir = tempdir().unwrap();
        let out_dir = tempdir().unwrap();
        let tcpdump = write_script(bin_dir.path(), "tcpdump", FAKE_TCPDUMP);
        let capturer = UnixCapturer::new(factory_with(tcpdump, None));
        let req = CaptureRequest {
            window: Duration::from_millis(200),
            output_dir: out_dir.path().to_path_buf(),
            interfaces: parse_interfaces("eth0").unwrap(),
        };

        let first = capturer.capture(CancellationToken::new(), &req);
        tokio::pin!(first);
        // Poll once so `state.try_start()` has flipped to Running, then fire
        // the second call while the first is still in flight.
        tokio::select! {
            _ = &mut first => panic!("first capture finished before second call started"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        let second = capturer.capture(CancellationToken::new(), &req).await;
        assert!(matches!(second, Err(CaptureError::AlreadyCapturing)));
        first.await.unwrap();
    }

    #[tokio::test]
    async fn multi_interface_merges_when_all_succeed() {
        let bin_dir = tempdir().unwrap();
        let out_dir = tempdir().unwrap();
        let tcpdump = write_script(bin_dir.path(), "tcpdump", FAKE_TCPDUMP);
        // A fake mergecap that just concatenates its inputs into -w's target.
        let mergecap_script = "#!/bin/sh\nout=\"\"\nargs=\"\"\nwhile [ $# -gt 0 ]; do\n  case \"$1\" in\n    -w) out=\"$2\"; shift 2 ;;\n    *) args=\"$args $1\"; shift ;;\n  esac\ndone\ncat $args > \"$out\"\n";
        let mergecap = write_script(bin_dir.path(), "mergecap", mergecap_script);

        let capturer = UnixCapturer::new(factory_with(tcpdump, Some(mergecap)));
        let req = CaptureRequest {
            window: Duration::from_millis(50),
            output_dir: out_dir.path().to_path_buf(),
            interfaces: parse_interfaces("eth0,eth1").unwrap(),
        };

        let artifact = capturer
            .capture(CancellationToken::new(), &req)
            .await
            .unwrap();
        assert!(artifact.path.exists());
        // per-interface part files must be cleaned up after a successful merge
        let remaining: Vec<_> = std::fs::read_dir(out_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with(".part_"))
            .collect();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn multi_interface_without_merge_tool_fails_when_more_than_one_succeeds() {
        let bin_dir = tempdir().unwrap();
        let out_dir = tempdir().unwrap();
        let tcpdump = write_script(bin_dir.path(), "tcpdump", FAKE_TCPDUMP);

        let capturer = UnixCapturer::new(factory_with(tcpdump, None));
        let req = CaptureRequest {
            window: Duration::from_millis(50),
            output_dir: out_dir.path().to_path_buf(),
            interfaces: parse_interfaces("eth0,eth1").unwrap(),
        };

        let err = capturer
            .capture(CancellationToken::new(), &req)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::MergeToolMissing(2)));
    }

    #[tokio::test]
    async fn one_failed_interface_does_not_sink_an_otherwise_successful_iteration() {
        // Single-file "tcpdump" that fails immediately for the interface
        // named "bad" (via -i) and otherwise behaves like FAKE_TCPDUMP.
        const MIXED_TCPDUMP: &str = "#!/bin/sh\nout=\"\"\niface=\"\"\nwhile [ $# -gt 0 ]; do\n  case \"$1\" in\n    -w) out=\"$2\"; shift 2 ;;\n    -i) iface=\"$2\"; shift 2 ;;\n    *) shift ;;\n  esac\ndone\nif [ \"$iface\" = \"bad\" ]; then\n  exit 1\nfi\ntrap 'exit 0' TERM\ntouch \"$out\"\nwhile true; do sleep 0.05; done\n";

        let bin_dir = tempdir().unwrap();
        let out_dir = tempdir().unwrap();
        let tcpdump = write_script(bin_dir.path(), "tcpdump", MIXED_TCPDUMP);

        let capturer = UnixCapturer::new(factory_with(tcpdump, None));
        let req = CaptureRequest {
            window: Duration::from_millis(50),
            output_dir: out_dir.path().to_path_buf(),
            interfaces: parse_interfaces("good,bad").unwrap(),
        };

        let artifact = capturer
            .capture(CancellationToken::new(), &req)
            .await
            .unwrap();
        assert!(artifact.path.exists());
    }

    #[tokio::test]
    async fn all_interfaces_failing_is_capture_failed() {
        let bin_dir = tempdir().unwrap();
        let out_dir = tempdir().unwrap();
        let tcpdump = write_script(bin_dir.path(), "tcpdump", FAILING_TCPDUMP);

        let capturer = UnixCapturer::new(factory_with(tcpdump, None));
        let req = CaptureRequest {
            window: Duration::from_millis(50),
            output_dir: out_dir.path().to_path_buf(),
            interfaces: parse_interfaces("eth0,eth1").unwrap(),
        };

        let err = capturer
            .capture(CancellationToken::new(), &req)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::ToolFailed { .. }));
    }
}

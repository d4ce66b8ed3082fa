//! PulseAudio virtual sinks driven through `pactl`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::command::{check_tool, find_any_tool};
use crate::core::{AudioServer, AudioSink};
use crate::error::{MediaError, MediaResult};
use crate::poll::{poll_until, PollOutcome};

/// Suffix PulseAudio appends to a sink name for its monitor source.
pub const MONITOR_SUFFIX: &str = ".monitor";

/// Monitor source recording `sink_name`.
pub fn monitor_name(sink_name: &str) -> String {
    format!("{}{}", sink_name, MONITOR_SUFFIX)
}

/// One entry of `pactl list sink-inputs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkInput {
    pub index: u32,
    pub process_id: Option<u32>,
}

/// Parse the long form of `pactl list sink-inputs`.
pub fn parse_sink_inputs(output: &str) -> Vec<SinkInput> {
    let mut inputs = Vec::new();
    let mut current: Option<SinkInput> = None;

    for line in output.lines() {
        let line = line.trim();
        if let Some(index) = line.strip_prefix("Sink Input #") {
            if let Some(done) = current.take() {
                inputs.push(done);
            }
            current = index.trim().parse().ok().map(|index| SinkInput {
                index,
                process_id: None,
            });
        } else if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "application.process.id" {
                if let Some(input) = current.as_mut() {
                    input.process_id = value.trim().trim_matches('"').parse().ok();
                }
            }
        }
    }

    if let Some(done) = current {
        inputs.push(done);
    }
    inputs
}

/// Names in the first column of `pactl list short sinks`.
pub fn parse_short_sinks(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split('\t').nth(1))
        .map(|name| name.trim().to_string())
        .collect()
}

/// Index of the `module-null-sink` that created `sink_name`, from
/// `pactl list short modules`.
pub fn parse_null_sink_module(output: &str, sink_name: &str) -> Option<u32> {
    let wanted = format!("sink_name={}", sink_name);
    output.lines().find_map(|line| {
        let mut fields = line.split('\t');
        let index = fields.next()?.trim().parse().ok()?;
        if fields.next()?.trim() != "module-null-sink" {
            return None;
        }
        fields
            .next()?
            .split_whitespace()
            .any(|arg| arg == wanted)
            .then_some(index)
    })
}

/// Parent pid from the contents of `/proc/<pid>/stat`.
pub fn parse_ppid(stat: &str) -> Option<u32> {
    // comm may contain spaces and parentheses; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(1)?.parse().ok()
}

/// `root` plus every descendant, given a pid -> parent map.
pub fn descendants(root: u32, parents: &HashMap<u32, u32>) -> HashSet<u32> {
    let mut tree = HashSet::from([root]);
    loop {
        let before = tree.len();
        for (pid, ppid) in parents {
            if tree.contains(ppid) {
                tree.insert(*pid);
            }
        }
        if tree.len() == before {
            return tree;
        }
    }
}

fn process_parents() -> HashMap<u32, u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return HashMap::new();
    };

    entries
        .flatten()
        .filter_map(|entry| {
            let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
            let stat = std::fs::read_to_string(entry.path().join("stat")).ok()?;
            Some((pid, parse_ppid(&stat)?))
        })
        .collect()
}

/// Virtual sinks on a PulseAudio server.
pub struct PulseAudio {
    pactl: PathBuf,
    pulse_server: Option<String>,
    startup_timeout: Duration,
}

impl PulseAudio {
    /// Locate `pactl`; the server address comes from `PULSE_SERVER` if set.
    pub fn new(startup_timeout: Duration) -> MediaResult<Self> {
        Ok(Self {
            pactl: check_tool("pactl")?,
            pulse_server: std::env::var("PULSE_SERVER").ok().filter(|s| !s.is_empty()),
            startup_timeout,
        })
    }

    async fn pactl(&self, args: &[&str]) -> MediaResult<String> {
        let command = format!("pactl {}", args.join(" "));
        debug!("Running {}", command);

        let output = Command::new(&self.pactl)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MediaError::command_failed(command, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn server_running(&self) -> bool {
        self.pactl(&["info"]).await.is_ok()
    }

    /// Start a user daemon if none answers, then wait for it.
    async fn ensure_daemon(&self) -> MediaResult<()> {
        if self.server_running().await {
            return Ok(());
        }

        let daemon = find_any_tool(&["pulseaudio"])?;
        info!("No PulseAudio server answering, starting one");
        let status = Command::new(daemon)
            .args(["--start", "--exit-idle-time=-1"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            warn!(?status, "pulseaudio --start reported failure, waiting anyway");
        }

        let outcome = poll_until(Duration::from_millis(250), self.startup_timeout, None, || async move {
            self.server_running().await.then_some(())
        })
        .await;

        match outcome {
            PollOutcome::Ready(()) => Ok(()),
            _ => Err(MediaError::startup_timeout(
                "PulseAudio",
                self.startup_timeout.as_secs(),
            )),
        }
    }
}

#[async_trait]
impl AudioServer for PulseAudio {
    async fn setup(&self, sink_name: &str, skip_default: bool) -> MediaResult<AudioSink> {
        self.ensure_daemon().await?;

        let existing = parse_short_sinks(&self.pactl(&["list", "short", "sinks"]).await?);
        let module_id = if existing.iter().any(|s| s == sink_name) {
            // Left behind by an interrupted run; adopt it so cleanup removes it
            let modules = self.pactl(&["list", "short", "modules"]).await?;
            let module_id = parse_null_sink_module(&modules, sink_name);
            debug!(sink = sink_name, ?module_id, "Reusing existing sink");
            module_id
        } else {
            let sink_arg = format!("sink_name={}", sink_name);
            let props_arg = format!("sink_properties=device.description={}", sink_name);
            let out = self
                .pactl(&["load-module", "module-null-sink", &sink_arg, &props_arg])
                .await?;
            out.trim().parse().ok()
        };

        if !skip_default {
            self.pactl(&["set-default-sink", sink_name]).await?;
        }

        info!(sink = sink_name, default = !skip_default, ?module_id, "Audio sink ready");
        Ok(AudioSink {
            sink_name: sink_name.to_string(),
            monitor_name: monitor_name(sink_name),
            pulse_server: self.pulse_server.clone(),
            module_id,
        })
    }

    async fn cleanup(&self, sink: &AudioSink) -> MediaResult<()> {
        let Some(module_id) = sink.module_id else {
            return Ok(());
        };
        self.pactl(&["unload-module", &module_id.to_string()]).await?;
        debug!(sink = %sink.sink_name, module_id, "Audio sink removed");
        Ok(())
    }

    async fn route_browser_audio(&self, sink: &AudioSink, pid: u32) -> MediaResult<usize> {
        let inputs = parse_sink_inputs(&self.pactl(&["list", "sink-inputs"]).await?);
        let tree = descendants(pid, &process_parents());

        let mut moved = 0;
        for input in inputs {
            if !input.process_id.is_some_and(|p| tree.contains(&p)) {
                continue;
            }
            let index = input.index.to_string();
            self.pactl(&["move-sink-input", &index, &sink.sink_name]).await?;
            moved += 1;
        }

        debug!(sink = %sink.sink_name, pid, moved, "Routed browser audio");
        Ok(moved)
    }
}

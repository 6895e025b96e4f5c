//! Model routing by available accelerator memory.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::ProfileConfig;

/// Chooses the chat model for a profile.
pub trait RoutingPolicy: Send + Sync {
    /// Model name to use for `profile`.
    fn select_model(&self, profile: &ProfileConfig) -> String;
}

impl<F> RoutingPolicy for F
where
    F: Fn(&ProfileConfig) -> String + Send + Sync,
{
    fn select_model(&self, profile: &ProfileConfig) -> String {
        self(profile)
    }
}

/// A routing policy bound to one profile.
///
/// The turn loop asks for a model before every generation round, so a policy
/// that reacts to changing conditions takes effect mid-conversation.
#[derive(Clone)]
pub struct ModelRoute {
    policy: Arc<dyn RoutingPolicy>,
    profile: Arc<ProfileConfig>,
}

impl std::fmt::Debug for ModelRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRoute")
            .field("profile", &self.profile.name)
            .finish_non_exhaustive()
    }
}

impl ModelRoute {
    /// Route `profile` through `policy`.
    pub fn new(policy: Arc<dyn RoutingPolicy>, profile: ProfileConfig) -> Self {
        Self {
            policy,
            profile: Arc::new(profile),
        }
    }

    /// Always `model`.
    pub fn fixed(model: impl Into<String>) -> Self {
        let model = model.into();
        Self::new(
            Arc::new(move |_: &ProfileConfig| model.clone()),
            ProfileConfig::default(),
        )
    }

    /// Model for the next generation round.
    pub fn select(&self) -> String {
        self.policy.select_model(&self.profile)
    }
}

type VramProbe = Box<dyn Fn() -> Option<u64> + Send + Sync>;

/// Routes to the large model when the first GPU has at least
/// `llm.min_vram_gb` of memory, otherwise to the small model.
///
/// `llm.model_override` always wins. The probe runs at most once per router.
pub struct MemoryRouter {
    probe: VramProbe,
    vram_gb: OnceLock<Option<u64>>,
}

impl std::fmt::Debug for MemoryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRouter")
            .field("vram_gb", &self.vram_gb.get())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRouter {
    /// Router probing `nvidia-smi` (or the binary named by `NVIDIA_SMI`).
    pub fn new() -> Self {
        Self::with_probe(detect_gpu_vram_gb)
    }

    /// Router with a custom memory probe returning GiB.
    pub fn with_probe(probe: impl Fn() -> Option<u64> + Send + Sync + 'static) -> Self {
        Self {
            probe: Box::new(probe),
            vram_gb: OnceLock::new(),
        }
    }

    fn vram_gb(&self) -> Option<u64> {
        *self.vram_gb.get_or_init(|| {
            let detected = (self.probe)();
            debug!(vram_gb = ?detected, "accelerator memory probed");
            detected
        })
    }
}

impl RoutingPolicy for MemoryRouter {
    fn select_model(&self, profile: &ProfileConfig) -> String {
        let llm = &profile.llm;
        if let Some(model) = llm.model_override.as_deref().filter(|m| !m.is_empty()) {
            info!(profile = %profile.name, model, "using model override");
            return model.to_owned();
        }
        let model = match self.vram_gb() {
            Some(gb) if gb >= llm.min_vram_gb => &llm.large_model,
            _ => &llm.small_model,
        };
        info!(profile = %profile.name, model = %model, "model selected");
        model.clone()
    }
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Total memory of the first GPU in GiB, via `nvidia-smi`.
pub fn detect_gpu_vram_gb() -> Option<u64> {
    let binary = std::env::var("NVIDIA_SMI").unwrap_or_else(|_| "nvidia-smi".to_owned());
    let out = run_cmd_bounded(
        &binary,
        &["--query-gpu=memory.total", "--format=csv,noheader,nounits"],
        PROBE_TIMEOUT,
    )?;
    parse_vram_gb(&out)
}

/// Parse `nvidia-smi` MiB output (first line) into whole GiB.
pub fn parse_vram_gb(output: &str) -> Option<u64> {
    let mib: u64 = output.lines().next()?.trim().parse().ok()?;
    (mib > 0).then_some(mib / 1024)
}

fn run_cmd_bounded(program: &str, args: &[&str], timeout: Duration) -> Option<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;
    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(20)),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
        }
    };
    if !status.success() {
        return None;
    }
    let mut out = String::new();
    child.stdout.take()?.read_to_string(&mut out).ok()?;
    let trimmed = out.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

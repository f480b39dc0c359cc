//! Hardware probing and performance tuning.
//!
//! A probe runs once per process. Its readings are turned into a named
//! [`Profile`] and a resolved [`Tuning`] record through three layers:
//! base defaults, profile defaults, then explicit user overrides.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Command;
use tracing::{debug, info};

use crate::config::PerformanceOverrides;

/// Named hardware tier driving batch and worker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Profile {
    Ultra,
    High,
    Mid,
    Low,
    CpuOnly,
    Standard,
}

impl Profile {
    /// Profile for the detected device. VRAM boundaries are inclusive-lower.
    pub fn for_hardware(device: Device, vram_gb: f64) -> Self {
        if device != Device::Cuda {
            return Profile::CpuOnly;
        }
        if vram_gb >= 22.0 {
            Profile::Ultra
        } else if vram_gb >= 15.0 {
            Profile::High
        } else if vram_gb >= 10.0 {
            Profile::Mid
        } else {
            Profile::Low
        }
    }

    /// Parse a profile name; unknown names resolve to `Standard`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_uppercase().as_str() {
            "ULTRA" => Profile::Ultra,
            "HIGH" => Profile::High,
            "MID" => Profile::Mid,
            "LOW" => Profile::Low,
            "CPU_ONLY" => Profile::CpuOnly,
            _ => Profile::Standard,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Ultra => "ULTRA",
            Profile::High => "HIGH",
            Profile::Mid => "MID",
            Profile::Low => "LOW",
            Profile::CpuOnly => "CPU_ONLY",
            Profile::Standard => "STANDARD",
        }
    }

    /// Upper bound for the translation batch size.
    pub fn translation_ceiling(&self) -> usize {
        match self {
            Profile::Ultra => 32,
            Profile::High => 16,
            Profile::Mid => 8,
            Profile::Low => 4,
            Profile::CpuOnly => 1,
            Profile::Standard => 4,
        }
    }

    pub const ALL: [Profile; 6] = [
        Profile::Ultra,
        Profile::High,
        Profile::Mid,
        Profile::Low,
        Profile::CpuOnly,
        Profile::Standard,
    ];
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
        }
    }
}

/// Empirical constants of the batch-size formulas.
///
/// Tuned for a 3.3B-parameter seq2seq translation model and a large-v3
/// transcription model; recalibrate for other model sizes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConstants {
    /// VRAM reserved for the display and driver
    pub safety_margin_gb: f64,
    /// Floor of the usable VRAM estimate
    pub min_target_vram_gb: f64,
    pub translation_overhead_gb: f64,
    pub translation_per_item_gb: f64,
    /// Per-item cost once beams exceed `wide_beam_threshold`
    pub translation_per_item_wide_beam_gb: f64,
    pub wide_beam_threshold: u32,
    pub transcription_overhead_gb: f64,
    pub transcription_per_item_gb: f64,
}

impl Default for BatchConstants {
    fn default() -> Self {
        Self {
            safety_margin_gb: 4.0,
            min_target_vram_gb: 4.0,
            translation_overhead_gb: 8.1,
            translation_per_item_gb: 0.40,
            translation_per_item_wide_beam_gb: 0.80,
            wide_beam_threshold: 5,
            transcription_overhead_gb: 3.1,
            transcription_per_item_gb: 0.6,
        }
    }
}

impl BatchConstants {
    /// VRAM available to a model after the safety margin.
    pub fn target_vram(&self, vram_gb: f64) -> f64 {
        (vram_gb - self.safety_margin_gb).max(self.min_target_vram_gb)
    }

    /// Translation batch: `max(1, floor((target - overhead) / per_item))`,
    /// clamped to the profile ceiling.
    pub fn translation_batch(&self, profile: Profile, vram_gb: f64, num_beams: u32) -> usize {
        let per_item = if num_beams <= self.wide_beam_threshold {
            self.translation_per_item_gb
        } else {
            self.translation_per_item_wide_beam_gb
        };
        let raw = items_that_fit(self.target_vram(vram_gb), self.translation_overhead_gb, per_item);
        raw.min(profile.translation_ceiling())
    }

    /// Transcription batch, same shape as the translation formula, unclamped.
    pub fn transcription_batch(&self, vram_gb: f64) -> usize {
        items_that_fit(
            self.target_vram(vram_gb),
            self.transcription_overhead_gb,
            self.transcription_per_item_gb,
        )
    }
}

fn items_that_fit(target_gb: f64, overhead_gb: f64, per_item_gb: f64) -> usize {
    if per_item_gb <= 0.0 {
        return 1;
    }
    let items = ((target_gb - overhead_gb) / per_item_gb).floor();
    if items.is_finite() && items >= 1.0 {
        items as usize
    } else {
        1
    }
}

/// Transcription worker count in three VRAM bands.
pub fn transcription_workers(profile: Profile, vram_gb: f64) -> usize {
    if vram_gb >= 24.0 {
        if profile == Profile::Ultra { 10 } else { 5 }
    } else if vram_gb >= 10.0 {
        4
    } else {
        1
    }
}

/// Resolved, immutable tuning record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuning {
    pub device: Device,
    pub whisper_beam: u32,
    pub whisper_compute: String,
    pub whisper_workers: usize,
    pub whisper_batch: usize,
    pub translation_batch: usize,
    pub ffmpeg_threads: usize,
}

impl Tuning {
    fn base(device: Device, cpu_cores: usize, profile: Profile) -> Self {
        Self {
            device,
            whisper_beam: 5,
            whisper_compute: "float16".to_string(),
            whisper_workers: 1,
            whisper_batch: 1,
            translation_batch: 16.min(profile.translation_ceiling()),
            ffmpeg_threads: cpu_cores.saturating_sub(2).max(1),
        }
    }
}

/// A partial set of tuning values; `None` leaves the lower layer untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TuningLayer {
    pub whisper_beam: Option<u32>,
    pub whisper_compute: Option<String>,
    pub whisper_workers: Option<usize>,
    pub whisper_batch: Option<usize>,
    pub translation_batch: Option<usize>,
    pub ffmpeg_threads: Option<usize>,
}

impl TuningLayer {
    pub fn apply(&self, tuning: &mut Tuning) {
        if let Some(v) = self.whisper_beam {
            tuning.whisper_beam = v;
        }
        if let Some(v) = &self.whisper_compute {
            tuning.whisper_compute = v.clone();
        }
        if let Some(v) = self.whisper_workers {
            tuning.whisper_workers = v;
        }
        if let Some(v) = self.whisper_batch {
            tuning.whisper_batch = v;
        }
        if let Some(v) = self.translation_batch {
            tuning.translation_batch = v;
        }
        if let Some(v) = self.ffmpeg_threads {
            tuning.ffmpeg_threads = v;
        }
    }

    /// Profile defaults derived from the batch formulas.
    pub fn for_profile(
        profile: Profile,
        vram_gb: f64,
        cpu_cores: usize,
        num_beams: u32,
        constants: &BatchConstants,
    ) -> Self {
        let translation = constants.translation_batch(profile, vram_gb, num_beams);
        let transcription = constants.transcription_batch(vram_gb);
        let workers = transcription_workers(profile, vram_gb);

        match profile {
            Profile::Ultra => Self {
                whisper_beam: Some(5),
                whisper_compute: Some("float16".to_string()),
                whisper_workers: Some(workers),
                // sequential decoding for accuracy
                whisper_batch: Some(1),
                translation_batch: Some(translation),
                ffmpeg_threads: Some(cpu_cores),
            },
            Profile::High => Self {
                whisper_beam: Some(5),
                whisper_compute: Some("float16".to_string()),
                whisper_workers: Some((workers / 2).max(1)),
                whisper_batch: Some((transcription / 2).max(1)),
                translation_batch: Some((translation / 2).max(1)),
                ffmpeg_threads: Some(cpu_cores),
            },
            Profile::Mid => Self {
                whisper_beam: Some(5),
                whisper_workers: Some(1),
                translation_batch: Some(translation),
                ..Self::default()
            },
            Profile::Low => Self {
                whisper_beam: Some(5),
                whisper_compute: Some("int8_float16".to_string()),
                translation_batch: Some(1),
                ..Self::default()
            },
            Profile::CpuOnly => Self {
                whisper_beam: Some(5),
                whisper_compute: Some("int8".to_string()),
                translation_batch: Some(1),
                ffmpeg_threads: Some(4),
                ..Self::default()
            },
            Profile::Standard => Self::default(),
        }
    }
}

impl From<&PerformanceOverrides> for TuningLayer {
    fn from(overrides: &PerformanceOverrides) -> Self {
        Self {
            whisper_beam: overrides.whisper_beam,
            whisper_compute: None,
            whisper_workers: overrides.whisper_workers,
            whisper_batch: overrides.whisper_batch,
            translation_batch: overrides.translation_batch,
            ffmpeg_threads: overrides.ffmpeg_threads,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpuInfo {
    pub name: String,
    pub vram_gb: f64,
}

/// Raw probe output before any tuning decision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReadings {
    pub gpu: Option<GpuInfo>,
    pub cpu_cores: Option<usize>,
}

impl ProbeReadings {
    /// Query the machine. Never fails; missing readings stay `None`.
    pub fn detect(force_cpu: bool) -> Self {
        let cpu_cores = std::thread::available_parallelism().ok().map(|n| n.get());
        let gpu = if force_cpu || cuda_hidden() {
            debug!("Accelerator disabled, probing CPU only");
            None
        } else {
            detect_gpu()
        };
        Self { gpu, cpu_cores }
    }
}

fn cuda_hidden() -> bool {
    match std::env::var("CUDA_VISIBLE_DEVICES") {
        Ok(v) => v.trim().is_empty() || v.trim() == "-1",
        Err(_) => false,
    }
}

fn detect_gpu() -> Option<GpuInfo> {
    let output = Command::new("nvidia-smi")
        .arg("--query-gpu=name,memory.total")
        .arg("--format=csv,noheader,nounits")
        .output();

    match output {
        Ok(output) if output.status.success() => {
            parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(_) => {
            debug!("nvidia-smi returned an error, assuming no GPU");
            None
        }
        Err(e) => {
            debug!("nvidia-smi not available ({}), assuming no GPU", e);
            None
        }
    }
}

/// Parse the first `name, memory_mib` line of an `nvidia-smi` CSV query.
pub fn parse_nvidia_smi(output: &str) -> Option<GpuInfo> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (name, mem) = line.rsplit_once(',')?;
    let mib: f64 = mem.trim().parse().ok()?;
    if !mib.is_finite() || mib <= 0.0 {
        return None;
    }
    let vram_gb = (mib / 1024.0 * 100.0).round() / 100.0;
    Some(GpuInfo {
        name: name.trim().to_string(),
        vram_gb,
    })
}

/// Immutable description of the machine plus its resolved tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct HardwareProfile {
    pub device: Device,
    pub gpu_name: String,
    pub vram_gb: f64,
    pub cpu_cores: usize,
    pub profile: Profile,
    pub tuning: Tuning,
}

impl HardwareProfile {
    /// Probe the machine and resolve tuning against the user's overrides.
    pub fn probe(overrides: &PerformanceOverrides, translation_beams: u32) -> Self {
        let readings = ProbeReadings::detect(overrides.force_cpu);
        Self::from_readings(&readings, overrides, translation_beams)
    }

    pub fn from_readings(
        readings: &ProbeReadings,
        overrides: &PerformanceOverrides,
        translation_beams: u32,
    ) -> Self {
        let cpu_cores = readings.cpu_cores.filter(|c| *c > 0).unwrap_or(1);
        let (device, gpu_name, vram_gb) = match &readings.gpu {
            Some(gpu) if gpu.vram_gb.is_finite() && gpu.vram_gb > 0.0 => {
                (Device::Cuda, gpu.name.clone(), gpu.vram_gb)
            }
            _ => (Device::Cpu, "None".to_string(), 0.0),
        };

        let profile = match overrides.profile.as_deref() {
            Some(name) => Profile::from_name(name),
            None => Profile::for_hardware(device, vram_gb),
        };

        let mut tuning = Tuning::base(device, cpu_cores, profile);
        TuningLayer::for_profile(
            profile,
            vram_gb,
            cpu_cores,
            translation_beams,
            &overrides.batch_constants,
        )
        .apply(&mut tuning);
        TuningLayer::from(overrides).apply(&mut tuning);

        Self {
            device,
            gpu_name,
            vram_gb,
            cpu_cores,
            profile,
            tuning,
        }
    }

    pub fn log_summary(&self) {
        info!("Hardware: {} CPU cores, GPU: {} ({} GB VRAM)", self.cpu_cores, self.gpu_name, self.vram_gb);
        info!(
            "Profile {}: translation batch {}, whisper beam {} / batch {} / workers {} ({}), ffmpeg threads {}",
            self.profile,
            self.tuning.translation_batch,
            self.tuning.whisper_beam,
            self.tuning.whisper_batch,
            self.tuning.whisper_workers,
            self.tuning.whisper_compute,
            self.tuning.ffmpeg_threads
        );
    }
}

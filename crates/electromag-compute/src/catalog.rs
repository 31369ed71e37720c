//! Device discovery.
//!
//! A [`DeviceCatalog`] asks a [`PlatformProbe`] for the available platforms
//! once and caches the result. Every later query reads the snapshot, so the
//! device list cannot change between partitioning and dispatch.

use std::fmt::Write as _;
use std::sync::OnceLock;

use crate::backend::{ComputeError, DeviceDescriptor};

/// A group of devices exposed through one platform API.
#[derive(Debug, Clone, PartialEq)]
pub struct Platform {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub devices: Vec<DeviceDescriptor>,
}

/// Source of platform and device information.
pub trait PlatformProbe: Send + Sync {
    fn query(&self) -> Result<Vec<Platform>, ComputeError>;
}

/// A probe that reports a fixed platform list.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    platforms: Vec<Platform>,
}

impl StaticProbe {
    pub fn new(platforms: Vec<Platform>) -> Self {
        Self { platforms }
    }

    /// A probe that finds nothing.
    pub fn empty() -> Self {
        Self::default()
    }
}

impl PlatformProbe for StaticProbe {
    fn query(&self) -> Result<Vec<Platform>, ComputeError> {
        Ok(self.platforms.clone())
    }
}

/// Cached snapshot of the machine's compute devices.
pub struct DeviceCatalog {
    probe: Box<dyn PlatformProbe>,
    snapshot: OnceLock<Vec<Platform>>,
}

impl std::fmt::Debug for DeviceCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCatalog")
            .field("snapshot", &self.snapshot.get())
            .finish_non_exhaustive()
    }
}

impl DeviceCatalog {
    pub fn new(probe: impl PlatformProbe + 'static) -> Self {
        Self {
            probe: Box::new(probe),
            snapshot: OnceLock::new(),
        }
    }

    /// Catalog of the accelerators visible to this build.
    ///
    /// Without the `gpu` feature there are none and every run uses the CPU.
    pub fn system() -> Self {
        #[cfg(feature = "gpu")]
        {
            Self::new(crate::gpu::WgpuProbe)
        }
        #[cfg(not(feature = "gpu"))]
        {
            Self::new(StaticProbe::empty())
        }
    }

    /// Run the probe if no snapshot exists yet.
    ///
    /// Safe to call from several threads: exactly one runs the probe, the
    /// others wait for and share its result. A failing probe is logged and
    /// leaves an empty catalog.
    pub fn scan(&self) {
        self.snapshot();
    }

    pub fn is_scanned(&self) -> bool {
        self.snapshot.get().is_some()
    }

    fn snapshot(&self) -> &[Platform] {
        self.snapshot.get_or_init(|| match self.probe.query() {
            Ok(mut platforms) => {
                let mut id = 0;
                for device in platforms.iter_mut().flat_map(|p| p.devices.iter_mut()) {
                    device.id = id;
                    id += 1;
                }
                log::info!(
                    "Device scan found {} platform(s), {} device(s)",
                    platforms.len(),
                    id
                );
                platforms
            }
            Err(e) => {
                log::warn!("{}; continuing without accelerators", e);
                Vec::new()
            }
        })
    }

    pub fn platforms(&self) -> &[Platform] {
        self.snapshot()
    }

    /// All devices in enumeration order.
    pub fn list_devices(&self) -> Vec<DeviceDescriptor> {
        self.snapshot()
            .iter()
            .flat_map(|p| p.devices.iter().cloned())
            .collect()
    }

    pub fn device_count(&self) -> usize {
        self.snapshot().iter().map(|p| p.devices.len()).sum()
    }

    /// Platforms and devices whose names contain `substring`.
    ///
    /// A platform whose own name matches keeps all of its devices; any other
    /// platform keeps only the matching devices and is dropped if none
    /// match. Matching is case-sensitive. An empty substring matches
    /// everything.
    pub fn filter_by_name(&self, substring: &str) -> Vec<Platform> {
        self.snapshot()
            .iter()
            .filter_map(|p| {
                if p.name.contains(substring) {
                    return Some(p.clone());
                }
                let devices: Vec<DeviceDescriptor> = p
                    .devices
                    .iter()
                    .filter(|d| d.name.contains(substring))
                    .cloned()
                    .collect();
                (!devices.is_empty()).then(|| Platform {
                    devices,
                    ..p.clone()
                })
            })
            .collect()
    }
}

/// Human-readable listing of platforms and their devices.
pub fn describe_catalog(platforms: &[Platform]) -> String {
    let mut out = String::new();
    if platforms.is_empty() {
        out.push_str("No accelerator platforms found\n");
        return out;
    }
    for p in platforms {
        let _ = writeln!(out, "Platform: {}", p.name);
        if !p.vendor.is_empty() {
            let _ = writeln!(out, "  Vendor:  {}", p.vendor);
        }
        if !p.version.is_empty() {
            let _ = writeln!(out, "  Version: {}", p.version);
        }
        for d in &p.devices {
            let _ = writeln!(out, "  [{}] {} ({})", d.id, d.name, d.class);
            let _ = writeln!(
                out,
                "      {} compute units @ {} MHz, vector width {}",
                d.compute_units, d.clock_mhz, d.vector_width
            );
            let _ = writeln!(
                out,
                "      memory {} MB, max work group {}, fp64 {}, unified memory {}",
                d.memory_bytes / (1024 * 1024),
                d.max_work_group_size,
                if d.features.double_precision { "yes" } else { "no" },
                if d.features.unified_memory { "yes" } else { "no" }
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceClass, DeviceFeatures, ErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn device(name: &str, platform: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            id: 0,
            name: name.into(),
            vendor: String::new(),
            platform: platform.into(),
            class: DeviceClass::Accelerator,
            compute_units: 8,
            clock_mhz: 1000,
            vector_width: 4,
            memory_bytes: 1 << 30,
            max_work_group_size: 256,
            features: DeviceFeatures::default(),
            adapter_index: None,
        }
    }

    fn platform(name: &str, devices: &[&str]) -> Platform {
        Platform {
            name: name.into(),
            vendor: String::new(),
            version: String::new(),
            devices: devices.iter().map(|d| device(d, name)).collect(),
        }
    }

    struct CountingProbe(Arc<AtomicUsize>);

    impl PlatformProbe for CountingProbe {
        fn query(&self) -> Result<Vec<Platform>, ComputeError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(vec![platform("Vulkan", &["GPU A"])])
        }
    }

    struct FailingProbe;

    impl PlatformProbe for FailingProbe {
        fn query(&self) -> Result<Vec<Platform>, ComputeError> {
            Err(ComputeError::new(ErrorKind::DeviceScanFailure, "driver missing"))
        }
    }

    #[test]
    fn test_scan_runs_probe_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let catalog = DeviceCatalog::new(CountingProbe(calls.clone()));
        assert!(!catalog.is_scanned());
        catalog.scan();
        catalog.scan();
        assert_eq!(catalog.list_devices().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_scans_share_snapshot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let catalog = DeviceCatalog::new(CountingProbe(calls.clone()));
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| catalog.scan());
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(catalog.device_count(), 1);
    }

    #[test]
    fn test_probe_failure_degrades_to_empty() {
        let catalog = DeviceCatalog::new(FailingProbe);
        catalog.scan();
        assert!(catalog.is_scanned());
        assert!(catalog.platforms().is_empty());
        assert!(catalog.list_devices().is_empty());
    }

    #[test]
    fn test_ids_follow_enumeration_order() {
        let catalog = DeviceCatalog::new(StaticProbe::new(vec![
            platform("Vulkan", &["GPU A", "GPU B"]),
            platform("Gl", &["GPU C"]),
        ]));
        let ids: Vec<usize> = catalog.list_devices().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_filter_by_platform_keeps_all_devices() {
        let catalog = DeviceCatalog::new(StaticProbe::new(vec![
            platform("Vulkan", &["GeForce", "Radeon"]),
            platform("Gl", &["Radeon"]),
        ]));
        let found = catalog.filter_by_name("Vulkan");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].devices.len(), 2);
    }

    #[test]
    fn test_filter_by_device_name() {
        let catalog = DeviceCatalog::new(StaticProbe::new(vec![
            platform("Vulkan", &["GeForce", "Radeon"]),
            platform("Gl", &["Radeon"]),
        ]));
        let found = catalog.filter_by_name("Radeon");
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| p.devices.len() == 1));

        assert!(catalog.filter_by_name("radeon").is_empty());
        assert_eq!(catalog.filter_by_name("").len(), 2);
    }

    #[test]
    fn test_describe_lists_devices() {
        let text = describe_catalog(&[platform("Vulkan", &["GPU A"])]);
        assert!(text.contains("Platform: Vulkan"));
        assert!(text.contains("GPU A (accelerator)"));
        assert!(describe_catalog(&[]).contains("No accelerator"));
    }
}

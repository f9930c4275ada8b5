// Copyright 2023 Oxide Computer Company
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sep::{Array, ArrayConfig, DriveLayout, NodeConfig, SchedulerConfig};
use sep_common::{read_toml, SepError};
use serde::{Deserialize, Serialize};
use slog::{info, o, Logger};

use crate::node_handle::NodeHandle;

/// Everything a test run can be tuned with
///
/// Loaded from TOML; any field left out takes its default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSessionConfig {
    /// Run both SPs with a link between them
    pub dualsp: bool,
    /// Workloads that support it inject media errors while they run
    pub error_injection: bool,
    pub chunks_per_rebuild: u32,
    /// Seeds position selection for random removal
    pub seed: u64,

    pub poll_interval_ms: u64,
    pub quiesce_poll_interval_ms: u64,
    pub job_timeout_secs: u64,
    pub quiesce_timeout_secs: u64,
    pub rebuild_timeout_secs: u64,
    pub verify_timeout_secs: u64,

    pub monitor_interval_ms: u64,
    pub update_peer_checkpoint_interval_ms: u64,
    pub chunk_size: u64,
    pub permanent_spare_trigger_secs: Option<u64>,
    pub glitch_debounce_ms: u64,

    pub buses: u32,
    pub enclosures: u32,
    pub slots: u32,
    pub drive_capacity: u64,
}

impl Default for TestSessionConfig {
    fn default() -> Self {
        let node = NodeConfig::default();
        let drives = DriveLayout::default();
        TestSessionConfig {
            dualsp: false,
            error_injection: false,
            chunks_per_rebuild: 1,
            seed: 0,
            poll_interval_ms: 100,
            quiesce_poll_interval_ms: 500,
            job_timeout_secs: 60,
            quiesce_timeout_secs: 30,
            rebuild_timeout_secs: 600,
            verify_timeout_secs: 600,
            monitor_interval_ms: node.monitor_interval.as_millis() as u64,
            update_peer_checkpoint_interval_ms: node
                .update_peer_checkpoint_interval
                .as_millis() as u64,
            chunk_size: node.chunk_size,
            permanent_spare_trigger_secs: None,
            glitch_debounce_ms: node.scheduler.glitch_debounce.as_millis()
                as u64,
            buses: drives.buses,
            enclosures: drives.enclosures,
            slots: drives.slots,
            drive_capacity: drives.capacity,
        }
    }
}

impl TestSessionConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        read_toml(path)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn quiesce_poll_interval(&self) -> Duration {
        Duration::from_millis(self.quiesce_poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn quiesce_timeout(&self) -> Duration {
        Duration::from_secs(self.quiesce_timeout_secs)
    }

    pub fn rebuild_timeout(&self) -> Duration {
        Duration::from_secs(self.rebuild_timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn update_peer_checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.update_peer_checkpoint_interval_ms)
    }

    /// Engine configuration for this session
    ///
    /// Fails if any value is outside what the engine accepts.
    pub fn array_config(&self) -> Result<ArrayConfig, SepError> {
        let mut scheduler = SchedulerConfig::default();
        scheduler.permanent_spare_trigger =
            self.permanent_spare_trigger_secs.map(Duration::from_secs);
        scheduler.glitch_debounce =
            Duration::from_millis(self.glitch_debounce_ms);
        scheduler.set_chunks_per_rebuild(self.chunks_per_rebuild)?;
        let node = NodeConfig {
            monitor_interval: Duration::from_millis(self.monitor_interval_ms),
            update_peer_checkpoint_interval: self
                .update_peer_checkpoint_interval(),
            chunk_size: self.chunk_size,
            scheduler,
        };
        node.validate()?;
        Ok(ArrayConfig {
            dualsp: self.dualsp,
            node,
            drives: DriveLayout {
                buses: self.buses,
                enclosures: self.enclosures,
                slots: self.slots,
                capacity: self.drive_capacity,
            },
        })
    }

    pub fn rng(&self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed)
    }
}

/// A running array plus the configuration and randomness a test uses
pub struct TestSession {
    pub cfg: TestSessionConfig,
    pub array: Array,
    pub nodes: NodeHandle,
    pub rng: ChaCha8Rng,
    pub log: Logger,
}

impl TestSession {
    /// Start an array; must be called from inside a tokio runtime
    pub fn start(
        cfg: TestSessionConfig,
        log: &Logger,
    ) -> Result<Self, SepError> {
        let array = Array::start(cfg.array_config()?, log)?;
        let log = log.new(o!("session" => array.id().to_string()));
        let nodes = NodeHandle::new(&array, &log);
        info!(
            log,
            "test session started";
            "dualsp" => cfg.dualsp,
            "seed" => cfg.seed,
            "chunks_per_rebuild" => cfg.chunks_per_rebuild
        );
        Ok(TestSession {
            rng: cfg.rng(),
            cfg,
            array,
            nodes,
            log,
        })
    }

    pub async fn shutdown(self) {
        let TestSession {
            array, nodes, log, ..
        } = self;
        drop(nodes);
        array.shutdown().await;
        info!(log, "test session done");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::Rng;
    use sep_common::build_logger;
    use std::io::Write;

    #[test]
    fn partial_toml_takes_defaults() {
        let cfg: TestSessionConfig = toml::from_str(
            r#"
            dualsp = true
            chunks_per_rebuild = 4
            seed = 7
            "#,
        )
        .unwrap();
        assert!(cfg.dualsp);
        assert_eq!(cfg.chunks_per_rebuild, 4);
        assert_eq!(cfg.quiesce_poll_interval(), Duration::from_millis(500));
        assert_eq!(cfg.rebuild_timeout(), Duration::from_secs(600));
        assert_eq!(cfg.quiesce_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "error_injection = true").unwrap();
        writeln!(f, "permanent_spare_trigger_secs = 5").unwrap();
        let cfg = TestSessionConfig::from_file(f.path()).unwrap();
        assert!(cfg.error_injection);
        let ac = cfg.array_config().unwrap();
        assert_eq!(
            ac.node.scheduler.permanent_spare_trigger,
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn bad_values_are_refused() {
        let cfg = TestSessionConfig {
            chunks_per_rebuild: 0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.array_config(),
            Err(SepError::InvalidArgument(_))
        ));
        let cfg = TestSessionConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.array_config(),
            Err(SepError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn same_seed_same_sequence() {
        let cfg = TestSessionConfig {
            seed: 42,
            ..Default::default()
        };
        let mut r1 = cfg.rng();
        let mut r2 = cfg.rng();
        let b: Vec<u32> = (0..8).map(|_| r1.gen()).collect();
        let c: Vec<u32> = (0..8).map(|_| r2.gen()).collect();
        assert_eq!(b, c);
    }

    #[tokio::test(start_paused = true)]
    async fn session_starts_and_stops() {
        let cfg = TestSessionConfig {
            dualsp: true,
            ..Default::default()
        };
        let s = TestSession::start(cfg, &build_logger()).unwrap();
        assert!(s.array.is_dualsp());
        assert!(s.nodes.peer().is_some());
        s.shutdown().await;
    }
}

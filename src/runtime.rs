use crate::config::RuntimeConfig;
use crate::persistence::PersistError;
use crate::tether::Tether;
use crate::world::WorldEngine;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use web_time::Instant;

/// A restored [`Tether`] plus the maintenance thread that drives it.
///
/// Every `tick_interval` the thread drops expired correlation entries,
/// requests a sweep of every world once `sweep_interval` elapsed, and saves
/// the registry if it is dirty once `save_interval` elapsed. Shutdown stops
/// the thread, waits for the in-flight save and writes final state.
pub struct TetherRuntime {
    tether: Arc<Tether>,
    shutdown: Arc<AtomicBool>,
    maintenance: Option<JoinHandle<()>>,
}

impl TetherRuntime {
    pub fn start(config: RuntimeConfig, engine: Arc<dyn WorldEngine>) -> Result<Self, PersistError> {
        let tether = Arc::new(Tether::new(config, engine));
        tether.restore()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let maintenance = start_maintenance_thread(Arc::clone(&tether), Arc::clone(&shutdown))?;
        Ok(Self {
            tether,
            shutdown,
            maintenance: Some(maintenance),
        })
    }

    pub fn tether(&self) -> &Arc<Tether> {
        &self.tether
    }

    pub fn shutdown(mut self) -> Result<(), PersistError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), PersistError> {
        let Some(handle) = self.maintenance.take() else {
            return Ok(());
        };
        self.shutdown.store(true, Ordering::Relaxed);
        if handle.join().is_err() {
            log::warn!("maintenance thread panicked");
        }
        self.tether.save_sync()?;
        log::info!(
            "tether shut down with {} identities",
            self.tether.registry().len()
        );
        Ok(())
    }
}

impl Drop for TetherRuntime {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            log::warn!("final save failed: {}", error);
        }
    }
}

fn start_maintenance_thread(
    tether: Arc<Tether>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    let config = tether.config().clone();
    let interval = config.tick_interval();
    let sweep_interval = config.sweep_interval();
    let save_interval = config.save_interval();
    thread::Builder::new()
        .name("tether-maintenance".to_string())
        .spawn(move || {
            let mut last_sweep = Instant::now();
            let mut last_save = Instant::now();
            while !shutdown.load(Ordering::Relaxed) {
                thread::sleep(interval);
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let now = Instant::now();
                let expired = tether.sweep_correlations(now);
                if expired > 0 {
                    log::trace!("expired {} correlation entries", expired);
                }
                if now.duration_since(last_sweep) >= sweep_interval {
                    last_sweep = now;
                    tether.request_sweeps();
                }
                if now.duration_since(last_save) >= save_interval {
                    last_save = now;
                    tether.save_if_dirty();
                }
            }
        })
}

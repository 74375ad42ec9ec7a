//! Daemon core logic.
//!
//! Opens the slot manager over the simulated pipeline, optionally installs
//! and starts the boot configuration, drives simulated frames and serves
//! control connections until stopped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ipu_core::protocol::{Connection, serve_connection};
use ipu_core::{IpuDevice, SimFrameSource, SimHardware};

use crate::config::DaemonConfig;

// ── DaemonService ────────────────────────────────────────────────

/// The top-level daemon service.
pub struct DaemonService {
    config: DaemonConfig,
    running: Arc<AtomicBool>,
}

impl DaemonService {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Bind the control listener and run until stopped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.config.control.listen_addr, self.config.control.port
        )
        .parse()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Run on an already bound listener until stopped.
    ///
    /// 1. Opens the device over a simulated pipeline.
    /// 2. Installs and starts `[pipeline]` when `autostart` is set.
    /// 3. Spawns the simulated frame source.
    /// 4. Accepts control connections, one task each.
    /// 5. Stops the pipeline when `running` becomes `false`.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        self.running.store(true, Ordering::SeqCst);

        let geometry = self.config.geometry()?;
        let hw = Arc::new(SimHardware::new(geometry.base, geometry.size));
        let device = Arc::new(IpuDevice::open(hw.clone(), geometry));

        if self.config.control.autostart {
            device.init(self.config.pipeline.clone())?;
            device.start()?;
        }

        let cancel = CancellationToken::new();
        let source = self.config.simulation.enabled.then(|| {
            SimFrameSource::new(hw, device.interrupt_line(), self.config.simulation.fps)
                .with_drop_every(self.config.simulation.drop_every)
                .spawn(cancel.child_token())
        });

        info!("control listening on {}", listener.local_addr()?);

        while self.running.load(Ordering::SeqCst) {
            let accept = tokio::select! {
                result = listener.accept() => result,
                _ = Self::wait_for_stop(&self.running) => break,
            };

            match accept {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("set_nodelay failed for {peer}: {e}");
                    }
                    let device = Arc::clone(&device);
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = serve_connection(Connection::new(stream), device) => {}
                            _ = cancel.cancelled() => {}
                        }
                    });
                }
                Err(e) => warn!("accept error: {e}"),
            }
        }

        cancel.cancel();
        if let Some(source) = source {
            if let Err(e) = source.await {
                error!("frame source failed: {e}");
            }
        }
        device.shutdown().await;

        self.running.store(false, Ordering::SeqCst);
        info!("daemon stopped");
        Ok(())
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ipu_core::{ConnectionInfo, ControlClient, PipelinePhase, WakeReason};

    #[test]
    fn service_creates_stopped() {
        let svc = DaemonService::new(DaemonConfig::default());
        assert!(!svc.is_running());
        svc.stop_handle().store(true, Ordering::SeqCst);
        assert!(svc.is_running());
        svc.stop();
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn serves_simulated_frames_until_stopped() {
        let mut config = DaemonConfig::default();
        config.simulation.fps = 200;
        let svc = Arc::new(DaemonService::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let info = ConnectionInfo::from(listener.local_addr().unwrap());
        let handle = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.serve(listener).await.map_err(|e| e.to_string()) })
        };

        let client = ControlClient::connect(&info).await.unwrap();
        assert_eq!(client.status().await.unwrap().phase, PipelinePhase::Running);
        let reason = tokio::time::timeout(Duration::from_secs(5), client.wait_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, WakeReason::SlotDone);
        let desc = client.fetch_done_descriptor().await.unwrap().unwrap();
        client.acknowledge(desc.slot_id).await.unwrap();

        svc.stop();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn bad_pool_fails_fast() {
        let mut config = DaemonConfig::default();
        config.pool.slot_size = 100;
        let svc = DaemonService::new(config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(svc.serve(listener).await.is_err());
    }
}

//! Process-level wiring: lock, transport, viewer endpoint and the mesh engine.
//!
//! Everything that can fail at startup happens in [`MeshNode::start`]; once running,
//! nothing short of a shutdown signal stops the node.
use crate::config::Config;
use crate::mesh::transport::SharedTransport;
use crate::mesh::{MeshEngine, MeshHandle, MeshTasks};
use crate::storage::lock::InstanceLock;
use crate::storage::SnapshotFile;
use crate::viewer::ViewerHub;
use anyhow::Result;
use log::info;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct MeshNode {
    handle: MeshHandle,
    tasks: MeshTasks,
    viewer: Option<JoinHandle<()>>,
    // Held for the life of the node, released on drop
    _lock: Option<InstanceLock>,
}

impl MeshNode {
    /// Acquire the instance lock, open the configured serial port and start.
    pub async fn start(config: Config) -> Result<Self> {
        let lock = InstanceLock::acquire(&config.lock.path)?;
        let transport = open_transport(&config)?;
        let mut node = Self::start_with_transport(config, transport).await?;
        node._lock = Some(lock);
        Ok(node)
    }

    /// Start on an already opened transport without taking the instance lock.
    pub async fn start_with_transport(config: Config, transport: SharedTransport) -> Result<Self> {
        config.validate()?;

        let mut engine = MeshEngine::new(config.self_state(), transport, config.mesh.timing());

        let viewer = if config.viewer.enabled {
            let listener = ViewerHub::bind(&config.viewer.bind).await?;
            let hub = ViewerHub::new();
            engine = engine.with_publisher(Arc::new(hub.clone()));
            Some((hub, listener))
        } else {
            None
        };
        if config.persist.enabled {
            info!("Persisting mesh snapshots to {}", config.persist.path);
            engine = engine.with_persister(Arc::new(SnapshotFile::new(&config.persist.path)));
        }

        let handle = engine.handle();
        let viewer = viewer.map(|(hub, listener)| tokio::spawn(hub.serve(listener, handle.clone())));
        let tasks = engine.spawn();

        Ok(Self {
            handle,
            tasks,
            viewer,
            _lock: None,
        })
    }

    pub fn handle(&self) -> MeshHandle {
        self.handle.clone()
    }

    /// Run until SIGINT/SIGTERM, then stop all tasks.
    pub async fn run(self) -> Result<()> {
        wait_for_signal().await;
        info!("Shutting down...");
        self.shutdown().await;
        Ok(())
    }

    pub async fn shutdown(self) {
        self.handle.shutdown();
        self.tasks.join().await;
        if let Some(viewer) = self.viewer {
            let _ = viewer.await;
        }
        info!("Mesh node stopped");
    }
}

#[cfg(feature = "serial")]
fn open_transport(config: &Config) -> Result<SharedTransport> {
    use crate::mesh::transport::{self, SerialTransport};
    let port = SerialTransport::open(&config.transport.port, config.transport.baud_rate)?;
    info!(
        "Opened serial port {} at {} baud",
        config.transport.port, config.transport.baud_rate
    );
    Ok(transport::shared(port))
}

#[cfg(not(feature = "serial"))]
fn open_transport(config: &Config) -> Result<SharedTransport> {
    anyhow::bail!(
        "Cannot open {}: serial support not compiled in (enable the 'serial' feature)",
        config.transport.port
    )
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                _ = term.recv() => info!("Received SIGTERM"),
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received shutdown signal");
}

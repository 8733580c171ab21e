//! Link to the local render agent.
//!
//! The agent is a separate headless process that hosts the actual renderer.
//! It connects to a Unix-domain socket named `SmallRenderAgent_<node_id>`
//! in the node's app-data directory; frames are u32 little-endian length
//! prefixed JSON. One agent connection is serviced at a time.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::logging::MonitorLog;
use crate::render::messages::{AgentToMonitor, MonitorToAgent};

/// Frames above this are a protocol violation; the connection is dropped.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

const PING_INTERVAL: Duration = Duration::from_secs(5);

pub struct AgentLink {
    socket_path: PathBuf,
    node_id: String,
    log: Arc<MonitorLog>,
    connected: AtomicBool,
    agent_pid: AtomicU32,
    outbound: mpsc::UnboundedSender<MonitorToAgent>,
    child: Mutex<Option<tokio::process::Child>>,
}

impl AgentLink {
    /// Bind the socket and start the accept/IO task. Returns the link and
    /// the inbound message stream for the main loop.
    pub fn start(
        app_data_dir: &Path,
        node_id: &str,
        log: Arc<MonitorLog>,
        cancel: CancellationToken,
    ) -> crate::Result<(Arc<Self>, mpsc::UnboundedReceiver<AgentToMonitor>)> {
        let socket_path = app_data_dir.join(format!("SmallRenderAgent_{node_id}.sock"));
        // A stale socket file from a crashed run blocks the bind.
        let _ = std::fs::remove_file(&socket_path);

        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| crate::FarmError::AgentIpc(format!("bind {}: {e}", socket_path.display())))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let link = Arc::new(Self {
            socket_path,
            node_id: node_id.to_string(),
            log,
            connected: AtomicBool::new(false),
            agent_pid: AtomicU32::new(0),
            outbound: outbound_tx,
            child: Mutex::new(None),
        });

        let io = Arc::clone(&link);
        tokio::spawn(async move {
            io.run(listener, outbound_rx, inbound_tx, cancel).await;
        });

        link.log.info("agent", format!("Listening for agent of node {node_id}"));
        Ok((link, inbound_rx))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn agent_pid(&self) -> u32 {
        self.agent_pid.load(Ordering::Relaxed)
    }

    /// Queue a message for the agent. Dropped (returning false) while no
    /// agent is connected; callers gate dispatch on `is_connected`.
    pub fn send(&self, msg: MonitorToAgent) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.outbound.send(msg).is_ok()
    }

    /// Launch `sr-agent` from the executable's directory.
    pub fn spawn_agent(&self) {
        let agent_path = match std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|d| d.join("sr-agent")))
        {
            Some(p) if p.exists() => p,
            _ => {
                self.log.error("agent", "sr-agent binary not found next to executable");
                return;
            }
        };

        match tokio::process::Command::new(&agent_path)
            .arg("--node-id")
            .arg(&self.node_id)
            .spawn()
        {
            Ok(child) => {
                let pid = child.id().unwrap_or(0);
                self.agent_pid.store(pid, Ordering::Relaxed);
                *self.child.lock() = Some(child);
                self.log.info("agent", format!("Agent spawned, PID={pid}"));
            }
            Err(e) => {
                self.log.error("agent", format!("Failed to spawn agent: {e}"));
            }
        }
    }

    /// Ask the agent to exit, force-killing a spawned child that lingers.
    pub async fn shutdown(&self) {
        self.send(MonitorToAgent::Shutdown);

        let child = self.child.lock().take();
        if let Some(mut child) = child {
            let graceful = tokio::time::timeout(Duration::from_secs(3), child.wait()).await;
            if graceful.is_err() {
                self.log.warn("agent", "Agent didn't exit in time, terminating");
                let _ = child.kill().await;
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        self.log.info("agent", "Agent link stopped");
    }

    async fn run(
        self: Arc<Self>,
        listener: UnixListener,
        mut outbound: mpsc::UnboundedReceiver<MonitorToAgent>,
        inbound: mpsc::UnboundedSender<AgentToMonitor>,
        cancel: CancellationToken,
    ) {
        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "Agent accept failed");
                        continue;
                    }
                },
            };

            // Discard anything queued while no agent was listening; a task
            // from before the reconnect must not fire now. Drained before
            // the connected flag flips so a concurrent send cannot be lost.
            while outbound.try_recv().is_ok() {}

            self.connected.store(true, Ordering::Relaxed);
            self.log.info("agent", "Agent connected");

            self.serve_connection(stream, &mut outbound, &inbound, &cancel)
                .await;

            self.connected.store(false, Ordering::Relaxed);
            self.log.warn("agent", "Agent disconnected");

            if cancel.is_cancelled() {
                break;
            }
        }
    }

    /// Service one agent connection until either side goes away. Reads run
    /// on their own task so a write never tears a partially-read frame.
    async fn serve_connection(
        self: &Arc<Self>,
        stream: UnixStream,
        outbound: &mut mpsc::UnboundedReceiver<MonitorToAgent>,
        inbound: &mpsc::UnboundedSender<AgentToMonitor>,
        cancel: &CancellationToken,
    ) {
        let (mut reader, mut writer) = stream.into_split();
        let conn = cancel.child_token();

        let link = Arc::clone(self);
        let inbound = inbound.clone();
        let reader_conn = conn.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_conn.cancelled() => break,
                    frame = read_frame(&mut reader) => frame,
                };
                let Ok(bytes) = frame else { break };
                match serde_json::from_slice::<AgentToMonitor>(&bytes) {
                    Ok(AgentToMonitor::Status(status)) => {
                        link.agent_pid.store(status.pid, Ordering::Relaxed);
                        link.log.info(
                            "agent",
                            format!("Agent status: {} (pid={})", status.state, status.pid),
                        );
                    }
                    Ok(AgentToMonitor::Pong) => {}
                    Ok(msg) => {
                        if inbound.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        link.log.error("agent", format!("Bad agent frame: {e}"));
                    }
                }
            }
            reader_conn.cancel();
        });

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = write_frame(&mut writer, &MonitorToAgent::Shutdown).await;
                    break;
                }
                _ = conn.cancelled() => break,
                _ = ping.tick() => {
                    if write_frame(&mut writer, &MonitorToAgent::Ping).await.is_err() {
                        break;
                    }
                }
                msg = outbound.recv() => {
                    let Some(msg) = msg else { break };
                    if write_frame(&mut writer, &msg).await.is_err() {
                        break;
                    }
                }
            }
        }

        conn.cancel();
        let _ = reader_task.await;
    }
}

async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg: &MonitorToAgent,
) -> std::io::Result<()> {
    let payload = serde_json::to_vec(msg).map_err(std::io::Error::other)?;
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

use std::net::SocketAddr;
use std::thread;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use shared::store::{InventoryDb, UpsertOutcome};
use shared::types::InventoryEntry;
use crate::config::InventoryConfig;
use crate::listener::SapListener;
use crate::sap::{MessageKind, SapPacket};
use crate::sdp;

/// Large enough for any SAP announcement seen in practice; longer datagrams
/// are truncated by the kernel and then fail to decode.
pub const RECV_BUFFER_SIZE: usize = 4096;

/// Commands sent to the inventory thread
pub enum InventoryCommand {
    Upsert(InventoryEntry, oneshot::Sender<Result<UpsertOutcome>>),
    Delete(u16, oneshot::Sender<Result<bool>>),
    Sweep {
        now: DateTime<Utc>,
        window: chrono::Duration,
        reply: oneshot::Sender<Result<u64>>,
    },
    Count(oneshot::Sender<Result<u64>>),
    #[cfg(test)]
    GetOne(u16, oneshot::Sender<Result<Option<InventoryEntry>>>),
    Shutdown,
}

/// Handle to the thread that owns the inventory database. Commands are
/// applied one at a time, so the database has a single writer.
#[derive(Clone)]
pub struct InventoryHandle {
    tx: mpsc::Sender<InventoryCommand>,
}

impl InventoryHandle {
    /// Spawn a new inventory thread with the given database
    pub fn spawn(db: InventoryDb) -> Self {
        let (tx, mut rx) = mpsc::channel::<InventoryCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    InventoryCommand::Upsert(entry, reply) => {
                        let _ = reply.send(db.upsert(&entry));
                    }
                    InventoryCommand::Delete(hash, reply) => {
                        let _ = reply.send(db.delete(hash));
                    }
                    InventoryCommand::Sweep { now, window, reply } => {
                        let _ = reply.send(db.sweep(now, window));
                    }
                    InventoryCommand::Count(reply) => {
                        let _ = reply.send(db.count());
                    }
                    #[cfg(test)]
                    InventoryCommand::GetOne(hash, reply) => {
                        let _ = reply.send(db.get(hash));
                    }
                    InventoryCommand::Shutdown => {
                        tracing::info!("Inventory thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Insert or refresh a stream
    pub async fn upsert(&self, entry: InventoryEntry) -> Result<UpsertOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(InventoryCommand::Upsert(entry, reply)).await?;
        rx.await?
    }

    /// Remove a stream. Returns false if it was not in the inventory.
    pub async fn delete(&self, hash: u16) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(InventoryCommand::Delete(hash, reply)).await?;
        rx.await?
    }

    /// Remove streams not announced within `window` of `now`
    pub async fn sweep(&self, now: DateTime<Utc>, window: chrono::Duration) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(InventoryCommand::Sweep { now, window, reply }).await?;
        rx.await?
    }

    /// Number of streams in the inventory
    pub async fn count(&self) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(InventoryCommand::Count(reply)).await?;
        rx.await?
    }

    #[cfg(test)]
    pub async fn get_one(&self, hash: u16) -> Result<Option<InventoryEntry>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(InventoryCommand::GetOne(hash, reply)).await?;
        rx.await?
    }

    /// Shutdown the inventory thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(InventoryCommand::Shutdown).await?;
        Ok(())
    }
}

/// State shared by the reactor's event handlers.
pub struct DiscoveryContext {
    pub inventory: InventoryHandle,
    pub liveness_window: chrono::Duration,
    pub sweep_interval: std::time::Duration,
}

impl DiscoveryContext {
    pub fn new(inventory: InventoryHandle, config: &InventoryConfig) -> Result<Self> {
        anyhow::ensure!(config.sweep_interval_secs > 0, "Sweep interval must be at least 1 second");
        let liveness_window = chrono::Duration::from_std(std::time::Duration::from_secs(
            config.liveness_window_secs,
        ))
        .context("Liveness window is out of range")?;

        Ok(Self {
            inventory,
            liveness_window,
            sweep_interval: std::time::Duration::from_secs(config.sweep_interval_secs),
        })
    }
}

/// What a datagram did to the inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Stored(UpsertOutcome),
    Removed { existed: bool },
    /// Undecodable envelope, unsupported envelope or rejected description
    Dropped,
    /// The inventory could not be updated
    Failed,
}

/// Why the reactor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorExit {
    Cancelled,
    /// Zero-length receive
    ConnectionReset,
    SocketError(std::io::ErrorKind),
}

/// Decode one datagram and apply it to the inventory.
pub async fn handle_datagram(ctx: &DiscoveryContext, data: &[u8], from: SocketAddr) -> Dispatch {
    let packet = match SapPacket::decode(data) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::debug!("Dropping datagram from {}: {}", from, e);
            return Dispatch::Dropped;
        }
    };

    if let Err(e) = packet.validate() {
        tracing::debug!("Dropping SAP packet 0x{:04X} from {}: {}", packet.msg_id_hash, from, e);
        return Dispatch::Dropped;
    }

    let hash = packet.msg_id_hash;
    match packet.kind() {
        MessageKind::Deletion => match ctx.inventory.delete(hash).await {
            Ok(existed) => {
                if existed {
                    tracing::debug!("Removed stream 0x{:04X}", hash);
                } else {
                    tracing::debug!("Deletion for unknown stream 0x{:04X}", hash);
                }
                Dispatch::Removed { existed }
            }
            Err(e) => {
                tracing::error!("Failed to delete stream 0x{:04X}: {:#}", hash, e);
                Dispatch::Failed
            }
        },
        MessageKind::Announcement => {
            let description = match sdp::parse(&packet.payload) {
                Ok(description) => description,
                Err(e) => {
                    tracing::info!("Rejected description 0x{:04X} from {}: {}", hash, packet.origin, e);
                    return Dispatch::Dropped;
                }
            };

            let now = Utc::now();
            let name = description.source_name.clone();
            let entry = InventoryEntry {
                hash,
                source_address: packet.origin.to_string(),
                sdp: packet.payload,
                description,
                first_seen: now,
                last_seen: now,
            };

            match ctx.inventory.upsert(entry).await {
                Ok(outcome) => {
                    match outcome {
                        UpsertOutcome::Inserted => {
                            tracing::debug!("New stream 0x{:04X} \"{}\"", hash, name)
                        }
                        UpsertOutcome::Updated => {
                            tracing::debug!("Updated stream 0x{:04X} \"{}\"", hash, name)
                        }
                        UpsertOutcome::Refreshed => {
                            tracing::trace!("Refreshed stream 0x{:04X}", hash)
                        }
                    }
                    Dispatch::Stored(outcome)
                }
                Err(e) => {
                    tracing::error!("Failed to store stream 0x{:04X}: {:#}", hash, e);
                    Dispatch::Failed
                }
            }
        }
    }
}

/// Remove streams whose last announcement is older than the liveness window.
pub async fn sweep_expired(ctx: &DiscoveryContext, now: DateTime<Utc>) -> Result<u64> {
    let removed = ctx.inventory.sweep(now, ctx.liveness_window).await?;
    if removed > 0 {
        tracing::info!("Removed {} expired stream(s)", removed);
    }
    Ok(removed)
}

/// Reactor loop: datagrams, the sweep timer and cancellation all run on the
/// calling task, so a sweep never overlaps the handling of a datagram.
pub async fn run(
    listener: &mut SapListener,
    ctx: DiscoveryContext,
    cancel: CancellationToken,
) -> Result<ReactorExit> {
    listener.start()?;
    tracing::info!("Listening for SAP announcements on {}", listener.local_addr()?);

    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut sweep_interval = tokio::time::interval(ctx.sweep_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            result = listener.recv_from(&mut buf) => {
                match result {
                    Ok((0, from)) => {
                        tracing::warn!("Zero-length datagram from {}, stopping", from);
                        break ReactorExit::ConnectionReset;
                    }
                    Ok((len, from)) => {
                        handle_datagram(&ctx, &buf[..len], from).await;
                    }
                    Err(e) => {
                        tracing::error!("Socket receive failed: {}", e);
                        break ReactorExit::SocketError(e.kind());
                    }
                }
            }
            _ = sweep_interval.tick() => {
                if let Err(e) = sweep_expired(&ctx, Utc::now()).await {
                    tracing::error!("Failed to sweep inventory: {:#}", e);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Reactor shutting down");
                break ReactorExit::Cancelled;
            }
        }
    };

    listener.close();
    Ok(exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    const SDP: &str = "v=0\r\n\
        o=- 1 1 IN IP4 10.0.0.1\r\n\
        s=Studio A\r\n\
        c=IN IP4 239.1.1.1/32\r\n\
        t=0 0\r\n\
        a=recvonly\r\n\
        m=audio 5004 RTP/AVP 97\r\n\
        a=rtpmap:97 L24/48000/2\r\n";

    fn origin() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    fn peer() -> SocketAddr {
        SocketAddr::new(origin(), 9875)
    }

    fn context(liveness_window_secs: u64) -> DiscoveryContext {
        let db = InventoryDb::open(":memory:").unwrap();
        let config = InventoryConfig {
            liveness_window_secs,
            ..InventoryConfig::default()
        };
        DiscoveryContext::new(InventoryHandle::spawn(db), &config).unwrap()
    }

    fn announcement(hash: u16, sdp: &str) -> Vec<u8> {
        SapPacket::new_sdp(origin(), hash, sdp, false).encode()
    }

    fn deletion(hash: u16) -> Vec<u8> {
        SapPacket::new_sdp(origin(), hash, "", true).encode()
    }

    #[tokio::test]
    async fn test_announcement_then_deletion() {
        let ctx = context(60);

        let result = handle_datagram(&ctx, &announcement(0x1234, SDP), peer()).await;
        assert_eq!(result, Dispatch::Stored(UpsertOutcome::Inserted));

        let entry = ctx.inventory.get_one(0x1234).await.unwrap().unwrap();
        assert_eq!(entry.source_address, "10.0.0.1");
        assert_eq!(entry.sdp, SDP);
        assert_eq!(entry.description.source_name, "Studio A");
        assert_eq!(entry.description.stream_address, Ipv4Addr::new(239, 1, 1, 1));

        let result = handle_datagram(&ctx, &announcement(0x1234, SDP), peer()).await;
        assert_eq!(result, Dispatch::Stored(UpsertOutcome::Refreshed));
        assert_eq!(ctx.inventory.count().await.unwrap(), 1);

        let result = handle_datagram(&ctx, &deletion(0x1234), peer()).await;
        assert_eq!(result, Dispatch::Removed { existed: true });
        assert!(ctx.inventory.get_one(0x1234).await.unwrap().is_none());

        let result = handle_datagram(&ctx, &deletion(0x1234), peer()).await;
        assert_eq!(result, Dispatch::Removed { existed: false });
    }

    #[tokio::test]
    async fn test_changed_description_updates_row() {
        let ctx = context(60);
        handle_datagram(&ctx, &announcement(7, SDP), peer()).await;

        let renamed = SDP.replace("s=Studio A", "s=Studio B");
        let result = handle_datagram(&ctx, &announcement(7, &renamed), peer()).await;
        assert_eq!(result, Dispatch::Stored(UpsertOutcome::Updated));

        let entry = ctx.inventory.get_one(7).await.unwrap().unwrap();
        assert_eq!(entry.description.source_name, "Studio B");
    }

    #[tokio::test]
    async fn test_invalid_input_leaves_inventory_untouched() {
        let ctx = context(60);

        // Truncated envelope
        let packet = announcement(1, SDP);
        assert_eq!(handle_datagram(&ctx, &packet[..6], peer()).await, Dispatch::Dropped);

        // Encrypted payloads are not supported
        let mut packet = SapPacket::new_sdp(origin(), 2, SDP, false);
        packet.flags.encrypted = true;
        assert_eq!(handle_datagram(&ctx, &packet.encode(), peer()).await, Dispatch::Dropped);

        // Wrong MIME type
        let mut packet = SapPacket::new_sdp(origin(), 3, SDP, false);
        packet.payload_type = "text/plain".to_string();
        assert_eq!(handle_datagram(&ctx, &packet.encode(), peer()).await, Dispatch::Dropped);

        // Session with a bounded lifetime
        let timed = SDP.replace("t=0 0", "t=3034423619 3042462419");
        assert_eq!(handle_datagram(&ctx, &announcement(4, &timed), peer()).await, Dispatch::Dropped);

        assert_eq!(ctx.inventory.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_streams() {
        let ctx = context(60);
        handle_datagram(&ctx, &announcement(1, SDP), peer()).await;
        handle_datagram(&ctx, &announcement(2, SDP), peer()).await;

        let now = Utc::now();
        assert_eq!(sweep_expired(&ctx, now).await.unwrap(), 0);

        let later = now + chrono::Duration::seconds(61);
        assert_eq!(sweep_expired(&ctx, later).await.unwrap(), 2);
        assert_eq!(ctx.inventory.count().await.unwrap(), 0);
    }

    /// Handle over an existing database file opened read-only, so every
    /// write fails while reads still work.
    fn read_only_context(dir: &tempfile::TempDir) -> DiscoveryContext {
        let path = dir.path().join("SDP.db");
        drop(InventoryDb::open(&path).unwrap());

        let db = InventoryDb::open_read_only(&path).unwrap();
        DiscoveryContext::new(InventoryHandle::spawn(db), &InventoryConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_store_failures_are_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = read_only_context(&dir);

        let result = handle_datagram(&ctx, &announcement(0x1234, SDP), peer()).await;
        assert_eq!(result, Dispatch::Failed);

        let result = handle_datagram(&ctx, &deletion(0x1234), peer()).await;
        assert_eq!(result, Dispatch::Failed);

        // The handle is still usable after the failed writes
        assert_eq!(ctx.inventory.count().await.unwrap(), 0);
        assert!(sweep_expired(&ctx, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_stopped_inventory_thread_is_reported() {
        let ctx = context(60);
        ctx.inventory.shutdown().await.unwrap();

        let result = handle_datagram(&ctx, &announcement(1, SDP), peer()).await;
        assert_eq!(result, Dispatch::Failed);
    }

    #[tokio::test]
    async fn test_reactor_keeps_running_after_store_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = read_only_context(&dir);

        let mut listener = SapListener::new();
        listener.bind(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let cancel = CancellationToken::new();
        let reactor = tokio::spawn(async move { run(&mut listener, ctx, cancel).await });

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

        sender.send_to(&announcement(1, SDP), target).await.unwrap();
        sender.send_to(&announcement(2, SDP), target).await.unwrap();
        sender.send_to(&[], target).await.unwrap();

        // Both failed writes were handled and the loop went on to the
        // zero-length datagram
        let exit = reactor.await.unwrap().unwrap();
        assert_eq!(exit, ReactorExit::ConnectionReset);
    }

    async fn wait_for_entry(inventory: &InventoryHandle, hash: u16) -> Option<InventoryEntry> {
        for _ in 0..100 {
            if let Some(entry) = inventory.get_one(hash).await.unwrap() {
                return Some(entry);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_reactor_over_loopback() {
        let ctx = context(60);
        let inventory = ctx.inventory.clone();

        let mut listener = SapListener::new();
        listener.bind(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let cancel = CancellationToken::new();
        let reactor = tokio::spawn(async move {
            let exit = run(&mut listener, ctx, cancel).await.unwrap();
            (exit, listener.state())
        });

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

        sender.send_to(b"garbage", target).await.unwrap();
        sender.send_to(&announcement(0xBEEF, SDP), target).await.unwrap();

        let entry = wait_for_entry(&inventory, 0xBEEF).await.unwrap();
        assert_eq!(entry.description.udp_port, 5004);

        // Zero-length datagram stops the loop
        sender.send_to(&[], target).await.unwrap();
        let (exit, state) = reactor.await.unwrap();
        assert_eq!(exit, ReactorExit::ConnectionReset);
        assert_eq!(state, crate::listener::ListenerState::Terminated);

        inventory.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reactor_stops_on_cancel() {
        let ctx = context(60);
        let mut listener = SapListener::new();
        listener.bind(0).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let exit = run(&mut listener, ctx, cancel).await.unwrap();
        assert_eq!(exit, ReactorExit::Cancelled);
        assert_eq!(listener.state(), crate::listener::ListenerState::Terminated);
    }
}

//! Top-level binding crate: picks a byte-stream transport and a role, and
//! hands both to the checkpoint pipeline. Has almost no logic of its own —
//! the actual state machines live in `checkpoint`, `netbuf`, and `rdma`.

use std::io::{Read, Write};
use std::net::TcpStream;

use checkpoint::{CapabilitySet, Config, ConfigMutation, Primary, SnapshotSink, SnapshotSource, Standby, VmControl};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Checkpoint(#[from] checkpoint::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Negotiates the one-byte MC handshake and the shared `Config`, then runs
/// epochs until `should_continue` returns false. Used by the primary side
/// of a replicated VM pair.
pub fn run_primary<V, Sn>(
    addr: &str,
    vm: V,
    snapshot: Sn,
    packet_buffer: Box<dyn netbuf::PacketBufferLike>,
    config: Config,
    config_rx: crossbeam_channel::Receiver<ConfigMutation>,
    should_continue: impl FnMut() -> bool,
) -> Result<(), Error>
where
    V: VmControl,
    Sn: SnapshotSink,
{
    let stream = TcpStream::connect(addr)?;
    info!(addr, "connected to standby, starting negotiation");
    let mut primary = Primary::new(stream, vm, snapshot, packet_buffer, config, config_rx);
    primary.negotiate(true)?;
    info!("negotiation complete, running epochs");
    primary.run(should_continue);
    Ok(())
}

/// Standby counterpart of [`run_primary`]: accepts the handshake, then
/// loads every incoming epoch until `should_continue` returns false or the
/// stream fails.
pub fn run_standby<Ld>(stream: TcpStream, loader: Ld, config: Config, should_continue: impl FnMut() -> bool) -> Result<(), Error>
where
    Ld: SnapshotSource,
{
    let mut standby = Standby::new(stream, loader, config);
    standby.negotiate()?;
    info!("negotiation complete, loading epochs");
    standby.run(should_continue)?;
    Ok(())
}

/// Builds a [`Config`] from the subset of tunables an external monitor is
/// expected to expose; `bitworkers`/`pin_all`/`keepalive` are advertised
/// during negotiation but owned by the RDMA and snapshot collaborators,
/// not by this crate.
pub fn default_config(checkpoint_delay_ms: u32, packet_buffer_bytes: u64, shrink_delay_secs: u32, caps: CapabilitySet) -> Config {
    Config::new(checkpoint_delay_ms, packet_buffer_bytes, shrink_delay_secs, caps)
}

/// A byte-stream adapter so any `Read + Write` can stand in for the TCP
/// stream the pipeline otherwise expects — used to run the checkpoint
/// protocol over an RDMA connection's SEND/RECV control channel when no
/// separate TCP control path is available.
pub struct RdmaByteStream<'a, V: rdma::verbs::VerbsContext> {
    control: &'a mut rdma::control::ControlChannel<V>,
    read_buf: std::collections::VecDeque<u8>,
}

impl<'a, V: rdma::verbs::VerbsContext> RdmaByteStream<'a, V> {
    pub fn new(control: &'a mut rdma::control::ControlChannel<V>) -> Self {
        Self { control, read_buf: std::collections::VecDeque::new() }
    }
}

impl<'a, V: rdma::verbs::VerbsContext> Write for RdmaByteStream<'a, V> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.control
            .exchange_send(wire::ControlType::QemuFile, buf, false, false)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a, V: rdma::verbs::VerbsContext> Read for RdmaByteStream<'a, V> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.read_buf.len() < buf.len() {
            let (_hdr, body) = self
                .control
                .exchange_recv(wire::ControlType::QemuFile, false)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            self.read_buf.extend(body);
        }
        let n = buf.len().min(self.read_buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.read_buf.pop_front().unwrap();
        }
        Ok(n)
    }
}

/// Wraps a device-state snapshot sink together with the RDMA transport that
/// moves its RAM pages out of band, so `checkpoint::Primary` can drive both
/// through one `SnapshotSink` without itself knowing RDMA is involved: `dump`
/// still carries device state over the byte stream, while `save_page` goes
/// straight to the transport's one-sided WRITEs.
pub struct RdmaBackedSnapshot<'mem, Sn, V: rdma::verbs::VerbsContext> {
    inner: Sn,
    transport: rdma::RdmaTransport<'mem, V>,
}

impl<'mem, Sn, V: rdma::verbs::VerbsContext> RdmaBackedSnapshot<'mem, Sn, V> {
    pub fn new(inner: Sn, transport: rdma::RdmaTransport<'mem, V>) -> Self {
        Self { inner, transport }
    }
}

impl<'mem, Sn: SnapshotSink, V: rdma::verbs::VerbsContext> SnapshotSink for RdmaBackedSnapshot<'mem, Sn, V> {
    fn dump(&mut self, sink: &mut dyn Write) -> Result<(), checkpoint::Error> {
        self.inner.dump(sink)
    }

    fn save_page(&mut self, block: u32, offset: u64, length: u64) -> Result<(), checkpoint::Error> {
        self.transport
            .save_page(block, offset, length)
            .map_err(|e| checkpoint::Error::Resource(e.to_string()))
    }

    fn after_iterate(&mut self) -> Result<(), checkpoint::Error> {
        self.transport.flush_cursor().map_err(|e| checkpoint::Error::Resource(e.to_string()))?;
        self.transport.drain_in_flight().map_err(|e| checkpoint::Error::Resource(e.to_string()))
    }
}

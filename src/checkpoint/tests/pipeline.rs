use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use checkpoint::{CapabilitySet, Config, ConfigMutation, Error, Primary, SnapshotSink, VmControl};

struct NoopVm;
impl VmControl for NoopVm {
    fn stop(&mut self) -> Result<(), Error> {
        Ok(())
    }
    fn resume(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

struct FixedSnapshot(Vec<u8>);
impl SnapshotSink for FixedSnapshot {
    fn dump(&mut self, sink: &mut dyn Write) -> Result<(), Error> {
        sink.write_all(&self.0)?;
        Ok(())
    }
}

struct NoopPacketBuffer {
    disabled: Arc<Mutex<bool>>,
}
impl netbuf::PacketBufferLike for NoopPacketBuffer {
    fn plug(&mut self) -> Result<(), netbuf::Error> {
        Ok(())
    }
    fn release_one(&mut self) -> Result<(), netbuf::Error> {
        Ok(())
    }
    fn release_indefinite(&mut self) -> Result<(), netbuf::Error> {
        Ok(())
    }
    fn disable(&mut self) {
        *self.disabled.lock().unwrap() = true;
    }
}

struct AlwaysAck;
impl Read for AlwaysAck {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        buf[..4].copy_from_slice(&wire::epoch::ACK.to_be_bytes());
        Ok(4)
    }
}
impl Write for AlwaysAck {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct AlwaysNack;
impl Read for AlwaysNack {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        buf[..4].copy_from_slice(&wire::epoch::NACK.to_be_bytes());
        Ok(4)
    }
}
impl Write for AlwaysNack {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn live_checkpoint_delay_reconfiguration_is_applied_between_epochs() {
    let config = Config::new(1, netbuf::DEFAULT_LIMIT_BYTES, 10, CapabilitySet::default());
    let (tx, rx) = crossbeam_channel::unbounded();
    let disabled = Arc::new(Mutex::new(false));

    let mut primary = Primary::new(
        AlwaysAck,
        NoopVm,
        FixedSnapshot(vec![9, 9, 9]),
        Box::new(NoopPacketBuffer { disabled: disabled.clone() }),
        config,
        rx,
    );

    assert_eq!(primary.epoch(), 0);
    tx.send(ConfigMutation::SetCheckpointDelayMs(5)).unwrap();
    primary.run_epoch().unwrap();
    assert_eq!(primary.epoch(), 1);
    assert!(!*disabled.lock().unwrap());
}

#[test]
fn nacked_epoch_enters_error_state_and_disables_packet_buffer() {
    let config = Config::new(1, netbuf::DEFAULT_LIMIT_BYTES, 10, CapabilitySet::default());
    let (_tx, rx) = crossbeam_channel::unbounded();
    let disabled = Arc::new(Mutex::new(false));

    let mut primary = Primary::new(
        AlwaysNack,
        NoopVm,
        FixedSnapshot(vec![1]),
        Box::new(NoopPacketBuffer { disabled: disabled.clone() }),
        config,
        rx,
    );

    let mut ticks = 0;
    primary.run(|| {
        ticks += 1;
        ticks <= 3
    });

    assert_eq!(primary.epoch(), 0, "the first NACKed epoch never completes");
    assert!(*disabled.lock().unwrap());
}

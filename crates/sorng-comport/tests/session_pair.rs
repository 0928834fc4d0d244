use std::sync::Arc;
use std::time::Duration;

use sorng_comport::comport::error::PORT_OPEN_FAILURE;
use sorng_comport::comport::*;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

fn pair() -> VirtualBus {
    let bus = VirtualBus::new();
    bus.connect("COM1", "COM2");
    bus
}

fn open(bus: &VirtualBus, config: SessionConfig) -> Session {
    let session = Session::new(config, Arc::new(bus.clone()));
    assert_eq!(session.open(), Ok(true));
    session
}

async fn next_event(rx: &mut UnboundedReceiver<SerialEvent>) -> SerialEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no event within 2s")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_bytes_arrive_in_order_on_peer() {
    let bus = pair();
    let a = open(&bus, SessionConfig::new("COM1"));
    let b = Session::new(SessionConfig::new("COM2"), Arc::new(bus.clone()));
    let mut rx = b.subscribe();
    b.open().unwrap();

    a.write_str("test").unwrap();

    let mut got = Vec::new();
    while got.len() < 4 {
        if let SerialEvent::ByteReceived(byte) = next_event(&mut rx).await {
            got.push(byte);
        }
    }
    assert_eq!(got, b"test");
}

#[test]
fn test_second_owner_is_refused_without_disturbing_first() {
    let bus = pair();
    let first = open(&bus, SessionConfig::new("COM1"));
    let second = Session::new(SessionConfig::new("COM1"), Arc::new(bus.clone()));

    assert_eq!(second.open(), Ok(false));
    assert_eq!(second.state(), SessionState::Offline);
    assert_eq!(first.state(), SessionState::Online);
    first.write(b"still here").unwrap();
}

#[test]
fn test_missing_port_is_open_failure() {
    let bus = pair();
    let session = Session::new(SessionConfig::new("COM9"), Arc::new(bus));
    assert_eq!(session.open(), Err(CommError::device(PORT_OPEN_FAILURE)));
    assert!(!session.is_online());
}

#[test]
fn test_unplugged_port_goes_offline() {
    let bus = pair();
    let session = open(&bus, SessionConfig::new("COM1"));
    bus.unplug("COM1").unwrap();

    let err = session.write(b"x").unwrap_err();
    assert!(err.is_device_fault());
    assert_eq!(session.state(), SessionState::Offline);
    assert_eq!(session.write(b"x"), Err(CommError::offline()));
}

#[test]
fn test_open_close_open() {
    let bus = pair();
    let session = open(&bus, SessionConfig::new("COM1"));
    session.close();
    assert!(!bus.is_open("COM1"));
    assert_eq!(session.open(), Ok(true));
    session.write_line("AT").unwrap();
    session.flush().unwrap();
    assert_eq!(session.pending_bytes(), 0);
    assert_eq!(bus.take_received("COM2").unwrap(), b"AT\r\n");
}

#[test]
fn test_flush_reports_send_timeout() {
    let bus = pair();
    let mut line = LineConfiguration::default();
    line.send_timeout = SendTimeout {
        constant_ms: 20,
        multiplier_ms: 1,
    };
    let session = open(&bus, SessionConfig::new("COM1").with_line(line));
    bus.stall("COM1", true).unwrap();

    session.write(b"stuck").unwrap();
    assert_eq!(session.pending_bytes(), 5);
    assert_eq!(session.flush(), Err(CommError::SendTimeout));
    assert_eq!(session.pending_bytes(), 0);
    assert_eq!(session.state(), SessionState::Offline);
}

#[test]
fn test_cts_rts_handshake_reaches_the_driver() {
    let bus = pair();
    let remote = open(&bus, SessionConfig::new("COM2"));
    let line = LineConfiguration::default().with_handshake(Handshake::CtsRts);
    let session = open(&bus, SessionConfig::new("COM1").with_line(line));

    assert_eq!(session.config().line.handshake, Handshake::CtsRts);
    assert!(!session.rts_available());
    assert!(session.dtr_available());

    let block = bus.control_block("COM1").unwrap();
    assert!(block.has(ControlBlock::OUT_X_CTS_FLOW));
    assert_eq!(block.rts_control(), HsOutput::Handshake.code());
    assert!(remote.modem_status().unwrap().cts);
}

#[test]
fn test_queue_capacity_unknown_by_default() {
    let bus = pair();
    let session = open(&bus, SessionConfig::new("COM1"));
    let status = session.queue_status().unwrap();
    assert_eq!(status.in_capacity, 0);
    assert_eq!(status.out_capacity, 0);
    assert!(status.to_string().contains("unknown size"));
}

#[tokio::test]
async fn test_transmit_complete_after_write() {
    let bus = pair();
    let session = Session::new(SessionConfig::new("COM1"), Arc::new(bus.clone()));
    let mut rx = session.subscribe();
    session.open().unwrap();

    session.write(b"hi").unwrap();
    while next_event(&mut rx).await != SerialEvent::TransmitComplete {}
}

#[tokio::test]
async fn test_break_and_line_changes_cross_the_pair() {
    let bus = pair();
    let remote = Session::new(SessionConfig::new("COM2"), Arc::new(bus.clone()));
    let mut rx = remote.subscribe();
    remote.open().unwrap();
    let local = open(&bus, SessionConfig::new("COM1"));

    local.set_break(true).unwrap();
    assert!(local.brk());
    while next_event(&mut rx).await != SerialEvent::Break {}
    local.set_break(false).unwrap();

    local.set_rts(true).unwrap();
    loop {
        if let SerialEvent::StatusChanged { changed, current } = next_event(&mut rx).await {
            if changed.cts {
                assert!(current.cts);
                break;
            }
        }
    }
    assert!(remote.modem_status().unwrap().cts);
}

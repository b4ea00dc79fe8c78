use daqlink_agent::client::{DataSender, LinkConfig, LinkState, MAXIMUM_POINTS};
use daqlink_agent::config::{FaultConfig, MachineConfig, SensorConfig};
use daqlink_agent::machine::{DeviceChunk, Machine};
use daqlink_devkit::{init_logging, RecordingServer};
use daqlink_protocol::{FaultReport, Message};
use std::collections::BTreeMap;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn link(server: &RecordingServer) -> LinkConfig {
    LinkConfig {
        name: "press-7".into(),
        addr: server.addr().to_string(),
        retry_interval: Duration::from_millis(50),
        connect_timeout: Duration::from_secs(2),
    }
}

fn machine() -> Machine {
    let mut sensors = BTreeMap::new();
    sensors.insert("spindle".to_string(), SensorConfig { kind: "VIB".into() });
    Machine::new(&MachineConfig {
        name: "press-7".into(),
        sensors,
        fault: Some(FaultConfig { threshold: 3.0, batch_size: 100, limit: 10.0 }),
    })
}

#[tokio::test]
async fn machine_events_reach_the_kernel_resampled() {
    init_logging();
    let mut server = RecordingServer::bind().await.unwrap();
    let (sender, _task) = DataSender::spawn(link(&server));

    let first = server.next_frame(WAIT).await.unwrap();
    assert_eq!(first.message, Message::Name("press-7".into()));
    assert!(sender.wait_for_state(LinkState::Connected).await);

    let mut machine = machine();
    let mut chunk = DeviceChunk::new();
    chunk.insert("spindle".into(), (0..120).map(|i| if i < 5 { 50.0 } else { 1.0 }).collect());
    for event in machine.data_update(&chunk) {
        assert!(sender.event_handle(event));
    }

    match server.next_frame(WAIT).await.unwrap().message {
        Message::DataUpdate(data) => assert_eq!(data["spindle"].data.len(), MAXIMUM_POINTS),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        server.next_frame(WAIT).await.unwrap().message,
        Message::FaultDetect(FaultReport { score: 5.0, threshold: 3.0 })
    );
}

#[tokio::test]
async fn handshake_is_repeated_after_reconnection() {
    init_logging();
    let mut server = RecordingServer::bind().await.unwrap();
    let (sender, _task) = DataSender::spawn(link(&server));

    assert_eq!(server.next_frame(WAIT).await.unwrap().connection, 0);
    assert!(sender.wait_for_state(LinkState::Connected).await);

    server.drop_connections();

    let again = server.next_frame(WAIT).await.unwrap();
    assert_eq!(again.connection, 1);
    assert_eq!(again.message, Message::Name("press-7".into()));
    assert_eq!(server.connections(), 2);
}

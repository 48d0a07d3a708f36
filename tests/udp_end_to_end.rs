//! UDP session: windows 500..=509 never reach the transport; the receiver
//! must see exactly those ids missing.

use acqstream::config::{Protocol, Role};
use acqstream::core::calibration::CalibrationSnapshot;
use acqstream::core::stats::SessionStats;
use acqstream::core::types::{ChannelMask, Resolution, SampleWindow};
use acqstream::streaming::wire::WireOptions;
use acqstream::streaming::{
    PacketReceiver, StreamingManager, SubmitOutcome, TransportConfig, create_transport,
};

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WINDOW: usize = 256;
const WINDOWS: u64 = 1000;

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn transport_config(role: Role, addr: String) -> TransportConfig {
    TransportConfig {
        role,
        protocol: Protocol::Udp,
        addr,
        queue_depth: 1024,
        connect_timeout: Duration::from_secs(1),
    }
}

#[test]
fn test_dropped_windows_show_up_as_missing_ids() {
    let server_stats = Arc::new(SessionStats::new());
    let mut manager = StreamingManager::new(Arc::clone(&server_stats));
    let options = WireOptions {
        resolution: Resolution::Bits16,
        calibrated: false,
        mask: ChannelMask::BOTH,
        adc_bits: 14,
    };
    manager
        .attach_network(
            create_transport(
                transport_config(Role::Server, "127.0.0.1:0".to_string()),
                Arc::clone(&server_stats),
            ),
            options,
            4,
        )
        .unwrap();
    let server_addr = manager.local_addr().unwrap();

    let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
    let inbox = Arc::clone(&received);
    let mut client = create_transport(
        transport_config(Role::Client, server_addr.to_string()),
        Arc::new(SessionStats::new()),
    );
    client.on_receive(Box::new(move |data| inbox.lock().push(data.to_vec())));
    client.start().unwrap();

    assert!(wait_until(Duration::from_secs(3), || manager.is_ready()));

    let calibration = CalibrationSnapshot::default();
    for index in 0..WINDOWS {
        if (500..510).contains(&index) {
            continue;
        }
        let ch1 = vec![(index % 1000) as i16; WINDOW];
        let ch2 = vec![-((index % 1000) as i16); WINDOW];
        let window = SampleWindow::new(index, ChannelMask::BOTH, ch1, ch2);
        assert_eq!(
            manager.submit(window, &calibration).unwrap(),
            SubmitOutcome::Delivered
        );
        if index % 10 == 0 {
            thread::sleep(Duration::from_millis(2));
        }
    }

    assert!(wait_until(Duration::from_secs(5), || received.lock().len() == 990));
    manager.stop(true).unwrap();
    client.stop();

    let mut receiver = PacketReceiver::new(14);
    for packet in received.lock().iter() {
        assert!(receiver.accept(packet).is_some());
    }
    let stats = receiver.stats();
    assert_eq!(stats.packets, 990);
    assert_eq!(stats.missing_ids, 10);
    assert_eq!(stats.payload_bytes, 990 * (2 * WINDOW * 2) as u64);
    assert_eq!(stats.hinted_lost_samples, 0);
    assert_eq!(stats.decode_failures, 0);
}

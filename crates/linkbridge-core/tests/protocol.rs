use linkbridge_core::mock::{MockDevice, MockOpener};
use linkbridge_core::protocol::{
    FixedEnumerator, HandshakeSettings, HandshakeValidator, LinkError, PortDescriptor,
    PortEnumerator, PortFilter, PortInfo, SerialEnumerator,
};
use linkbridge_core::prelude::LinkConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn quick_settings() -> HandshakeSettings {
    HandshakeSettings {
        settle_delay: Duration::ZERO,
        timeout: Duration::from_millis(50),
        probe: b'?',
        token: "READY".to_string(),
    }
}

fn quick_config() -> LinkConfig {
    LinkConfig {
        read_timeout_ms: 2,
        ..LinkConfig::default()
    }
}

#[test]
fn test_protocol_error_display() {
    assert!(!LinkError::NoDeviceFound.to_string().is_empty());
    let err = LinkError::HandshakeTimeout {
        port: "/dev/ttyUSB0".into(),
    };
    assert!(err.to_string().contains("/dev/ttyUSB0"));
}

#[test]
fn test_io_error_converts() {
    let err: LinkError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
    assert!(matches!(err, LinkError::Io(_)));
}

#[test]
fn test_settle_delay_is_honoured() {
    let opener = MockOpener::new();
    opener.attach("A", MockDevice::responding("READY"));
    let settings = HandshakeSettings {
        settle_delay: Duration::from_millis(60),
        ..quick_settings()
    };
    let validator = HandshakeValidator::new(Arc::new(opener), settings);

    let started = Instant::now();
    validator
        .probe(&PortDescriptor::new("A", &quick_config()))
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[test]
fn test_boot_banner_is_not_a_handshake() {
    // A device printing its token on boot but ignoring the probe must not pass
    let device = MockDevice::silent();
    device.emit("READY (boot banner)");
    let opener = MockOpener::new();
    opener.attach("A", device.clone());

    let validator = HandshakeValidator::new(Arc::new(opener), quick_settings());
    let err = validator
        .probe(&PortDescriptor::new("A", &quick_config()))
        .unwrap_err();
    assert!(matches!(err, LinkError::HandshakeTimeout { .. }));
    assert!(!device.is_open());
}

#[test]
fn test_custom_probe_byte() {
    let device = MockDevice::responding("READY").with_probe(b'H');
    let opener = MockOpener::new();
    opener.attach("A", device.clone());

    let settings = HandshakeSettings {
        probe: b'H',
        ..quick_settings()
    };
    let validator = HandshakeValidator::new(Arc::new(opener), settings);
    let confirmed = validator
        .find_device(&FixedEnumerator::from_paths(["A"], &quick_config()))
        .unwrap();
    assert_eq!(confirmed.descriptor.path, "A");
    assert_eq!(device.written(), vec![b'H']);
}

#[test]
fn test_every_failed_candidate_is_released() {
    let devices: Vec<MockDevice> = (0..4).map(|_| MockDevice::responding("WRONG")).collect();
    let opener = MockOpener::new();
    for (i, device) in devices.iter().enumerate() {
        opener.attach(format!("P{i}"), device.clone());
    }
    let enumerator = FixedEnumerator::from_paths((0..4).map(|i| format!("P{i}")), &quick_config());

    let validator = HandshakeValidator::new(Arc::new(opener), quick_settings());
    assert!(matches!(
        validator.find_device(&enumerator),
        Err(LinkError::NoDeviceFound)
    ));
    for device in &devices {
        assert_eq!(device.open_count(), 1);
        assert!(!device.is_open());
    }
}

#[test]
fn test_serial_enumerator_with_rejecting_filter_is_empty() {
    let reject_all: PortFilter = Arc::new(|_: &PortInfo| false);
    let enumerator = SerialEnumerator::with_filter(LinkConfig::default(), reject_all);
    assert!(enumerator.list_candidates().is_empty());
}

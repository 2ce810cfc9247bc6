mod common;

use std::time::Duration;

use common::{connect, EEPROM_SIZE};
use spd_link::serial::commands::{I2cClock, RswpSupport};
use spd_link::serial::SerialError;

#[tokio::test(flavor = "multi_thread")]
async fn test_identity_queries() {
    let (programmer, sim) = connect().await;
    assert_eq!(programmer.firmware_version().await.unwrap(), 20240215);
    assert_eq!(programmer.name().await.unwrap(), "SPD Programmer");
    assert_eq!(sim.writes().last().unwrap(), &vec![b'n', b'?']);
    programmer.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_set_name() {
    let (programmer, sim) = connect().await;
    assert!(programmer.set_name("Bench A").await.unwrap());
    assert_eq!(sim.writes().last().unwrap(), &[&[b'n', 7][..], &b"Bench A"[..]].concat());
    assert_eq!(programmer.name().await.unwrap(), "Bench A");

    // Same name again is a no-op.
    let writes = sim.writes().len();
    assert!(!programmer.set_name("Bench A").await.unwrap());
    assert_eq!(sim.writes().len(), writes + 1);
    programmer.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_set_name_validation() {
    let (programmer, sim) = connect().await;
    for bad in ["", "   ", "a name that is far too long", "caf\u{e9}"] {
        let err = programmer.set_name(bad).await.unwrap_err();
        assert!(matches!(err, SerialError::InvalidArgument(_)), "{:?} for {:?}", err, bad);
    }
    assert_eq!(sim.write_count(b'n'), 0);
    programmer.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_i2c_clock() {
    let (programmer, sim) = connect().await;
    assert_eq!(programmer.i2c_clock().await.unwrap(), I2cClock::Standard);
    assert!(programmer.set_i2c_clock(I2cClock::Fast).await.unwrap());
    assert_eq!(sim.writes().last().unwrap(), &vec![b'c', 1]);
    assert_eq!(programmer.i2c_clock().await.unwrap(), I2cClock::Fast);
    programmer.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scan_is_cached_until_bus_changes() {
    let (programmer, sim) = connect().await;
    assert_eq!(programmer.scan().await.unwrap(), vec![0x50, 0x52]);
    assert_eq!(programmer.scan().await.unwrap(), vec![0x50, 0x52]);
    assert_eq!(sim.write_count(b's'), 1);

    sim.state().scan_mask = 0b0000_0111;
    sim.alert(b'+');
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(programmer.scan().await.unwrap(), vec![0x50, 0x51, 0x52]);
    assert_eq!(sim.write_count(b's'), 2);

    // Clock alerts leave the bus population alone.
    sim.alert(b'/');
    tokio::time::sleep(Duration::from_millis(50)).await;
    programmer.scan().await.unwrap();
    assert_eq!(sim.write_count(b's'), 2);
    programmer.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bus_change_during_scan_is_not_cached() {
    let (programmer, sim) = connect().await;
    sim.set_delay(b's', Duration::from_millis(200));

    let scanning = programmer.clone();
    let scan = tokio::spawn(async move { scanning.scan().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    // The reply already in flight still carries the old mask.
    sim.state().scan_mask = 0b0000_0111;
    sim.alert(b'+');

    assert_eq!(scan.await.unwrap().unwrap(), vec![0x50, 0x52]);
    assert_eq!(programmer.scan().await.unwrap(), vec![0x50, 0x51, 0x52]);
    assert_eq!(sim.write_count(b's'), 2);
    programmer.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rswp_support_cached() {
    let (programmer, sim) = connect().await;
    let support = programmer.rswp_support().await.unwrap();
    assert!(support.supports(RswpSupport::DDR4));
    assert!(support.supports(RswpSupport::DDR5));
    assert!(!support.supports(RswpSupport::DDR3));
    programmer.rswp_support().await.unwrap();
    assert_eq!(sim.write_count(b'f'), 1);

    sim.alert(b'-');
    tokio::time::sleep(Duration::from_millis(50)).await;
    programmer.rswp_support().await.unwrap();
    assert_eq!(sim.write_count(b'f'), 2);
    programmer.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_probe_and_full_scan() {
    let (programmer, sim) = connect().await;
    assert!(programmer.probe_address(0x50).await.unwrap());
    assert!(!programmer.probe_address(0x51).await.unwrap());

    assert_eq!(programmer.scan_full().await.unwrap(), vec![0x50, 0x52]);
    assert_eq!(sim.write_count(b'a'), 2 + (0x77 - 0x08 + 1));
    programmer.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_single_and_multiple_bytes() {
    let (programmer, sim) = connect().await;
    assert_eq!(programmer.read_byte(0x50, 0x0102).await.unwrap(), (0x0102 % 251) as u8);
    assert_eq!(sim.writes().last().unwrap(), &vec![b'r', 0x50, 0x01, 0x02, 1]);

    let bytes = programmer.read_bytes(0x50, 10, 4).await.unwrap();
    assert_eq!(bytes, vec![10, 11, 12, 13]);

    let err = programmer.read_bytes(0x50, 0, 0).await.unwrap_err();
    assert!(matches!(err, SerialError::InvalidArgument(_)));
    programmer.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_dump_in_chunks() {
    let (programmer, sim) = connect().await;
    let dump = programmer.read_dump(0x50, 512).await.unwrap();
    let expected: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
    assert_eq!(dump, expected);
    assert_eq!(sim.write_count(b'r'), 512 / 32);

    // Odd length ends with a short chunk.
    let dump = programmer.read_dump(0x50, 40).await.unwrap();
    assert_eq!(dump.len(), 40);
    assert_eq!(sim.writes().last().unwrap(), &vec![b'r', 0x50, 0x00, 32, 8]);

    // Device running out of data stops the dump early.
    let dump = programmer.read_dump(0x50, EEPROM_SIZE + 64).await.unwrap();
    assert_eq!(dump.len(), EEPROM_SIZE);
    programmer.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_write_byte_and_update() {
    let (programmer, sim) = connect().await;
    assert!(programmer.write_byte(0x50, 0x20, 0xAB).await.unwrap());
    assert_eq!(sim.state().eeprom[0x20], 0xAB);

    // Unchanged value is not rewritten.
    assert!(programmer.update_byte(0x50, 0x20, 0xAB).await.unwrap());
    assert_eq!(sim.write_count(b'w'), 1);

    assert!(programmer.update_byte(0x50, 0x20, 0xCD).await.unwrap());
    assert_eq!(sim.write_count(b'w'), 2);
    assert_eq!(sim.state().eeprom[0x20], 0xCD);
    programmer.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_write_page() {
    let (programmer, sim) = connect().await;
    let page: Vec<u8> = (0xE0..=0xEF).collect();
    assert!(programmer.write_page(0x50, 0x100, &page).await.unwrap());
    assert_eq!(&sim.state().eeprom[0x100..0x110], page.as_slice());
    let last = sim.writes().last().unwrap().clone();
    assert_eq!(&last[..5], &[b'g', 0x50, 0x01, 0x00, 16]);

    for bad in [Vec::new(), vec![0u8; 33]] {
        let err = programmer.write_page(0x50, 0, &bad).await.unwrap_err();
        assert!(matches!(err, SerialError::InvalidArgument(_)));
    }
    assert_eq!(sim.write_count(b'g'), 1);
    programmer.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_write_protection() {
    let (programmer, sim) = connect().await;
    assert!(!programmer.get_rswp(0x50, 1).await.unwrap());
    assert!(programmer.set_rswp(0x50, 1).await.unwrap());
    assert!(programmer.get_rswp(0x50, 1).await.unwrap());
    assert!(!programmer.get_rswp(0x50, 2).await.unwrap());
    assert!(programmer.clear_rswp(0x50).await.unwrap());
    assert!(!programmer.get_rswp(0x50, 1).await.unwrap());
    assert_eq!(sim.writes().last().unwrap(), &vec![b'b', 0x50, 1, b'?']);
    programmer.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_module_detection_and_hub() {
    let (programmer, _sim) = connect().await;
    assert!(programmer.detect_ddr4(0x50).await.unwrap());
    assert!(!programmer.detect_ddr5(0x50).await.unwrap());
    assert_eq!(programmer.spd_size_code(0x50).await.unwrap(), 2);

    assert!(programmer.write_spd5_hub(0x50, 0x0B, 0x04).await.unwrap());
    assert_eq!(programmer.read_spd5_hub(0x50, 0x0B).await.unwrap(), 0x04);
    programmer.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_factory_reset_clears_cache() {
    let (programmer, sim) = connect().await;
    programmer.set_name("Custom").await.unwrap();
    programmer.scan().await.unwrap();

    assert!(programmer.factory_reset().await.unwrap());
    assert_eq!(programmer.name().await.unwrap(), "SPD Programmer");
    programmer.scan().await.unwrap();
    assert_eq!(sim.write_count(b's'), 2);

    assert!(programmer.reset_config_pins().await.unwrap());
    programmer.disconnect().await;
}

//! Device lifecycle tests.
//!
//! Drives the master and subarray devices through their command sequences
//! with the event loop on and off. With the loop off, attributes are
//! refreshed explicitly after each command; with it on, a command returns
//! once its effect is published.

use std::time::{Duration, Instant};

use sdp_config::{ConfigDb, ProcessingBlockState, SbiStatus};
use sdp_lmc::*;
use serde_json::{Value, json};

const MASTER: &str = "test_sdp/elt/master";
const SUBARRAY: &str = "test_sdp/elt/subarray_1";

const SLEEP: Duration = Duration::from_millis(50);
const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("sdp_lmc=debug")
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds or the timeout expires. Returns whether it
/// held.
fn wait_for(what: &str, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while !check() {
        if start.elapsed() > TIMEOUT {
            tracing::warn!(what, "timed out waiting for condition");
            return false;
        }
        std::thread::sleep(SLEEP);
    }
    true
}

fn master(event_loop: bool) -> (MasterDevice, ConfigDb) {
    init_tracing();
    let store = ConfigDb::open_in_memory().unwrap();
    let device = MasterDevice::new(MASTER, &LmcSettings::in_memory(event_loop), store.clone()).unwrap();
    if !event_loop {
        device.update_attributes().unwrap();
    }
    (device, store)
}

fn subarray(event_loop: bool) -> (SubarrayDevice, ConfigDb) {
    init_tracing();
    let store = ConfigDb::open_in_memory().unwrap();
    let device =
        SubarrayDevice::new(SUBARRAY, &LmcSettings::in_memory(event_loop), store.clone()).unwrap();
    if !event_loop {
        device.update_attributes().unwrap();
    }
    (device, store)
}

/// Run a command and, without an event loop, refresh the attributes.
fn call(device: &dyn Device, event_loop: bool, command: &str, argument: &str) {
    device
        .command_inout(command, argument)
        .expect("known command")
        .unwrap_or_else(|e| panic!("{command} failed: {e}"));
    if !event_loop {
        device.update_attributes().unwrap();
    }
}

fn assign_resources() -> Value {
    json!({
        "interface": "https://schema.skao.int/ska-sdp-assignres/0.3",
        "eb_id": "eb-test-20210630-00000",
        "max_length": 21600.0,
        "scan_types": [
            {"scan_type_id": "science", "reference_frame": "ICRS"},
            {"scan_type_id": "calibration", "reference_frame": "ICRS"}
        ],
        "processing_blocks": [
            {
                "pb_id": "pb-test-20210630-00000",
                "workflow": {"kind": "realtime", "name": "test_receive_addresses", "version": "0.3.2"},
                "parameters": {}
            },
            {
                "pb_id": "pb-test-20210630-00001",
                "workflow": {"kind": "batch", "name": "test_batch", "version": "0.2.2"},
                "parameters": {},
                "dependencies": [{"pb_id": "pb-test-20210630-00000", "kind": ["visibilities"]}]
            }
        ]
    })
}

fn receive_addresses() -> Value {
    json!({
        "science": {"vis0": {"host": [[0, "192.168.0.1"]], "port": [[0, 9000, 1]]}},
        "calibration": {"vis0": {"host": [[0, "192.168.0.1"]], "port": [[0, 9000, 1]]}}
    })
}

/// What the receive workflow does once deployed: nominate the real-time
/// processing block as the source of receive addresses and publish them.
fn mock_receive_workflow(store: &ConfigDb, sbi_id: &str) {
    store
        .transaction(|txn| {
            let mut sbi = txn.get_scheduling_block(sbi_id)?.expect("sbi exists");
            let pb_id = sbi.pb_realtime[0].clone();
            sbi.pb_receive_addresses = Some(pb_id.clone());
            txn.update_scheduling_block(&sbi)?;
            let state = ProcessingBlockState {
                status: Some("RUNNING".to_string()),
                receive_addresses: Some(receive_addresses()),
            };
            txn.create_processing_block_state(&pb_id, &state)
        })
        .unwrap();
}

// ── Master ────────────────────────────────────────────────────────

fn master_sequence(event_loop: bool) {
    let (device, _store) = master(event_loop);
    assert_eq!(device.state(), Some(DevState::Standby));

    for (command, expected) in [
        ("On", DevState::On),
        ("Disable", DevState::Disable),
        ("On", DevState::On),
        ("Standby", DevState::Standby),
        ("Off", DevState::Off),
    ] {
        call(&device, event_loop, command, "");
        assert_eq!(device.state(), Some(expected), "after {command}");
    }
    device.shutdown();
}

#[test]
fn master_lifecycle_with_event_loop() {
    master_sequence(true);
}

#[test]
fn master_lifecycle_without_event_loop() {
    master_sequence(false);
}

#[test]
fn master_repeated_command_is_rejected() {
    let (device, store) = master(true);
    device.on("").unwrap();
    let revision = store.revision();

    let err = device.on("").unwrap_err();
    assert_eq!(err.reason(), Reason::CommandNotAllowed);
    assert_eq!(err.description(), "Command On not allowed when device state is ON");
    assert_eq!(store.revision(), revision);
}

#[test]
fn master_reinit_keeps_stored_state() {
    init_tracing();
    let store = ConfigDb::open_in_memory().unwrap();
    let settings = LmcSettings::in_memory(true);
    let device = MasterDevice::new(MASTER, &settings, store.clone()).unwrap();
    device.on("").unwrap();
    device.shutdown();
    drop(device);

    let device = MasterDevice::new(MASTER, &settings, store).unwrap();
    assert_eq!(device.state(), Some(DevState::On));
}

// ── Subarray ──────────────────────────────────────────────────────

fn subarray_sequence(event_loop: bool) {
    let (device, store) = subarray(event_loop);
    assert_eq!(device.state(), Some(DevState::Off));
    assert_eq!(device.obs_state(), Some(ObsState::Empty));

    call(&device, event_loop, "On", "");
    assert_eq!(device.state(), Some(DevState::On));
    assert_eq!(device.obs_state(), Some(ObsState::Empty));

    // No receive addresses yet: the subarray sits in RESOURCING.
    call(&device, event_loop, "AssignResources", &assign_resources().to_string());
    assert_eq!(device.obs_state(), Some(ObsState::Resourcing));
    assert_eq!(device.receive_addresses(), "null");

    mock_receive_workflow(&store, "eb-test-20210630-00000");
    if event_loop {
        assert!(wait_for("obsState IDLE", || device.obs_state() == Some(ObsState::Idle)));
    } else {
        device.update_attributes().unwrap();
    }
    assert_eq!(device.obs_state(), Some(ObsState::Idle));
    let published: Value = serde_json::from_str(&device.receive_addresses()).unwrap();
    assert_eq!(published, receive_addresses());

    let configure = json!({
        "interface": "https://schema.skao.int/ska-sdp-configure/0.3",
        "scan_type": "science"
    });
    call(&device, event_loop, "Configure", &configure.to_string());
    assert_eq!(device.obs_state(), Some(ObsState::Ready));
    assert_eq!(device.scan_type(), "science");

    let scan = json!({"interface": "https://schema.skao.int/ska-sdp-scan/0.3", "scan_id": 1});
    call(&device, event_loop, "Scan", &scan.to_string());
    assert_eq!(device.obs_state(), Some(ObsState::Scanning));
    assert_eq!(device.scan_id(), 1);

    call(&device, event_loop, "EndScan", "");
    assert_eq!(device.obs_state(), Some(ObsState::Ready));
    assert_eq!(device.scan_id(), 0);

    call(&device, event_loop, "End", "");
    assert_eq!(device.obs_state(), Some(ObsState::Idle));
    assert_eq!(device.scan_type(), "null");

    call(&device, event_loop, "ReleaseResources", "");
    assert_eq!(device.obs_state(), Some(ObsState::Empty));
    assert_eq!(device.receive_addresses(), "null");
    let sbi = store
        .transaction(|txn| txn.get_scheduling_block("eb-test-20210630-00000"))
        .unwrap()
        .unwrap();
    assert_eq!(sbi.status, SbiStatus::Finished);
    assert_eq!(sbi.subarray_id, None);

    call(&device, event_loop, "Off", "");
    assert_eq!(device.state(), Some(DevState::Off));
    assert_eq!(device.obs_state(), Some(ObsState::Empty));
    device.shutdown();
}

#[test]
fn subarray_lifecycle_with_event_loop() {
    subarray_sequence(true);
}

#[test]
fn subarray_lifecycle_without_event_loop() {
    subarray_sequence(false);
}

#[test]
fn subarray_abort_and_restart() {
    let (device, store) = subarray(true);
    device.on("").unwrap();
    device.assign_resources(&assign_resources().to_string()).unwrap();
    mock_receive_workflow(&store, "eb-test-20210630-00000");
    assert!(wait_for("obsState IDLE", || device.obs_state() == Some(ObsState::Idle)));

    device.abort("").unwrap();
    assert_eq!(device.obs_state(), Some(ObsState::Aborted));

    device.obs_reset("").unwrap();
    assert_eq!(device.obs_state(), Some(ObsState::Idle));

    device.abort("").unwrap();
    device.restart("").unwrap();
    assert_eq!(device.obs_state(), Some(ObsState::Empty));
    let sbi = store
        .transaction(|txn| txn.get_scheduling_block("eb-test-20210630-00000"))
        .unwrap()
        .unwrap();
    assert_eq!(sbi.status, SbiStatus::Cancelled);
}

#[test]
fn subarray_off_cancels_assigned_sbi() {
    let (device, store) = subarray(true);
    device.on("").unwrap();
    device.assign_resources(&assign_resources().to_string()).unwrap();
    mock_receive_workflow(&store, "eb-test-20210630-00000");
    assert!(wait_for("obsState IDLE", || device.obs_state() == Some(ObsState::Idle)));

    device.off("").unwrap();
    assert_eq!(device.state(), Some(DevState::Off));
    assert_eq!(device.obs_state(), Some(ObsState::Empty));
    let sbi = store
        .transaction(|txn| txn.get_scheduling_block("eb-test-20210630-00000"))
        .unwrap()
        .unwrap();
    assert_eq!(sbi.status, SbiStatus::Cancelled);
}

#[test]
fn configure_with_new_scan_type() {
    let (device, store) = subarray(false);
    call(&device, false, "On", "");
    call(&device, false, "AssignResources", &assign_resources().to_string());
    mock_receive_workflow(&store, "eb-test-20210630-00000");
    device.update_attributes().unwrap();

    let configure = json!({
        "interface": "https://schema.skao.int/ska-sdp-configure/0.3",
        "new_scan_types": [{"scan_type_id": "new_calibration", "reference_frame": "ICRS"}],
        "scan_type": "new_calibration"
    });
    call(&device, false, "Configure", &configure.to_string());
    assert_eq!(device.scan_type(), "new_calibration");

    // Redefining a scan type fails and leaves the subarray as it was.
    let err = device.configure(&configure.to_string()).unwrap_err();
    assert_eq!(err.reason(), Reason::CommandFailed);
    assert_eq!(err.description(), "Scan type new_calibration is already defined");

    let unknown = json!({"scan_type": "bogus"});
    let err = device.configure(&unknown.to_string()).unwrap_err();
    assert_eq!(err.description(), "Scan type bogus is not defined");
    device.update_attributes().unwrap();
    assert_eq!(device.scan_type(), "new_calibration");
}

#[test]
fn assign_resources_rejects_duplicate_sbi() {
    let (device, store) = subarray(true);
    device.on("").unwrap();
    device.assign_resources(&assign_resources().to_string()).unwrap();

    // Second subarray, same SBI id.
    let other = SubarrayDevice::new(
        "test_sdp/elt/subarray_2",
        &LmcSettings::in_memory(true),
        store.clone(),
    )
    .unwrap();
    other.on("").unwrap();
    let err = other
        .assign_resources(&assign_resources().to_string())
        .unwrap_err();
    assert_eq!(err.reason(), Reason::CommandFailed);
    assert_eq!(
        err.description(),
        "scheduling block instance eb-test-20210630-00000 already exists"
    );
    assert_eq!(other.obs_state(), Some(ObsState::Empty));
    let record = store.transaction(|txn| txn.get_subarray("02")).unwrap().unwrap();
    assert_eq!(record.sbi_id, None);
}

#[test]
fn invalid_payload_fails_without_writing() {
    let (device, store) = subarray(true);
    device.on("").unwrap();
    let revision = store.revision();

    let err = device.assign_resources(r#"{"interface": "bogus"}"#).unwrap_err();
    assert_eq!(err.reason(), Reason::CommandFailed);
    assert_eq!(err.description(), "Configuration validation failed");

    let err = device.assign_resources("not json").unwrap_err();
    assert_eq!(err.reason(), Reason::CommandFailed);
    assert_eq!(store.revision(), revision);
    assert_eq!(device.obs_state(), Some(ObsState::Empty));
}

#[test]
fn transaction_id_is_recorded() {
    let (device, store) = subarray(true);
    device.on(r#"{"transaction_id": "txn-test-20210630-00001"}"#).unwrap();
    let record = store.transaction(|txn| txn.get_subarray("01")).unwrap().unwrap();
    assert_eq!(record.transaction_id.as_deref(), Some("txn-test-20210630-00001"));
    assert_eq!(record.last_command.as_deref(), Some("On"));

    device.off("").unwrap();
    let record = store.transaction(|txn| txn.get_subarray("01")).unwrap().unwrap();
    assert!(record.transaction_id.unwrap().starts_with("txn-local-"));
}

// ── Events ────────────────────────────────────────────────────────

#[test]
fn change_events_follow_commands() {
    let (device, _store) = subarray(true);
    let rx = device.subscribe();

    device.on("").unwrap();
    let events: Vec<ChangeEvent> = rx.try_iter().collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].device, SUBARRAY);
    assert_eq!(events[0].attribute, "State");
    assert_eq!(events[0].before, AttributeValue::State(Some(DevState::Off)));
    assert_eq!(events[0].after, AttributeValue::State(Some(DevState::On)));

    device.assign_resources(&assign_resources().to_string()).unwrap();
    let events: Vec<ChangeEvent> = rx.try_iter().collect();
    assert!(
        events
            .iter()
            .any(|e| e.attribute == "obsState"
                && e.after == AttributeValue::ObsState(Some(ObsState::Resourcing)))
    );
}

#[test]
fn no_events_without_changes() {
    let (device, _store) = master(false);
    let rx = device.subscribe();
    device.update_attributes().unwrap();
    device.update_attributes().unwrap();
    assert!(rx.try_recv().is_err());
}

// ── Event loop ────────────────────────────────────────────────────

#[test]
fn external_write_is_picked_up() {
    let (device, store) = master(true);
    store
        .transaction(|txn| {
            let mut record = txn.get_master()?.expect("master entry");
            record.state = Some("DISABLE".to_string());
            txn.update_master(&record)
        })
        .unwrap();
    assert!(wait_for("state DISABLE", || device.state() == Some(DevState::Disable)));
}

#[test]
fn shutdown_stops_reconciling() {
    let (device, store) = master(true);
    device.shutdown();
    device.shutdown();

    // Commands still write, but nothing publishes them any more.
    device.on("").unwrap();
    assert_eq!(device.state(), Some(DevState::Standby));
    let record = store.transaction(|txn| txn.get_master()).unwrap().unwrap();
    assert_eq!(record.state.as_deref(), Some("ON"));

    device.update_attributes().unwrap();
    assert_eq!(device.state(), Some(DevState::On));
}

#[test]
fn devices_share_one_store() {
    init_tracing();
    let store = ConfigDb::open_in_memory().unwrap();
    let settings = LmcSettings::in_memory(true);
    let master = MasterDevice::new(MASTER, &settings, store.clone()).unwrap();
    let subarray = SubarrayDevice::new(SUBARRAY, &settings, store.clone()).unwrap();

    master.on("").unwrap();
    subarray.on("").unwrap();
    assert_eq!(master.state(), Some(DevState::On));
    assert_eq!(subarray.state(), Some(DevState::On));

    let mut subarrays = store.transaction(|txn| txn.list_subarrays()).unwrap();
    subarrays.sort();
    assert_eq!(subarrays, vec!["01".to_string()]);
}

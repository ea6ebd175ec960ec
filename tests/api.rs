use color_eyre::Result;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

mod common;
use common::{connect, start_server, two_device_mapping, SLOT_5};

#[tokio::test]
async fn the_service_reports_liveness() -> Result<()> {
    let server = start_server(&two_device_mapping()).await;

    let body = reqwest::get(server.http("/")).await?.text().await?;
    assert!(body.contains("is up"));

    Ok(())
}

#[tokio::test]
async fn devices_lists_the_current_mapping() -> Result<()> {
    let server = start_server(&two_device_mapping()).await;

    let mapping: Value = reqwest::get(server.http("/api/devices")).await?.json().await?;

    let devices = mapping["devices"].as_array().unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0]["id"], SLOT_5);
    assert_eq!(mapping["deviceType"], "UART");

    Ok(())
}

#[tokio::test]
async fn a_slot_edit_becomes_routable_and_deletable() -> Result<()> {
    let server = start_server(&two_device_mapping()).await;
    let http = reqwest::Client::new();

    // Map slot 7 to strip 1, outlet 2.
    let response = http
        .put(server.http("/api/slot-mapping/7"))
        .json(&json!("1:2"))
        .send()
        .await?;
    assert!(response.status().is_success());

    let mapping: Value = reqwest::get(server.http("/api/devices")).await?.json().await?;
    let new_device = mapping["devices"]
        .as_array()
        .unwrap()
        .iter()
        .find(|device| device["id"] == "000000000007")
        .expect("The edited slot shows up");
    assert_eq!(
        new_device["connectionProperties"]["port"],
        "/dev/ttyO001"
    );

    // The new slot accepts clients.
    connect(&server, "000000000007").await?;

    // And deleting it takes it out of the mapping again.
    let response = http
        .delete(server.http("/api/slot-mapping/7"))
        .send()
        .await?;
    assert!(response.status().is_success());

    let mapping: Value = reqwest::get(server.http("/api/devices")).await?.json().await?;
    assert_eq!(mapping["devices"].as_array().unwrap().len(), 2);

    Ok(())
}

#[tokio::test]
async fn bad_slot_edits_are_rejected_and_change_nothing() -> Result<()> {
    let server = start_server(&two_device_mapping()).await;
    let http = reqwest::Client::new();

    for bad_spec in ["1:0", "0:1", "N/A", "1:2:", "1:2:fast", "nonsense"] {
        let response = http
            .put(server.http("/api/slot-mapping/7"))
            .json(&json!(bad_spec))
            .send()
            .await?;

        assert_eq!(
            response.status(),
            reqwest::StatusCode::BAD_REQUEST,
            "`{bad_spec}` should be rejected"
        );
    }

    let mapping: Value = reqwest::get(server.http("/api/devices")).await?.json().await?;
    assert_eq!(mapping["devices"].as_array().unwrap().len(), 2);

    Ok(())
}

#[tokio::test]
async fn a_full_mapping_replacement_from_a_slot_table() -> Result<()> {
    let server = start_server(&two_device_mapping()).await;
    let http = reqwest::Client::new();

    let response = http
        .post(server.http("/api/slot-mapping"))
        .json(&json!({ "slots": { "8": "2:1:9600", "9": ["1:1", "1:2"] } }))
        .send()
        .await?;
    assert!(response.status().is_success());

    let mapping: Value = reqwest::get(server.http("/api/devices")).await?.json().await?;
    let devices = mapping["devices"].as_array().unwrap();
    assert_eq!(devices.len(), 3);

    // The old slots are gone entirely.
    assert!(!devices.iter().any(|device| device["id"] == SLOT_5));

    let with_baud = devices
        .iter()
        .find(|device| device["id"] == "000000000008")
        .unwrap();
    assert_eq!(with_baud["connectionProperties"]["baud"], 9600);
    assert_eq!(with_baud["connectionProperties"]["port"], "/dev/ttyO100");

    Ok(())
}

#[tokio::test]
async fn device_writes_take_hex_and_binary_payloads() -> Result<()> {
    let server = start_server(&two_device_mapping()).await;
    let http = reqwest::Client::new();

    // Hex text is the default payload flavor.
    let response = http
        .post(server.http(&format!("/api/device/{SLOT_5}/write")))
        .body("48656c6c6f")
        .send()
        .await?;
    assert!(response.status().is_success());

    // Raw bytes pass through under octet-stream.
    let response = http
        .post(server.http(&format!("/api/device/{SLOT_5}/write")))
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .body(vec![0xDE, 0xAD, 0xBE, 0xEF])
        .send()
        .await?;
    assert!(response.status().is_success());

    Ok(())
}

#[tokio::test]
async fn malformed_hex_writes_are_rejected() -> Result<()> {
    let server = start_server(&two_device_mapping()).await;
    let http = reqwest::Client::new();

    let response = http
        .post(server.http(&format!("/api/device/{SLOT_5}/write")))
        .body("zz")
        .send()
        .await?;

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    Ok(())
}

#[tokio::test]
async fn writes_to_unknown_slots_are_rejected() -> Result<()> {
    let server = start_server(&two_device_mapping()).await;
    let http = reqwest::Client::new();

    let response = http
        .post(server.http("/api/device/000000000099/write"))
        .body("48656c6c6f")
        .send()
        .await?;

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn the_health_snapshot_covers_every_mapped_device() -> Result<()> {
    let server = start_server(&two_device_mapping()).await;

    let health: Value = reqwest::get(server.http("/api/health")).await?.json().await?;

    let ports = health["dependenciesHealthStatus"].as_array().unwrap();
    assert_eq!(ports.len(), 2);

    // The test ports do not exist, so the rack is unhealthy.
    assert_eq!(health["isHealthy"], false);
    assert_eq!(ports[0]["isHealthy"], false);
    assert_eq!(ports[0]["deviceId"], SLOT_5);

    // No strips on a UART rack.
    assert_eq!(health["hwDevicesHealthStatus"].as_array().unwrap().len(), 0);

    Ok(())
}

#[tokio::test]
async fn strip_actions_are_refused_on_uart_racks() -> Result<()> {
    let server = start_server(&two_device_mapping()).await;
    let http = reqwest::Client::new();

    for path in ["/api/reboot", "/api/profile"] {
        let response = http.post(server.http(path)).send().await?;
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    Ok(())
}

use std::time::Duration;

use color_eyre::Result;
use futures::SinkExt;
use tokio::time::timeout;
use tungstenite::Message;

mod common;
use common::{connect, receive, start_server, two_device_mapping, SLOT_5, SLOT_6};

#[tokio::test]
async fn can_connect_to_a_mapped_slot() -> Result<()> {
    let server = start_server(&two_device_mapping()).await;

    connect(&server, SLOT_5).await?;
    connect(&server, SLOT_6).await?;

    Ok(())
}

#[tokio::test]
async fn unknown_slots_are_rejected_at_the_handshake() -> Result<()> {
    let server = start_server(&two_device_mapping()).await;

    for bad_slot in ["000000000099", "not-a-slot"] {
        let error = tokio_tungstenite::connect_async(server.ws(bad_slot))
            .await
            .expect_err("The handshake should be refused");

        match error {
            tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND)
            }
            other => panic!("Expected an HTTP rejection, got {other:?}"),
        }
    }

    Ok(())
}

#[tokio::test]
async fn a_disconnect_is_announced_to_the_remaining_clients() -> Result<()> {
    let server = start_server(&two_device_mapping()).await;

    let mut staying = connect(&server, SLOT_5).await?;
    let mut leaving = connect(&server, SLOT_5).await?;

    leaving.close(None).await?;

    // The courtesy note is an empty line.
    let note = receive(&mut staying).await?;
    assert_eq!(note, Message::Text(String::new()));

    Ok(())
}

#[tokio::test]
async fn clients_of_other_slots_do_not_hear_the_disconnect() -> Result<()> {
    let server = start_server(&two_device_mapping()).await;

    let mut other_slot = connect(&server, SLOT_6).await?;
    let mut leaving = connect(&server, SLOT_5).await?;

    leaving.close(None).await?;

    let nothing = timeout(Duration::from_secs(1), receive(&mut other_slot)).await;
    assert!(nothing.is_err(), "Slot 6 should not see slot 5 traffic");

    Ok(())
}

#[tokio::test]
async fn global_commands_do_not_close_the_connection() -> Result<()> {
    let server = start_server(&two_device_mapping()).await;

    let mut client = connect(&server, SLOT_5).await?;

    for command in [
        "CATSHealthReport",
        "CATSAutoDiscover On",
        "CATSAutoDiscover Off",
    ] {
        client.send(Message::Text(command.into())).await?;
    }

    // Ordinary messages still route fine afterwards.
    client.send(Message::Text("hello device".into())).await?;

    // And no response or close came back from any of it.
    let nothing = timeout(Duration::from_secs(1), receive(&mut client)).await;
    assert!(nothing.is_err());

    Ok(())
}

#[tokio::test]
async fn a_client_of_a_deleted_slot_is_closed_abnormally_on_its_next_message() -> Result<()> {
    let server = start_server(&two_device_mapping()).await;

    let mut client = connect(&server, SLOT_5).await?;

    // Slot 5 disappears from the mapping while the client is connected.
    let http = reqwest::Client::new();
    let response = http
        .delete(server.http("/api/slot-mapping/5"))
        .send()
        .await?;
    assert!(response.status().is_success());

    client.send(Message::Text("are you there".into())).await?;

    match receive(&mut client).await? {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1011),
        other => panic!("Expected an abnormal close, got {other:?}"),
    }

    Ok(())
}

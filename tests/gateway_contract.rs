use httpmock::prelude::*;
use serde_json::json;

use accessd::payments::{GatewayClient, GatewayError, GatewayStatus, PixGatewayClient};

fn client(server: &MockServer) -> PixGatewayClient {
    PixGatewayClient::new(server.base_url(), "test-token")
}

#[tokio::test]
async fn create_intent_parses_the_provider_payload() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/payments")
                .header("authorization", "Bearer test-token")
                .header_exists("x-idempotency-key")
                .json_body_partial(
                    json!({
                        "payment_method_id": "pix",
                        "transaction_amount": 10.0,
                        "payer": {"email": "payer@test"}
                    })
                    .to_string(),
                );
            then.status(201).json_body(json!({
                "id": 123456789,
                "status": "pending",
                "point_of_interaction": {
                    "transaction_data": {
                        "qr_code": "00020126pixcopypaste",
                        "qr_code_base64": "aGVsbG8=",
                        "ticket_url": "https://gateway.test/ticket/123456789"
                    }
                }
            }));
        })
        .await;

    let intent = client(&server)
        .create_intent(1000, "payer@test", "Weekly Plan - premium access")
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(intent.intent_id, "123456789");
    assert_eq!(intent.status, GatewayStatus::Pending);
    assert_eq!(intent.qr_code, "00020126pixcopypaste");
    assert_eq!(intent.ticket_url, "https://gateway.test/ticket/123456789");
}

#[tokio::test]
async fn create_intent_surfaces_provider_refusals() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/payments");
            then.status(400)
                .json_body(json!({"message": "invalid transaction_amount"}));
        })
        .await;

    let result = client(&server)
        .create_intent(0, "payer@test", "broken")
        .await;
    assert!(matches!(result, Err(GatewayError::Request(_))));
}

#[tokio::test]
async fn status_query_maps_provider_statuses() {
    let server = MockServer::start_async().await;
    for (raw, expected) in [
        ("approved", GatewayStatus::Approved),
        ("rejected", GatewayStatus::Rejected),
        ("in_process", GatewayStatus::Pending),
        ("charged_back", GatewayStatus::Unknown),
    ] {
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(format!("/v1/payments/intent-{raw}"))
                    .header("authorization", "Bearer test-token");
                then.status(200)
                    .json_body(json!({"id": format!("intent-{raw}"), "status": raw}));
            })
            .await;

        let status = client(&server)
            .get_status(&format!("intent-{raw}"))
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(status, expected, "provider status {raw}");
    }
}

#[tokio::test]
async fn missing_intents_read_as_unknown_not_errors() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/payments/ghost");
            then.status(404).json_body(json!({"message": "not found"}));
        })
        .await;

    let status = client(&server).get_status("ghost").await.unwrap();
    assert_eq!(status, GatewayStatus::Unknown);
}

#[tokio::test]
async fn provider_outages_are_transient() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/payments/intent-1");
            then.status(502);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/payments");
            then.status(500);
        })
        .await;

    let client = client(&server);
    assert!(matches!(
        client.get_status("intent-1").await,
        Err(GatewayError::Transient(_))
    ));
    assert!(matches!(
        client.create_intent(1000, "payer@test", "plan").await,
        Err(GatewayError::Transient(_))
    ));
}

#![cfg(test)]

//! End-to-end tests of the HTTP API.
//!
//! Each test starts a server on an unused port, backed by an in-memory ticket store and a
//! [`RecordingMessenger`] in place of WhatsApp, then drives it over HTTP with a surf client.

use super::Options;
use ansi_term::Color;
use anyhow::Error;
use async_std::{
    sync::Arc,
    task::{sleep, spawn},
};
use clap::Parser;
use model::{
    init_logging,
    store::{MemoryStore, TicketStore},
    ticket::ResolverGroup,
    webhook::{Verifier, SIGNATURE_HEADER},
    whatsapp::RecordingMessenger,
    Workflow,
};
use portpicker::pick_unused_port;
use serde_json::{json, Value};
use std::time::Duration;
use surf::{http::mime, Client, StatusCode};

struct TestServer {
    client: Client,
    store: MemoryStore,
    messenger: RecordingMessenger,
    verifier: Verifier,
}

impl TestServer {
    /// Start a server with additional command line `args`.
    async fn start(args: &[&str]) -> Result<Self, Error> {
        init_logging();

        let port = pick_unused_port().unwrap();
        let port_arg = port.to_string();
        let opt = Options::parse_from(
            ["relay-server", "--port", &port_arg, "--store", "memory"]
                .into_iter()
                .chain(args.iter().copied()),
        );
        let verifier = opt.whatsapp.verifier();

        let store = MemoryStore::default();
        let messenger = RecordingMessenger::default();
        let workflow = Workflow::new(Arc::new(store.clone()), Arc::new(messenger.clone()));
        spawn(async move {
            opt.serve_workflow(workflow).await.unwrap();
            tracing::warn!("server exited");
        });

        let client: Client = surf::Config::default()
            .set_base_url(format!("http://127.0.0.1:{port}").parse().unwrap())
            .try_into()
            .unwrap();
        wait_for_server(&client).await?;

        Ok(Self {
            client,
            store,
            messenger,
            verifier,
        })
    }

    async fn get(&self, path: &str) -> Result<(StatusCode, Value), Error> {
        let res = self.client.get(path).await.map_err(Error::msg)?;
        read(res).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<(StatusCode, Value), Error> {
        let res = self
            .client
            .post(path)
            .body_json(body)
            .map_err(Error::msg)?
            .await
            .map_err(Error::msg)?;
        read(res).await
    }

    async fn patch(&self, path: &str, body: &Value) -> Result<(StatusCode, Value), Error> {
        let res = self
            .client
            .patch(path)
            .body_json(body)
            .map_err(Error::msg)?
            .await
            .map_err(Error::msg)?;
        read(res).await
    }

    /// Deliver a webhook payload, signing it if the server expects signatures.
    async fn deliver(&self, payload: &Value) -> Result<StatusCode, Error> {
        let body = serde_json::to_vec(payload)?;
        let mut req = self.client.post("/webhook").content_type(mime::JSON);
        if let Some(signature) = self.verifier.sign(&body) {
            req = req.header(SIGNATURE_HEADER, signature);
        }
        let res = req.body_bytes(body).await.map_err(Error::msg)?;
        Ok(res.status())
    }

    async fn report(&self, incident: &str, subcategory: &str) -> Result<String, Error> {
        let (status, created) = self
            .post(
                "/tickets",
                &json!({
                    "incidentName": incident,
                    "subcategory": subcategory,
                    "priority": "high",
                    "createdBy": "worker-7",
                }),
            )
            .await?;
        assert_eq!(status, StatusCode::Created, "{created}");
        assert_eq!(created["ticketId"], created["docId"]);
        Ok(created["ticketId"].as_str().unwrap().to_string())
    }

    async fn status_of(&self, number: &str) -> Result<Value, Error> {
        let (status, ticket) = self.get(&format!("/tickets/by-number/{number}")).await?;
        assert_eq!(status, StatusCode::Ok);
        Ok(ticket["status"].clone())
    }
}

/// The status and JSON body of a response. Empty or non-JSON bodies read as null.
async fn read(mut res: surf::Response) -> Result<(StatusCode, Value), Error> {
    let body = res.body_string().await.map_err(Error::msg)?;
    Ok((res.status(), serde_json::from_str(&body).unwrap_or(Value::Null)))
}

fn text_message(from: &str, text: &str) -> Value {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "messages": [{ "from": from, "type": "text", "text": { "body": text } }],
                },
            }],
        }],
    })
}

async fn wait_for_server(client: &Client) -> Result<(), Error> {
    const MAX_CONNECT_RETRIES: usize = 60;

    for _ in 0..MAX_CONNECT_RETRIES {
        match client.get("/health").await {
            Ok(res) if res.status().is_success() => return Ok(()),
            Ok(res) => tracing::warn!("waiting for server to start: {}", res.status()),
            Err(err) => tracing::warn!("waiting for server to start: {err}"),
        }
        sleep(Duration::from_secs(1)).await;
    }

    Err(Error::msg(format!(
        "{}",
        Color::Red.paint("timed out waiting for server")
    )))
}

#[async_std::test]
async fn ticket_lifecycle() -> Result<(), Error> {
    let server = TestServer::start(&[]).await?;
    server
        .store
        .put_resolver_group(&ResolverGroup::new("EHS Machinery", ["15550001111"]))
        .await?;

    // Report an incident. The machinery group hears about it.
    let number = server.report("Machinery", "Crushing").await?;
    let notified = server.messenger.sent_to("15550001111").await;
    assert_eq!(notified.len(), 1);
    assert!(notified[0].starts_with(&format!("New Incident Reported\nTicket: {number}\n")));

    let (status, ticket) = server.get(&format!("/tickets/by-number/{number}")).await?;
    assert_eq!(status, StatusCode::Ok);
    assert_eq!(ticket["status"], "queue_generic");
    assert_eq!(ticket["assignedGroup"], "EHS Machinery");
    assert_eq!(ticket["createdBy"], "worker-7");
    assert!(ticket["slaDeadlineAt"].is_string());

    // A responder accepts it over WhatsApp.
    server.messenger.clear().await;
    let status = server
        .deliver(&text_message("15550001111", &format!("accept {number}")))
        .await?;
    assert_eq!(status, StatusCode::Ok);
    assert_eq!(server.status_of(&number).await?, "assigned");
    assert_eq!(
        server.messenger.sent_to("15550001111").await,
        [format!("Accepted {number}. You are assigned.")]
    );

    server.messenger.clear().await;
    server
        .deliver(&text_message("15550001111", &format!("STATUS {number}")))
        .await?;
    assert_eq!(
        server.messenger.sent_to("15550001111").await,
        [format!("Status for {number}: assigned")]
    );

    // Gibberish gets usage help, commands for missing tickets get nothing.
    server.messenger.clear().await;
    server.deliver(&text_message("15550001111", "hi")).await?;
    server
        .deliver(&text_message("15550001111", "CLOSE TKT-1"))
        .await?;
    assert_eq!(
        server.messenger.sent_to("15550001111").await,
        [model::command::USAGE]
    );

    // The ticket shows up in its subcategory.
    let (status, tickets) = server.get("/tickets/Machinery/Crushing").await?;
    assert_eq!(status, StatusCode::Ok);
    assert_eq!(tickets.as_array().unwrap().len(), 1);
    assert_eq!(tickets[0]["ticketNumber"], number.as_str());

    // Close it through the API.
    let (status, ticket) = server
        .patch(
            &format!("/tickets/Machinery/Crushing/{number}"),
            &json!({ "status": "closed", "assignedTo": null }),
        )
        .await?;
    assert_eq!(status, StatusCode::Ok);
    assert_eq!(ticket["status"], "closed");
    assert_eq!(ticket["assignedTo"], Value::Null);
    assert!(ticket["updatedAt"].is_string());

    let (status, ticket) = server
        .get(&format!("/tickets/Machinery/Crushing/{number}"))
        .await?;
    assert_eq!(status, StatusCode::Ok);
    assert_eq!(ticket["status"], "closed");

    Ok(())
}

#[async_std::test]
async fn missing_and_invalid_tickets() -> Result<(), Error> {
    let server = TestServer::start(&[]).await?;

    let (status, _) = server.get("/tickets/by-number/TKT-1").await?;
    assert_eq!(status, StatusCode::NotFound);
    let (status, _) = server.get("/tickets/Machinery/Crushing/TKT-1").await?;
    assert_eq!(status, StatusCode::NotFound);
    let (status, _) = server
        .patch("/tickets/Machinery/Crushing/TKT-1", &json!({ "status": "closed" }))
        .await?;
    assert_eq!(status, StatusCode::NotFound);
    let (status, tickets) = server.get("/tickets/Machinery/Crushing").await?;
    assert_eq!(status, StatusCode::Ok);
    assert_eq!(tickets, json!([]));

    let (status, _) = server.get("/tickets/by-number/12345").await?;
    assert_eq!(status, StatusCode::BadRequest);
    let (status, _) = server
        .post("/tickets", &json!({ "incidentName": "", "subcategory": "Crushing" }))
        .await?;
    assert_eq!(status, StatusCode::BadRequest);
    let (status, _) = server
        .post("/tickets", &json!({ "incidentName": "Machinery" }))
        .await?;
    assert_eq!(status, StatusCode::BadRequest);
    assert!(server.messenger.sent().await.is_empty());

    Ok(())
}

#[async_std::test]
async fn titles_with_spaces_and_slashes() -> Result<(), Error> {
    let server = TestServer::start(&["--wa-managers", "15550009999"]).await?;
    let number = server
        .report("Electrical Hazards", "Arc Flash/Blast")
        .await?;

    // No Electrical Safety Team group is registered, so the managers are told.
    assert_eq!(server.messenger.sent_to("15550009999").await.len(), 1);

    let (status, tickets) = server
        .get("/tickets/Electrical%20Hazards/Arc%20Flash-Blast")
        .await?;
    assert_eq!(status, StatusCode::Ok);
    assert_eq!(tickets[0]["ticketNumber"], number.as_str());
    assert_eq!(tickets[0]["subcategory"], "Arc Flash/Blast");
    assert_eq!(tickets[0]["assignedGroup"], "Electrical Safety Team");

    Ok(())
}

#[async_std::test]
async fn webhook_subscription() -> Result<(), Error> {
    let server = TestServer::start(&["--wa-verify-token", "s3cret"]).await?;

    let res = server
        .client
        .get("/webhook?hub.mode=subscribe&hub.verify_token=s3cret&hub.challenge=1158201444")
        .recv_string()
        .await
        .map_err(Error::msg)?;
    assert_eq!(res, "1158201444");

    let (status, _) = server
        .get("/webhook?hub.mode=subscribe&hub.verify_token=guess&hub.challenge=1")
        .await?;
    assert_eq!(status, StatusCode::Forbidden);
    let (status, _) = server.get("/webhook").await?;
    assert_eq!(status, StatusCode::Forbidden);

    Ok(())
}

#[async_std::test]
async fn webhook_signatures() -> Result<(), Error> {
    let server = TestServer::start(&["--wa-app-secret", "app-secret"]).await?;
    let number = server.report("Fire", "Smoke").await?;
    let accept = text_message("15550001111", &format!("ACCEPT {number}"));

    // Unsigned and forged deliveries are refused.
    let res = server
        .client
        .post("/webhook")
        .body_json(&accept)
        .map_err(Error::msg)?
        .await
        .map_err(Error::msg)?;
    assert_eq!(res.status(), StatusCode::Forbidden);
    let res = server
        .client
        .post("/webhook")
        .header(SIGNATURE_HEADER, format!("sha256={}", "00".repeat(32)))
        .body_json(&accept)
        .map_err(Error::msg)?
        .await
        .map_err(Error::msg)?;
    assert_eq!(res.status(), StatusCode::Forbidden);
    assert_eq!(server.status_of(&number).await?, "queue_generic");

    // Signed deliveries go through.
    assert_eq!(server.deliver(&accept).await?, StatusCode::Ok);
    assert_eq!(server.status_of(&number).await?, "assigned");

    // A signed body which isn't a payload is a bad request.
    assert_eq!(
        server.deliver(&json!("not a payload")).await?,
        StatusCode::BadRequest
    );

    Ok(())
}

#[async_std::test]
async fn undeliverable_reply() -> Result<(), Error> {
    let server = TestServer::start(&[]).await?;
    let number = server.report("Fire", "Smoke").await?;
    server.messenger.make_unreachable("15550001111").await;

    // The webhook reports failure when the sender can't be told the outcome.
    assert_eq!(
        server
            .deliver(&text_message("15550001111", &format!("ACCEPT {number}")))
            .await?,
        StatusCode::InternalServerError
    );
    assert_eq!(
        server
            .deliver(&text_message("15550001111", "hello"))
            .await?,
        StatusCode::InternalServerError
    );

    // Other senders are unaffected.
    assert_eq!(
        server
            .deliver(&text_message("15550002222", &format!("CLOSE {number}")))
            .await?,
        StatusCode::Ok
    );
    assert_eq!(server.status_of(&number).await?, "closed");

    Ok(())
}

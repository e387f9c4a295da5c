//! HTTP endpoints.

use async_std::sync::Arc;
use chrono::Utc;
use model::{
    ticket::{NewTicket, TicketNumber, TicketPath, TicketUpdate},
    webhook::{Payload, Subscription, Verifier, SIGNATURE_HEADER},
    Workflow,
};
use std::borrow::Cow;
use std::fmt::Display;
use tide::{http::mime, Body, Request, Response, StatusCode};

/// State shared by all endpoints.
#[derive(Clone)]
pub struct State {
    workflow: Arc<Workflow>,
    verifier: Arc<Verifier>,
}

impl State {
    pub fn new(workflow: Arc<Workflow>, verifier: Verifier) -> Self {
        Self {
            workflow,
            verifier: Arc::new(verifier),
        }
    }
}

pub fn app(state: State) -> tide::Server<State> {
    let mut app = tide::with_state(state);
    app.at("/health").get(|_| async { Ok("ok") });
    app.at("/webhook").get(subscribe).post(deliver);
    app.at("/tickets").post(create_ticket);
    app.at("/tickets/by-number/:number").get(find_ticket);
    app.at("/tickets/:category/:subcategory").get(list_tickets);
    app.at("/tickets/:category/:subcategory/:number")
        .get(get_ticket)
        .patch(update_ticket);
    app
}

async fn subscribe(req: Request<State>) -> tide::Result {
    let sub: Subscription = req.query()?;
    match req.state().verifier.subscribe(&sub) {
        Some(challenge) => {
            tracing::info!("webhook subscription verified");
            Ok(Response::builder(StatusCode::Ok)
                .body(challenge)
                .content_type(mime::PLAIN)
                .build())
        }
        None => {
            tracing::warn!(mode = ?sub.mode, "rejected webhook subscription");
            Ok(Response::new(StatusCode::Forbidden))
        }
    }
}

async fn deliver(mut req: Request<State>) -> tide::Result {
    let body = req.body_bytes().await?;
    let signature = req
        .header(SIGNATURE_HEADER)
        .map(|values| values.last().as_str().to_string());
    if let Err(err) = req
        .state()
        .verifier
        .verify_signature(&body, signature.as_deref())
    {
        tracing::warn!("rejected webhook delivery: {err}");
        return Ok(Response::new(StatusCode::Forbidden));
    }

    let payload: Payload = serde_json::from_slice(&body).map_err(bad_request)?;
    for (from, text) in payload.text_messages() {
        req.state().workflow.handle_command(from, text).await?;
    }
    Ok(Response::new(StatusCode::Ok))
}

async fn create_ticket(mut req: Request<State>) -> tide::Result {
    let input: NewTicket = req.body_json().await.map_err(bad_request)?;
    input.validate().map_err(bad_request)?;
    let created = req
        .state()
        .workflow
        .create_ticket(input, Utc::now())
        .await?;
    Ok(Response::builder(StatusCode::Created)
        .body(Body::from_json(&created)?)
        .build())
}

async fn list_tickets(req: Request<State>) -> tide::Result {
    let category = param(&req, "category")?;
    let subcategory = param(&req, "subcategory")?;
    let tickets = req
        .state()
        .workflow
        .store()
        .list(&category, &subcategory)
        .await?;
    Ok(Body::from_json(&tickets)?.into())
}

async fn get_ticket(req: Request<State>) -> tide::Result {
    let path = ticket_path(&req)?;
    json_or_not_found(req.state().workflow.store().get(&path).await?)
}

async fn find_ticket(req: Request<State>) -> tide::Result {
    let number = ticket_number(&req)?;
    json_or_not_found(req.state().workflow.store().find_by_number(&number).await?)
}

async fn update_ticket(mut req: Request<State>) -> tide::Result {
    let update: TicketUpdate = req.body_json().await.map_err(bad_request)?;
    let path = ticket_path(&req)?;
    let store = req.state().workflow.store();
    if !store.update(&path, &update).await? {
        return Ok(Response::new(StatusCode::NotFound));
    }
    tracing::info!(ticket = %path.number, ?update, "ticket updated");
    json_or_not_found(store.get(&path).await?)
}

fn json_or_not_found(ticket: Option<impl serde::Serialize>) -> tide::Result {
    match ticket {
        Some(ticket) => Ok(Body::from_json(&ticket)?.into()),
        None => Ok(Response::new(StatusCode::NotFound)),
    }
}

fn ticket_path(req: &Request<State>) -> tide::Result<TicketPath> {
    Ok(TicketPath {
        category: param(req, "category")?.into_owned(),
        subcategory: param(req, "subcategory")?.into_owned(),
        number: ticket_number(req)?,
    })
}

fn ticket_number(req: &Request<State>) -> tide::Result<TicketNumber> {
    param(req, "number")?.parse().map_err(bad_request)
}

/// A percent-decoded path parameter.
fn param<'a>(req: &'a Request<State>, name: &str) -> tide::Result<Cow<'a, str>> {
    urlencoding::decode(req.param(name)?).map_err(bad_request)
}

fn bad_request(err: impl Display) -> tide::Error {
    tide::Error::from_str(StatusCode::BadRequest, err.to_string())
}

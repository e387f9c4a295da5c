//! The ticket lifecycle: filing reports, notifying resolvers, and acting on their replies.

use crate::{
    command::{Command, USAGE},
    routing::RoutingTable,
    sla::{self, Policy},
    store::{self, TicketStore},
    ticket::{slugify, NewTicket, Status, Ticket, TicketNumber, TicketUpdate},
    whatsapp::{broadcast, Messenger},
};
use anyhow::Error;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How many ticket numbers to try before giving up on filing a ticket.
const MAX_NUMBER_ATTEMPTS: usize = 5;

/// Identifies a newly filed ticket.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Created {
    pub ticket_id: TicketNumber,
    pub doc_id: TicketNumber,
}

/// The effect of an inbound command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The ticket moved to `status`.
    Updated { ticket: TicketNumber, status: Status },
    /// The sender was told the ticket's current status.
    Reported { ticket: TicketNumber, status: Status },
    /// The command named a ticket which does not exist. Nothing was sent.
    NotFound(TicketNumber),
    /// The message was not a command. The sender was sent usage help.
    Unknown,
}

/// Coordinates the ticket store and WhatsApp.
pub struct Workflow {
    store: Arc<dyn TicketStore>,
    messenger: Arc<dyn Messenger>,
    managers: Vec<String>,
    routing: RoutingTable,
    sla: Policy,
}

impl Workflow {
    pub fn new(store: Arc<dyn TicketStore>, messenger: Arc<dyn Messenger>) -> Self {
        Self {
            store,
            messenger,
            managers: vec![],
            routing: RoutingTable::default(),
            sla: Policy::default(),
        }
    }

    /// Phones notified about unclaimed tickets and SLA escalations.
    pub fn with_managers(mut self, managers: Vec<String>) -> Self {
        self.managers = managers;
        self
    }

    pub fn with_routing(mut self, routing: RoutingTable) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_sla(mut self, sla: Policy) -> Self {
        self.sla = sla;
        self
    }

    pub fn store(&self) -> &dyn TicketStore {
        &*self.store
    }

    /// File a new ticket and notify whoever is responsible for it.
    pub async fn create_ticket(
        &self,
        mut input: NewTicket,
        now: DateTime<Utc>,
    ) -> Result<Created, Error> {
        input.validate()?;
        if input.assigned_group.is_none() && input.has_resolver_group != Some(false) {
            let route = self.routing.route(&input.subcategory);
            if self.routing.is_fallback(route) {
                tracing::info!(
                    subcategory = %input.subcategory,
                    "no route for subcategory, sending to triage"
                );
            }
            input.assigned_group = Some(route.name.clone());
        }
        let deadline = self.sla.deadline(input.priority.unwrap_or_default(), now);

        let mut attempt = 0;
        let ticket = loop {
            let at = now + Duration::milliseconds(attempt as i64);
            let number = TicketNumber::generate(at);
            let ticket = Ticket::new(input.clone(), number, now, Some(deadline));
            match self.store.create(&ticket).await {
                Ok(()) => break ticket,
                Err(store::Error::AlreadyExists { number })
                    if attempt + 1 < MAX_NUMBER_ATTEMPTS =>
                {
                    tracing::warn!(%number, "ticket number taken, trying the next one");
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        };
        tracing::info!(
            ticket = %ticket.ticket_number,
            path = %ticket.path(),
            group = ?ticket.assigned_group,
            "ticket created"
        );

        // The ticket is already filed, so a failed notification must not fail the request.
        if let Err(err) = self.on_ticket_created(&ticket).await {
            tracing::error!(
                ticket = %ticket.ticket_number,
                "failed to process new ticket: {err:#}"
            );
        }

        Ok(Created {
            ticket_id: ticket.ticket_number.clone(),
            doc_id: ticket.ticket_number,
        })
    }

    /// The phones to notify about a new ticket.
    ///
    /// Phones listed on the ticket take precedence, then the members of its resolver group, then
    /// the managers.
    pub async fn recipients(&self, ticket: &Ticket) -> Result<Vec<String>, Error> {
        if !ticket.assigned_group_phones.is_empty() {
            return Ok(ticket.assigned_group_phones.clone());
        }
        if let Some(group) = &ticket.assigned_group {
            let slug = slugify(group);
            if !slug.is_empty() {
                match self.store.resolver_group(&slug).await? {
                    Some(group) if !group.phones.is_empty() => return Ok(group.phones),
                    _ => tracing::info!(%slug, "resolver group has no phones, notifying managers"),
                }
            }
        }
        Ok(self.managers.clone())
    }

    /// Notify responders about a new ticket and move it into the generic queue.
    pub async fn on_ticket_created(&self, ticket: &Ticket) -> Result<(), Error> {
        let number = &ticket.ticket_number;
        let recipients = self.recipients(ticket).await?;
        if recipients.is_empty() {
            tracing::warn!(ticket = %number, "nobody to notify about new ticket");
        }
        let message = format!(
            "New Incident Reported\n{}\n\nReply commands (WhatsApp):\n\
             ACCEPT {number}\nASSIGN {number} <phone>\nRESOLVE {number}\nCLOSE {number}\nSTATUS {number}",
            ticket.summary()
        );
        let delivered = broadcast(&*self.messenger, &recipients, &message).await;
        tracing::info!(
            ticket = %number,
            delivered,
            recipients = recipients.len(),
            "new ticket notified"
        );

        self.store
            .update(&ticket.path(), &TicketUpdate::status(Status::QueueGeneric))
            .await?;
        Ok(())
    }

    /// Act on a text message sent by `from`.
    ///
    /// Fails if the reply to the command cannot be delivered, even when the ticket was already
    /// updated, so that the sender's message is not acknowledged as handled.
    pub async fn handle_command(&self, from: &str, text: &str) -> Result<CommandOutcome, Error> {
        let command = Command::parse(text);
        tracing::info!(%from, ?command, "inbound command");

        let (ticket, status, update, reply_to, reply) = match command {
            Command::Unknown => {
                self.reply(from, USAGE).await?;
                return Ok(CommandOutcome::Unknown);
            }
            Command::Status(ticket) => {
                let Some(found) = self.store.find_by_number(&ticket).await? else {
                    return Ok(self.not_found(ticket));
                };
                self.reply(from, &format!("Status for {ticket}: {}", found.status))
                    .await?;
                return Ok(CommandOutcome::Reported {
                    ticket,
                    status: found.status,
                });
            }
            Command::Accept(ticket) => {
                let reply = format!("Accepted {ticket}. You are assigned.");
                let update = TicketUpdate::status(Status::Assigned).assign_to(from);
                (ticket, Status::Assigned, update, from.to_string(), reply)
            }
            Command::Assign { ticket, assignee } => {
                let reply =
                    format!("You have been assigned {ticket}. Reply RESOLVE {ticket} when done.");
                let update = TicketUpdate::status(Status::Assigned).assign_to(assignee.clone());
                (ticket, Status::Assigned, update, assignee, reply)
            }
            Command::Resolve(ticket) => {
                let reply = format!("Marked {ticket} resolved. Waiting for requester to review.");
                let update = TicketUpdate::status(Status::Resolved);
                (ticket, Status::Resolved, update, from.to_string(), reply)
            }
            Command::Close(ticket) => {
                let reply = format!("Closed {ticket}. Thank you.");
                let update = TicketUpdate::status(Status::Closed);
                (ticket, Status::Closed, update, from.to_string(), reply)
            }
        };

        if !self.store.update_by_number(&ticket, &update).await? {
            return Ok(self.not_found(ticket));
        }
        tracing::info!(%ticket, %status, "ticket updated by command");
        self.reply(&reply_to, &reply).await?;
        Ok(CommandOutcome::Updated { ticket, status })
    }

    /// Escalate tickets which missed their SLA deadline as of `now`.
    pub async fn escalate_overdue(&self, now: DateTime<Utc>) -> Result<Vec<TicketNumber>, Error> {
        sla::escalate_overdue(&*self.store, &*self.messenger, &self.managers, now).await
    }

    fn not_found(&self, ticket: TicketNumber) -> CommandOutcome {
        tracing::warn!(%ticket, "command for unknown ticket");
        CommandOutcome::NotFound(ticket)
    }

    async fn reply(&self, to: &str, body: &str) -> Result<(), Error> {
        self.messenger
            .send_text(to, body)
            .await
            .map_err(|err| err.context(format!("failed to send reply to {to}")))
    }
}

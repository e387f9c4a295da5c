//! Incident tickets reported from the field and worked over WhatsApp.
//!
//! A reported incident becomes a [ticket](ticket::Ticket), filed in a [store](store::TicketStore)
//! under its category and subcategory. The [workflow](workflow::Workflow) routes each new ticket to
//! a resolver group and notifies its members, who then drive the ticket through its lifecycle by
//! replying with [commands](command::Command). Tickets left unresolved past their deadline are
//! escalated to managers by the [SLA monitor](sla::Monitor).

use tracing_subscriber::EnvFilter;

pub mod command;
pub mod routing;
pub mod sla;
pub mod store;
pub mod ticket;
pub mod webhook;
pub mod whatsapp;
pub mod workflow;

pub use sla::Monitor;
pub use workflow::Workflow;

/// Install a global log subscriber.
///
/// The log level is read from `RUST_LOG`, defaulting to `info`. Calling this more than once is
/// harmless.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .ok();
}

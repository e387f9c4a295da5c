use anyhow::Error;
use chrono::Utc;
use clap::Parser;
use model::{
    init_logging, routing, sla,
    store::{self, TicketStore},
    ticket::{NewTicket, Priority, ResolverGroup, Status, TicketNumber, TicketUpdate},
    whatsapp, Workflow,
};
use std::sync::Arc;

/// Administer the ticket store.
#[derive(Parser)]
enum Command {
    /// File a ticket, notifying its resolver group as if it had been reported through the app.
    Create {
        /// The incident category.
        #[clap(long)]
        incident: String,

        /// The incident subcategory.
        #[clap(long)]
        subcategory: String,

        #[clap(long)]
        priority: Option<Priority>,

        /// Send the ticket to GROUP instead of routing it by subcategory.
        #[clap(long, value_name = "GROUP")]
        group: Option<String>,

        /// Who reported the incident.
        #[clap(long)]
        created_by: Option<String>,

        #[clap(flatten)]
        store: store::Options,

        #[clap(flatten)]
        whatsapp: whatsapp::Options,

        #[clap(flatten)]
        sla: sla::Options,

        #[clap(flatten)]
        routing: routing::Options,
    },
    /// Print a ticket as JSON.
    Show {
        number: TicketNumber,

        #[clap(flatten)]
        store: store::Options,
    },
    /// List the tickets in a subcategory, newest first.
    List {
        category: String,
        subcategory: String,

        #[clap(flatten)]
        store: store::Options,
    },
    /// Change the status of a ticket without notifying anyone.
    SetStatus {
        number: TicketNumber,
        status: Status,

        #[clap(flatten)]
        store: store::Options,
    },
    /// Create or replace a resolver group.
    Group {
        /// The group's name, as it appears in routing tables and tickets.
        name: String,

        /// Phone numbers of the group's members.
        #[clap(required = true)]
        phones: Vec<String>,

        #[clap(flatten)]
        store: store::Options,
    },
    /// Escalate overdue tickets once, notifying managers.
    Escalate {
        #[clap(flatten)]
        store: store::Options,

        #[clap(flatten)]
        whatsapp: whatsapp::Options,
    },
    /// Delete documents left behind by older layouts of the ticket store.
    PurgeLegacy {
        #[clap(flatten)]
        store: store::Options,
    },
}

#[async_std::main]
async fn main() -> Result<(), Error> {
    init_logging();

    match Command::parse() {
        Command::Create {
            incident,
            subcategory,
            priority,
            group,
            created_by,
            store,
            whatsapp,
            sla,
            routing,
        } => {
            let workflow = Workflow::new(store.connect()?, Arc::new(whatsapp.client()))
                .with_managers(whatsapp.managers())
                .with_routing(routing.table()?)
                .with_sla(sla.policy());
            let input = NewTicket {
                priority,
                assigned_group: group,
                created_by,
                ..NewTicket::new(incident, subcategory)
            };
            let created = workflow.create_ticket(input, Utc::now()).await?;
            println!("{}", created.ticket_id);
        }
        Command::Show { number, store } => {
            let ticket = store
                .connect()?
                .find_by_number(&number)
                .await?
                .ok_or_else(|| Error::msg(format!("no such ticket {number}")))?;
            println!("{}", serde_json::to_string_pretty(&ticket)?);
        }
        Command::List {
            category,
            subcategory,
            store,
        } => {
            let tickets = store.connect()?.list(&category, &subcategory).await?;
            tracing::info!("{} tickets", tickets.len());
            for ticket in tickets {
                println!(
                    "{}\t{}\t{}\t{}",
                    ticket.ticket_number,
                    ticket.status,
                    ticket.priority,
                    ticket.created_at.to_rfc3339()
                );
            }
        }
        Command::SetStatus {
            number,
            status,
            store,
        } => {
            if !store
                .connect()?
                .update_by_number(&number, &TicketUpdate::status(status))
                .await?
            {
                return Err(Error::msg(format!("no such ticket {number}")));
            }
            tracing::info!(%number, %status, "status updated");
        }
        Command::Group {
            name,
            phones,
            store,
        } => {
            let group = ResolverGroup::new(name, phones);
            store.connect()?.put_resolver_group(&group).await?;
            tracing::info!(slug = %group.slug(), members = group.phones.len(), "saved resolver group");
        }
        Command::Escalate { store, whatsapp } => {
            let workflow = Workflow::new(store.connect()?, Arc::new(whatsapp.client()))
                .with_managers(whatsapp.managers());
            for number in workflow.escalate_overdue(Utc::now()).await? {
                println!("{number}");
            }
        }
        Command::PurgeLegacy { store } => {
            let report = store.connect()?.purge_legacy().await?;
            tracing::info!("purged {report}");
        }
    }

    Ok(())
}

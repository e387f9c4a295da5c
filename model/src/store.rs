//! Persistent storage for tickets.
//!
//! Tickets are stored in a document hierarchy keyed by category, subcategory and ticket number:
//!
//! ```text
//! tickets/
//!     <category>             { title, updatedAt }
//!         subcategories/
//!             <subcategory>  { name, updatedAt }
//!                 tickets/
//!                     <TKT-XXXXXXXX>
//! ticketNumbers/
//!     <TKT-XXXXXXXX>         { path }
//! resolverGroups/
//!     <slug>                 { name, phones }
//! ```
//!
//! Ticket numbers are unique across the whole hierarchy.

use crate::ticket::{ResolverGroup, Status, Ticket, TicketNumber, TicketPath, TicketUpdate};
use async_trait::async_trait;
use clap::Args;
use snafu::Snafu;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use strum::{Display, EnumString};
use surf::Url;

mod document;
mod firestore;
mod memory;

pub use firestore::FirestoreStore;
pub use memory::MemoryStore;

/// Errors reported by a ticket store.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("ticket {number} already exists"))]
    AlreadyExists { number: TicketNumber },
    #[snafu(display("ticket store error: {message}"))]
    Backend { message: String },
    #[snafu(display("malformed document {path}: {message}"))]
    Malformed { path: String, message: String },
}

impl Error {
    pub fn backend(msg: impl Display) -> Self {
        Self::Backend {
            message: msg.to_string(),
        }
    }

    pub fn malformed(path: impl Into<String>, msg: impl Display) -> Self {
        Self::Malformed {
            path: path.into(),
            message: msg.to_string(),
        }
    }
}

/// A store of tickets and resolver groups.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// File a new ticket.
    ///
    /// This records the ticket's category and subcategory (creating or refreshing their documents)
    /// along with the ticket itself.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::AlreadyExists`] if a ticket with the same number already exists anywhere
    /// in the store. Nothing is written in that case.
    async fn create(&self, ticket: &Ticket) -> Result<(), Error>;

    /// Find a ticket by number, anywhere in the hierarchy.
    async fn find_by_number(&self, number: &TicketNumber) -> Result<Option<Ticket>, Error>;

    /// Update a ticket found by number.
    ///
    /// # Returns
    ///
    /// `false` if there is no such ticket.
    async fn update_by_number(
        &self,
        number: &TicketNumber,
        update: &TicketUpdate,
    ) -> Result<bool, Error> {
        match self.find_by_number(number).await? {
            Some(ticket) => self.update(&ticket.path(), update).await,
            None => Ok(false),
        }
    }

    /// Load the ticket at `path`.
    async fn get(&self, path: &TicketPath) -> Result<Option<Ticket>, Error>;

    /// Update the ticket at `path`.
    ///
    /// # Returns
    ///
    /// `false` if there is no such ticket.
    async fn update(&self, path: &TicketPath, update: &TicketUpdate) -> Result<bool, Error>;

    /// All tickets in a subcategory, newest first.
    ///
    /// `category` and `subcategory` are document IDs, as in [`TicketPath`].
    async fn list(&self, category: &str, subcategory: &str) -> Result<Vec<Ticket>, Error>;

    /// All tickets whose status is one of `statuses`.
    async fn list_by_status(&self, statuses: &[Status]) -> Result<Vec<Ticket>, Error>;

    /// Look up a resolver group by its slug.
    async fn resolver_group(&self, slug: &str) -> Result<Option<ResolverGroup>, Error>;

    /// Create or replace a resolver group.
    async fn put_resolver_group(&self, group: &ResolverGroup) -> Result<(), Error>;

    /// Delete documents left behind by older layouts of the ticket store.
    ///
    /// This removes the top-level `categories` and `subcategories` collections, the entire
    /// `resolve_tickets` hierarchy, and ticket documents stored directly under `tickets` rather
    /// than in the category hierarchy.
    async fn purge_legacy(&self) -> Result<PurgeReport, Error>;
}

/// Number of documents deleted by [`TicketStore::purge_legacy`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Documents in the flat `categories` and `subcategories` collections.
    pub collections: usize,
    /// Documents in the `resolve_tickets` hierarchy.
    pub resolve_tickets: usize,
    /// Ticket documents stored directly under `tickets`.
    pub flat_tickets: usize,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.collections + self.resolve_tickets + self.flat_tickets
    }
}

impl Display for PurgeReport {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{} documents ({} legacy collection, {} resolve_tickets, {} flat tickets)",
            self.total(),
            self.collections,
            self.resolve_tickets,
            self.flat_tickets
        )
    }
}

/// Available ticket store implementations.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Backend {
    Memory,
    Firestore,
}

/// Ticket store connection options.
#[derive(Clone, Debug, Args)]
#[group(skip)]
pub struct Options {
    /// Where to keep tickets (memory or firestore).
    #[clap(long, env = "RELAY_STORE", default_value = "memory")]
    pub store: Backend,

    /// The Google Cloud project hosting the Firestore database.
    #[clap(long, env = "FIRESTORE_PROJECT_ID")]
    pub firestore_project: Option<String>,

    /// The Firestore database ID.
    #[clap(long, env = "FIRESTORE_DATABASE", default_value = "(default)")]
    pub firestore_database: String,

    /// Base URL of the Firestore REST API.
    ///
    /// Point this at a local emulator, like `http://localhost:8080/`, for development.
    #[clap(
        long,
        env = "FIRESTORE_URL",
        default_value = "https://firestore.googleapis.com/"
    )]
    pub firestore_url: Url,

    /// OAuth access token for Firestore.
    #[clap(long, env = "FIRESTORE_ACCESS_TOKEN")]
    pub firestore_token: Option<String>,
}

impl Options {
    /// Connect to the ticket store.
    pub fn connect(&self) -> Result<Arc<dyn TicketStore>, anyhow::Error> {
        match self.store {
            Backend::Memory => {
                tracing::warn!("using in-memory ticket store, tickets will not survive a restart");
                Ok(Arc::new(MemoryStore::default()))
            }
            Backend::Firestore => {
                let project = self.firestore_project.as_ref().ok_or_else(|| {
                    anyhow::Error::msg("--firestore-project is required for the firestore store")
                })?;
                tracing::info!(%project, database = %self.firestore_database, "using Firestore");
                Ok(Arc::new(FirestoreStore::new(
                    self.firestore_url.clone(),
                    project,
                    &self.firestore_database,
                    self.firestore_token.clone(),
                )?))
            }
        }
    }
}

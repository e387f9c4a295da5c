//! In-memory instantiation of the [`TicketStore`](super::TicketStore) interface.
//!
//! This store is useful for testing and local development in isolation from a real database. It
//! does not persist anything.

use super::{Error, PurgeReport, TicketStore};
use crate::ticket::{ResolverGroup, Status, Ticket, TicketNumber, TicketPath, TicketUpdate};
use async_std::sync::{Arc, RwLock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// The in-memory database.
#[derive(Debug, Default)]
struct Db {
    categories: BTreeMap<String, Category>,
    resolver_groups: HashMap<String, ResolverGroup>,
    /// Documents outside the live hierarchy, keyed by path.
    legacy: BTreeMap<String, Value>,
}

#[derive(Debug)]
struct Category {
    title: String,
    updated_at: DateTime<Utc>,
    subcategories: BTreeMap<String, Subcategory>,
}

#[derive(Debug)]
struct Subcategory {
    name: String,
    updated_at: DateTime<Utc>,
    tickets: BTreeMap<TicketNumber, Ticket>,
}

impl Db {
    fn tickets(&self) -> impl Iterator<Item = &Ticket> {
        self.categories
            .values()
            .flat_map(|category| category.subcategories.values())
            .flat_map(|subcategory| subcategory.tickets.values())
    }

    fn ticket(&self, path: &TicketPath) -> Option<&Ticket> {
        self.categories
            .get(&path.category)?
            .subcategories
            .get(&path.subcategory)?
            .tickets
            .get(&path.number)
    }

    fn ticket_mut(&mut self, path: &TicketPath) -> Option<&mut Ticket> {
        self.categories
            .get_mut(&path.category)?
            .subcategories
            .get_mut(&path.subcategory)?
            .tickets
            .get_mut(&path.number)
    }
}

/// A ticket store held entirely in memory.
///
/// Clones share the same underlying data.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore(Arc<RwLock<Db>>);

impl MemoryStore {
    /// Insert a document which is not part of the ticket hierarchy.
    ///
    /// This simulates data left behind by older layouts of the store, so that
    /// [`purge_legacy`](TicketStore::purge_legacy) can be exercised.
    pub async fn insert_legacy(&self, path: impl Into<String>, doc: Value) {
        self.0.write().await.legacy.insert(path.into(), doc);
    }

    /// Paths of all documents outside the ticket hierarchy.
    pub async fn legacy_paths(&self) -> Vec<String> {
        self.0.read().await.legacy.keys().cloned().collect()
    }

    /// The title recorded for a category, if it exists.
    pub async fn category_title(&self, category: &str) -> Option<String> {
        let db = self.0.read().await;
        Some(db.categories.get(category)?.title.clone())
    }

    /// The name recorded for a subcategory, if it exists.
    pub async fn subcategory_name(&self, category: &str, subcategory: &str) -> Option<String> {
        let db = self.0.read().await;
        Some(
            db.categories
                .get(category)?
                .subcategories
                .get(subcategory)?
                .name
                .clone(),
        )
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    async fn create(&self, ticket: &Ticket) -> Result<(), Error> {
        let path = ticket.path();
        let now = Utc::now();
        let mut db = self.0.write().await;

        // Numbers are unique across the whole hierarchy, not just within a subcategory.
        if db.tickets().any(|t| t.ticket_number == path.number) {
            return Err(Error::AlreadyExists {
                number: path.number,
            });
        }

        let category = db
            .categories
            .entry(path.category.clone())
            .or_insert_with(|| Category {
                title: ticket.category_title.clone(),
                updated_at: now,
                subcategories: Default::default(),
            });
        category.title = ticket.category_title.clone();
        category.updated_at = now;

        let subcategory = category
            .subcategories
            .entry(path.subcategory.clone())
            .or_insert_with(|| Subcategory {
                name: ticket.subcategory.clone(),
                updated_at: now,
                tickets: Default::default(),
            });
        subcategory.name = ticket.subcategory.clone();
        subcategory.updated_at = now;

        subcategory.tickets.insert(path.number, ticket.clone());
        Ok(())
    }

    async fn find_by_number(&self, number: &TicketNumber) -> Result<Option<Ticket>, Error> {
        let db = self.0.read().await;
        let ticket = db
            .tickets()
            .find(|ticket| ticket.ticket_number == *number)
            .cloned();
        Ok(ticket)
    }

    async fn get(&self, path: &TicketPath) -> Result<Option<Ticket>, Error> {
        Ok(self.0.read().await.ticket(path).cloned())
    }

    async fn update(&self, path: &TicketPath, update: &TicketUpdate) -> Result<bool, Error> {
        let mut db = self.0.write().await;
        Ok(match db.ticket_mut(path) {
            Some(ticket) => {
                ticket.apply(update, Utc::now());
                true
            }
            None => false,
        })
    }

    async fn list(&self, category: &str, subcategory: &str) -> Result<Vec<Ticket>, Error> {
        let db = self.0.read().await;
        let mut tickets = db
            .categories
            .get(category)
            .and_then(|category| category.subcategories.get(subcategory))
            .map(|subcategory| subcategory.tickets.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        tickets.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(tickets)
    }

    async fn list_by_status(&self, statuses: &[Status]) -> Result<Vec<Ticket>, Error> {
        let db = self.0.read().await;
        Ok(db
            .tickets()
            .filter(|ticket| statuses.contains(&ticket.status))
            .cloned()
            .collect())
    }

    async fn resolver_group(&self, slug: &str) -> Result<Option<ResolverGroup>, Error> {
        Ok(self.0.read().await.resolver_groups.get(slug).cloned())
    }

    async fn put_resolver_group(&self, group: &ResolverGroup) -> Result<(), Error> {
        self.0
            .write()
            .await
            .resolver_groups
            .insert(group.slug(), group.clone());
        Ok(())
    }

    async fn purge_legacy(&self) -> Result<PurgeReport, Error> {
        let mut db = self.0.write().await;
        let mut report = PurgeReport::default();
        db.legacy.retain(|path, doc| {
            let segments = path.split('/').collect::<Vec<_>>();
            match segments.as_slice() {
                ["categories" | "subcategories", ..] => report.collections += 1,
                ["resolve_tickets", ..] => report.resolve_tickets += 1,
                ["tickets", _] if doc.get("ticketNumber").is_some() => report.flat_tickets += 1,
                _ => return true,
            }
            false
        });
        Ok(report)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ticket::NewTicket;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn ticket(category: &str, subcategory: &str, number: &str, secs: i64) -> Ticket {
        let now = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        Ticket::new(
            NewTicket::new(category, subcategory),
            number.parse().unwrap(),
            now,
            Some(now + Duration::hours(1)),
        )
    }

    #[async_std::test]
    async fn test_create_hierarchy() {
        let store = MemoryStore::default();
        let t = ticket("Electrical Hazards", "Arc Flash/Blast", "TKT-1", 0);
        store.create(&t).await.unwrap();

        assert_eq!(
            store.category_title("Electrical Hazards").await.unwrap(),
            "Electrical Hazards"
        );
        assert_eq!(
            store
                .subcategory_name("Electrical Hazards", "Arc Flash-Blast")
                .await
                .unwrap(),
            "Arc Flash/Blast"
        );
        assert_eq!(store.get(&t.path()).await.unwrap().unwrap(), t);

        // Creating the same ticket again fails.
        let err = store.create(&t).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { number } if number == t.ticket_number));
    }

    #[async_std::test]
    async fn test_numbers_unique_across_hierarchy() {
        let store = MemoryStore::default();
        let smoke = ticket("Fire", "Smoke", "TKT-1", 0);
        store.create(&smoke).await.unwrap();

        let crushing = ticket("Machinery", "Crushing", "TKT-1", 0);
        let err = store.create(&crushing).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { number } if number == crushing.ticket_number));
        assert_eq!(store.get(&crushing.path()).await.unwrap(), None);
        // The rejected ticket leaves no trace of its category behind.
        assert_eq!(store.category_title("Machinery").await, None);
        assert_eq!(store.get(&smoke.path()).await.unwrap().unwrap(), smoke);
    }

    #[async_std::test]
    async fn test_rejected_create_keeps_titles() {
        let store = MemoryStore::default();
        store
            .create(&ticket("Arc/Flash", "Blast", "TKT-1", 0))
            .await
            .unwrap();

        // "Arc-Flash" shares the document ID of "Arc/Flash".
        store
            .create(&ticket("Arc-Flash", "Blast", "TKT-1", 0))
            .await
            .unwrap_err();
        assert_eq!(store.category_title("Arc-Flash").await.unwrap(), "Arc/Flash");
        assert_eq!(
            store.subcategory_name("Arc-Flash", "Blast").await.unwrap(),
            "Blast"
        );
    }

    #[async_std::test]
    async fn test_find_and_update() {
        let store = MemoryStore::default();
        store.create(&ticket("Fire", "Smoke", "TKT-1", 0)).await.unwrap();
        store
            .create(&ticket("Machinery", "Crushing", "TKT-2", 1))
            .await
            .unwrap();

        let number: TicketNumber = "TKT-2".parse().unwrap();
        let found = store.find_by_number(&number).await.unwrap().unwrap();
        assert_eq!(found.subcategory, "Crushing");

        let update = TicketUpdate::status(Status::Assigned).assign_to("+15550001111");
        assert!(store.update_by_number(&number, &update).await.unwrap());
        let found = store.find_by_number(&number).await.unwrap().unwrap();
        assert_eq!(found.status, Status::Assigned);
        assert_eq!(found.assigned_to.as_deref(), Some("+15550001111"));
        assert!(found.updated_at.is_some());

        let missing: TicketNumber = "TKT-3".parse().unwrap();
        assert_eq!(store.find_by_number(&missing).await.unwrap(), None);
        assert!(!store.update_by_number(&missing, &update).await.unwrap());
        assert!(!store
            .update(&TicketPath::new("Fire", "Smoke", missing), &update)
            .await
            .unwrap());
    }

    #[async_std::test]
    async fn test_list() {
        let store = MemoryStore::default();
        store.create(&ticket("Fire", "Smoke", "TKT-1", 0)).await.unwrap();
        store.create(&ticket("Fire", "Smoke", "TKT-3", 20)).await.unwrap();
        store.create(&ticket("Fire", "Smoke", "TKT-2", 10)).await.unwrap();
        store.create(&ticket("Fire", "Flames", "TKT-4", 30)).await.unwrap();

        let numbers = store
            .list("Fire", "Smoke")
            .await
            .unwrap()
            .into_iter()
            .map(|ticket| ticket.ticket_number.to_string())
            .collect::<Vec<_>>();
        assert_eq!(numbers, ["TKT-3", "TKT-2", "TKT-1"]);
        assert!(store.list("Fire", "Sparks").await.unwrap().is_empty());

        store
            .update(
                &TicketPath::new("Fire", "Smoke", "TKT-1".parse().unwrap()),
                &TicketUpdate::status(Status::Closed),
            )
            .await
            .unwrap();
        let active = store.list_by_status(&Status::ACTIVE).await.unwrap();
        assert_eq!(active.len(), 3);
        assert!(active.iter().all(|ticket| ticket.status == Status::Open));
    }

    #[async_std::test]
    async fn test_resolver_groups() {
        let store = MemoryStore::default();
        let group = ResolverGroup::new("EHS Machinery", ["+15550001111", "+15550002222"]);
        store.put_resolver_group(&group).await.unwrap();
        assert_eq!(
            store.resolver_group("ehs-machinery").await.unwrap(),
            Some(group)
        );
        assert_eq!(store.resolver_group("chem").await.unwrap(), None);
    }

    #[async_std::test]
    async fn test_purge_legacy() {
        let store = MemoryStore::default();
        store.create(&ticket("Fire", "Smoke", "TKT-1", 0)).await.unwrap();
        store.insert_legacy("categories/fire", json!({})).await;
        store.insert_legacy("subcategories/smoke", json!({})).await;
        store.insert_legacy("resolve_tickets/Fire", json!({})).await;
        store
            .insert_legacy(
                "resolve_tickets/Fire/subcategories/Smoke/tickets/TKT-9",
                json!({"ticketNumber": "TKT-9"}),
            )
            .await;
        store
            .insert_legacy("tickets/abc", json!({"ticketNumber": "TKT-8"}))
            .await;
        store.insert_legacy("tickets/Other", json!({"title": "Other"})).await;

        let report = store.purge_legacy().await.unwrap();
        assert_eq!(
            report,
            PurgeReport {
                collections: 2,
                resolve_tickets: 2,
                flat_tickets: 1,
            }
        );
        assert_eq!(store.legacy_paths().await, ["tickets/Other"]);
        assert_eq!(store.list("Fire", "Smoke").await.unwrap().len(), 1);
    }
}

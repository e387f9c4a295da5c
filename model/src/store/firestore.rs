//! A ticket store backed by Cloud Firestore, accessed through its REST API.

use super::{
    document::{decode_fields, encode_fields, encode_value, Document},
    Error, PurgeReport, TicketStore,
};
use crate::ticket::{ResolverGroup, Status, Ticket, TicketNumber, TicketPath, TicketUpdate};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};
use surf::{http::Method, StatusCode, Url};

/// Maximum number of documents fetched or deleted in one round trip while purging.
const PURGE_CHUNK: usize = 300;

/// The resolver group collection.
const RESOLVER_GROUPS: &str = "resolverGroups";

/// Index of ticket numbers, keyed by number, pointing at each ticket's path.
///
/// Creating the index entry and the ticket in the same commit makes numbers unique across the
/// whole hierarchy.
const TICKET_NUMBERS: &str = "ticketNumbers";

/// A Firestore ticket store.
pub struct FirestoreStore {
    client: surf::Client,
    base: Url,
    /// `projects/{project}/databases/{database}/documents`
    root: String,
    token: Option<String>,
}

impl FirestoreStore {
    /// Connect to a Firestore database.
    ///
    /// `base` is the root of the REST API, like `https://firestore.googleapis.com/`. If `token` is
    /// given, it is sent as an OAuth bearer token with every request. Emulators accept requests
    /// without a token.
    pub fn new(
        base: Url,
        project: &str,
        database: &str,
        token: Option<String>,
    ) -> Result<Self, Error> {
        if base.cannot_be_a_base() {
            return Err(Error::backend(format!("invalid Firestore URL {base}")));
        }
        Ok(Self {
            client: surf::Client::new(),
            base,
            root: format!("projects/{project}/databases/{database}/documents"),
            token,
        })
    }

    /// The writes which file a new ticket, in a single atomic commit.
    fn create_writes(&self, ticket: &Ticket) -> Result<Vec<Value>, Error> {
        let path = ticket.path();
        let fields = match serde_json::to_value(ticket) {
            Ok(Value::Object(fields)) => fields,
            Ok(_) => return Err(Error::malformed(path.to_string(), "ticket is not an object")),
            Err(err) => return Err(Error::malformed(path.to_string(), err)),
        };

        let mut category = Map::new();
        category.insert("title".into(), json!(ticket.category_title));
        let mut subcategory = Map::new();
        subcategory.insert("name".into(), json!(ticket.subcategory));
        let mut index = Map::new();
        index.insert("path".into(), json!(path.to_string()));

        Ok(vec![
            json!({
                "update": {
                    "name": self.name(&format!("{TICKET_NUMBERS}/{}", path.number)),
                    "fields": encode_fields(&index),
                },
                "currentDocument": { "exists": false },
            }),
            self.merge(&path.category_path(), category),
            self.merge(&path.subcategory_path(), subcategory),
            json!({
                "update": { "name": self.name(&path.to_string()), "fields": encode_fields(&fields) },
                "currentDocument": { "exists": false },
            }),
        ])
    }

    /// The full resource name of the document at `path`.
    fn name(&self, path: &str) -> String {
        format!("{}/{path}", self.root)
    }

    /// The path of a document relative to the root, if it is under this database.
    fn relative<'a>(&self, name: &'a str) -> Option<&'a str> {
        name.strip_prefix(&self.root)?.strip_prefix('/')
    }

    /// The URL of a resource, optionally followed by a custom method like `:commit`.
    fn url(&self, resource: &str, method: Option<&str>) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("v1");
            let mut parts = resource.split('/').peekable();
            while let Some(part) = parts.next() {
                match (parts.peek(), method) {
                    (None, Some(method)) => segments.push(&format!("{part}:{method}")),
                    _ => segments.push(part),
                };
            }
        }
        url
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<Reply<T>, Error> {
        tracing::debug!(%method, %url, "Firestore request");
        let mut req = self.client.request(method, url.as_str());
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        if let Some(body) = body {
            req = req.body_json(&body).map_err(Error::backend)?;
        }
        let mut res = req.send().await.map_err(Error::backend)?;
        match res.status() {
            StatusCode::NotFound => Ok(Reply::NotFound),
            StatusCode::Conflict => Ok(Reply::Conflict),
            status if status.is_success() => {
                Ok(Reply::Ok(res.body_json().await.map_err(Error::backend)?))
            }
            status => {
                let body = res.body_string().await.unwrap_or_default();
                Err(Error::backend(format!("Firestore returned {status}: {body}")))
            }
        }
    }

    /// Atomically apply a batch of writes.
    async fn commit(&self, writes: Vec<Value>) -> Result<Reply<Value>, Error> {
        let url = self.url(&self.root, Some("commit"));
        self.send(Method::Post, url, Some(json!({ "writes": writes })))
            .await
    }

    /// Run a structured query over the collections under `parent`.
    ///
    /// `parent` is a full resource name: either the database root or a document.
    async fn query(&self, parent: &str, query: Value) -> Result<Vec<Document>, Error> {
        let url = self.url(parent, Some("runQuery"));
        let results: Vec<QueryResult> = match self
            .send(Method::Post, url, Some(json!({ "structuredQuery": query })))
            .await?
        {
            Reply::Ok(results) => results,
            Reply::NotFound | Reply::Conflict => vec![],
        };
        Ok(results
            .into_iter()
            .filter_map(|result| result.document)
            .collect())
    }

    /// Tickets anywhere under the database matching `filter`.
    ///
    /// Documents in `tickets` collections outside the live hierarchy (such as the flat legacy
    /// layout) are skipped.
    async fn query_tickets(
        &self,
        filter: Value,
        limit: Option<usize>,
    ) -> Result<Vec<Ticket>, Error> {
        let mut query = json!({
            "from": [{ "collectionId": "tickets", "allDescendants": true }],
            "where": filter,
        });
        if let Some(limit) = limit {
            query["limit"] = json!(limit);
        }
        self.query(&self.root, query)
            .await?
            .iter()
            .filter(|doc| self.relative(&doc.name).and_then(TicketPath::parse).is_some())
            .map(|doc| self.decode(doc))
            .collect()
    }

    async fn get_document(&self, path: &str) -> Result<Option<Document>, Error> {
        let url = self.url(&self.name(path), None);
        Ok(match self.send(Method::Get, url, None).await? {
            Reply::Ok(doc) => Some(doc),
            Reply::NotFound | Reply::Conflict => None,
        })
    }

    /// A write merging `fields` into the document at `path` and stamping `updatedAt`.
    fn merge(&self, path: &str, fields: Map<String, Value>) -> Value {
        let mask = fields.keys().cloned().collect::<Vec<_>>();
        json!({
            "update": { "name": self.name(path), "fields": encode_fields(&fields) },
            "updateMask": { "fieldPaths": mask },
            "updateTransforms": [
                { "fieldPath": "updatedAt", "setToServerValue": "REQUEST_TIME" }
            ],
        })
    }

    fn decode<T: DeserializeOwned>(&self, doc: &Document) -> Result<T, Error> {
        let fields = decode_fields(&doc.fields).map_err(|err| Error::malformed(&doc.name, err))?;
        serde_json::from_value(Value::Object(fields)).map_err(|err| Error::malformed(&doc.name, err))
    }

    /// Delete documents by full resource name, in chunks.
    async fn delete(&self, names: impl IntoIterator<Item = String>) -> Result<usize, Error> {
        let names = names.into_iter().collect::<Vec<_>>();
        for chunk in names.chunks(PURGE_CHUNK) {
            self.commit(chunk.iter().map(|name| json!({ "delete": name })).collect())
                .await?;
        }
        Ok(names.len())
    }

    /// Delete every document in the collection `collection` under `parent`, optionally only those
    /// matching `filter`.
    async fn purge_collection(
        &self,
        parent: &str,
        collection: &str,
        filter: Option<Value>,
    ) -> Result<usize, Error> {
        let mut deleted = 0;
        loop {
            let mut query = json!({
                "from": [{ "collectionId": collection }],
                "limit": PURGE_CHUNK,
            });
            if let Some(filter) = &filter {
                query["where"] = filter.clone();
            }
            let docs = self.query(parent, query).await?;
            if docs.is_empty() {
                break;
            }
            deleted += self.delete(docs.into_iter().map(|doc| doc.name)).await?;
        }
        Ok(deleted)
    }

    /// Every document name in the collection `collection` under `parent`.
    async fn list_names(&self, parent: &str, collection: &str) -> Result<Vec<String>, Error> {
        let query = json!({ "from": [{ "collectionId": collection }] });
        Ok(self
            .query(parent, query)
            .await?
            .into_iter()
            .map(|doc| doc.name)
            .collect())
    }
}

#[async_trait]
impl TicketStore for FirestoreStore {
    async fn create(&self, ticket: &Ticket) -> Result<(), Error> {
        let writes = self.create_writes(ticket)?;
        match self.commit(writes).await? {
            Reply::Ok(_) => Ok(()),
            Reply::Conflict => Err(Error::AlreadyExists {
                number: ticket.ticket_number.clone(),
            }),
            Reply::NotFound => Err(Error::backend(format!("database {} not found", self.root))),
        }
    }

    async fn find_by_number(&self, number: &TicketNumber) -> Result<Option<Ticket>, Error> {
        let filter = field_filter("ticketNumber", "EQUAL", json!(number.as_str()));
        Ok(self
            .query_tickets(filter, Some(10))
            .await?
            .into_iter()
            .next())
    }

    async fn get(&self, path: &TicketPath) -> Result<Option<Ticket>, Error> {
        match self.get_document(&path.to_string()).await? {
            Some(doc) => Ok(Some(self.decode(&doc)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, path: &TicketPath, update: &TicketUpdate) -> Result<bool, Error> {
        let mut write = self.merge(&path.to_string(), update.fields());
        write["currentDocument"] = json!({ "exists": true });
        Ok(match self.commit(vec![write]).await? {
            Reply::Ok(_) => true,
            Reply::NotFound | Reply::Conflict => false,
        })
    }

    async fn list(&self, category: &str, subcategory: &str) -> Result<Vec<Ticket>, Error> {
        let parent = self.name(&format!("tickets/{category}/subcategories/{subcategory}"));
        let query = json!({
            "from": [{ "collectionId": "tickets" }],
            "orderBy": [{ "field": { "fieldPath": "timestamp" }, "direction": "DESCENDING" }],
        });
        self.query(&parent, query)
            .await?
            .iter()
            .map(|doc| self.decode(doc))
            .collect()
    }

    async fn list_by_status(&self, statuses: &[Status]) -> Result<Vec<Ticket>, Error> {
        if statuses.is_empty() {
            return Ok(vec![]);
        }
        let statuses = statuses.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let filter = field_filter("status", "IN", json!(statuses));
        self.query_tickets(filter, None).await
    }

    async fn resolver_group(&self, slug: &str) -> Result<Option<ResolverGroup>, Error> {
        let Some(doc) = self.get_document(&format!("{RESOLVER_GROUPS}/{slug}")).await? else {
            return Ok(None);
        };
        let mut group: ResolverGroup = self.decode(&doc)?;
        if group.name.is_empty() {
            group.name = slug.into();
        }
        Ok(Some(group))
    }

    async fn put_resolver_group(&self, group: &ResolverGroup) -> Result<(), Error> {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(group.name));
        fields.insert("phones".into(), json!(group.phones));
        let path = format!("{RESOLVER_GROUPS}/{}", group.slug());
        match self.commit(vec![self.merge(&path, fields)]).await? {
            Reply::Ok(_) => Ok(()),
            Reply::NotFound | Reply::Conflict => {
                Err(Error::backend(format!("unable to write resolver group {path}")))
            }
        }
    }

    async fn purge_legacy(&self) -> Result<PurgeReport, Error> {
        let mut report = PurgeReport::default();

        for collection in ["categories", "subcategories"] {
            let deleted = self.purge_collection(&self.root, collection, None).await?;
            tracing::info!(collection, deleted, "purged legacy collection");
            report.collections += deleted;
        }

        for category in self.list_names(&self.root, "resolve_tickets").await? {
            for subcategory in self.list_names(&category, "subcategories").await? {
                report.resolve_tickets += self.purge_collection(&subcategory, "tickets", None).await?;
                report.resolve_tickets += self.delete([subcategory]).await?;
            }
            report.resolve_tickets += self.delete([category]).await?;
        }
        tracing::info!(deleted = report.resolve_tickets, "purged resolve_tickets");

        // Category documents in `tickets` carry no ticket number, so this only matches tickets
        // written directly into the top-level collection.
        let flat = field_filter("ticketNumber", "GREATER_THAN_OR_EQUAL", json!(""));
        report.flat_tickets = self.purge_collection(&self.root, "tickets", Some(flat)).await?;
        tracing::info!(deleted = report.flat_tickets, "purged flat tickets");

        Ok(report)
    }
}

/// Outcome of a Firestore request which did not fail outright.
enum Reply<T> {
    Ok(T),
    NotFound,
    /// The request conflicted with existing data, as when creating a document that exists.
    Conflict,
}

/// An entry in the stream of results from `runQuery`.
///
/// Entries without a document only report progress.
#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    document: Option<Document>,
}

fn field_filter(field: &str, op: &str, value: Value) -> Value {
    json!({
        "fieldFilter": {
            "field": { "fieldPath": field },
            "op": op,
            "value": encode_value(&value),
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn store() -> FirestoreStore {
        FirestoreStore::new(
            "http://localhost:8080/".parse().unwrap(),
            "demo",
            "(default)",
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_urls() {
        let store = store();
        assert_eq!(
            store.url(&store.root, Some("commit")).as_str(),
            "http://localhost:8080/v1/projects/demo/databases/(default)/documents:commit"
        );
        assert_eq!(
            store
                .url(&store.name("tickets/Electrical Hazards"), None)
                .as_str(),
            "http://localhost:8080/v1/projects/demo/databases/(default)/documents/tickets/Electrical%20Hazards"
        );
        assert_eq!(
            store
                .url(&store.name("tickets/Fire/subcategories/Smoke"), Some("runQuery"))
                .as_str(),
            "http://localhost:8080/v1/projects/demo/databases/(default)/documents/tickets/Fire/subcategories/Smoke:runQuery"
        );
    }

    #[test]
    fn test_relative_names() {
        let store = store();
        let name = store.name("tickets/Fire/subcategories/Smoke/tickets/TKT-1");
        assert_eq!(
            store.relative(&name),
            Some("tickets/Fire/subcategories/Smoke/tickets/TKT-1")
        );
        assert_eq!(
            store.relative("projects/other/databases/(default)/documents/tickets/x"),
            None
        );
    }

    #[test]
    fn test_merge_write() {
        let store = store();
        let write = store.merge(
            "resolverGroups/chem",
            TicketUpdate::status(Status::Resolved).fields(),
        );
        assert_eq!(
            write,
            json!({
                "update": {
                    "name": "projects/demo/databases/(default)/documents/resolverGroups/chem",
                    "fields": { "status": { "stringValue": "resolved" } },
                },
                "updateMask": { "fieldPaths": ["status"] },
                "updateTransforms": [
                    { "fieldPath": "updatedAt", "setToServerValue": "REQUEST_TIME" }
                ],
            })
        );
    }

    #[test]
    fn test_create_writes() {
        let store = store();
        let now = chrono::Utc::now();
        let ticket = Ticket::new(
            crate::ticket::NewTicket::new("Fire", "Smoke/Fumes"),
            "TKT-7".parse().unwrap(),
            now,
            None,
        );
        let writes = store.create_writes(&ticket).unwrap();
        assert_eq!(writes.len(), 4);

        // The number index entry guards against the same number in any other subcategory.
        assert_eq!(
            writes[0],
            json!({
                "update": {
                    "name": "projects/demo/databases/(default)/documents/ticketNumbers/TKT-7",
                    "fields": {
                        "path": {
                            "stringValue": "tickets/Fire/subcategories/Smoke-Fumes/tickets/TKT-7"
                        }
                    },
                },
                "currentDocument": { "exists": false },
            })
        );
        assert_eq!(
            writes[3]["update"]["name"],
            "projects/demo/databases/(default)/documents/tickets/Fire/subcategories/Smoke-Fumes/tickets/TKT-7"
        );
        assert_eq!(writes[3]["currentDocument"], json!({ "exists": false }));
    }

    #[test]
    fn test_decode_ticket() {
        let store = store();
        let doc: Document = serde_json::from_value(json!({
            "name": store.name("tickets/Fire/subcategories/Smoke/tickets/TKT-1"),
            "fields": {
                "ticketNumber": { "stringValue": "TKT-1" },
                "incidentName": { "stringValue": "Fire" },
                "subcategory": { "stringValue": "Smoke" },
                "priority": { "stringValue": "high" },
                "status": { "stringValue": "queue_generic" },
                "createdAt": { "timestampValue": "2024-06-01T10:00:00.123456Z" },
                "createdAtClient": { "stringValue": "2024-06-01T09:59:58Z" },
                "timestamp": { "timestampValue": "2024-06-01T10:00:00.123456Z" },
                "categoryTitle": { "stringValue": "Fire" },
                "categorySlug": { "stringValue": "Fire" },
                "subcategorySlug": { "stringValue": "Smoke" },
                "location": { "geoPointValue": { "latitude": 1.0, "longitude": 2.0 } },
                "assignedGroupPhones": { "arrayValue": {} },
                "slaDeadlineAt": { "nullValue": null },
            },
        }))
        .unwrap();
        let ticket: Ticket = store.decode(&doc).unwrap();
        assert_eq!(ticket.status, Status::QueueGeneric);
        assert_eq!(ticket.created_by, "anonymous");
        assert!(ticket.has_resolver_group);
        assert_eq!(ticket.location.unwrap().longitude, 2.0);
        assert_eq!(ticket.sla_deadline_at, None);
        assert_eq!(
            TicketPath::parse(store.relative(&doc.name).unwrap()),
            Some(ticket.path())
        );

        let bad = Document {
            name: doc.name.clone(),
            fields: Map::new(),
        };
        assert!(matches!(
            store.decode::<Ticket>(&bad),
            Err(Error::Malformed { .. })
        ));
    }
}

//! Incident tickets and their lifecycle state.

use anyhow::Error;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use strum::{Display, EnumIter, EnumString};

/// The reporter recorded for tickets created without one.
pub const ANONYMOUS: &str = "anonymous";

/// The lifecycle state of a ticket.
#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    EnumIter,
    EnumString,
    Deserialize,
    Serialize,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Open,
    Assigned,
    QueueGeneric,
    Resolved,
    Closed,
    Escalated,
}

impl Status {
    /// Statuses of tickets which still need attention, and so are subject to SLA monitoring.
    pub const ACTIVE: [Status; 4] = [
        Status::Open,
        Status::QueueGeneric,
        Status::Assigned,
        Status::Escalated,
    ];

    /// Does this ticket still need attention?
    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }
}

/// How urgently a ticket needs attention.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    EnumIter,
    EnumString,
    Deserialize,
    Serialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

static TICKET_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^TKT-[0-9]+$").unwrap());

/// The human-friendly identifier of a ticket, like `TKT-12345678`.
#[derive(
    Clone,
    Debug,
    derive_more::Display,
    derive_more::Into,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct TicketNumber(String);

impl TicketNumber {
    /// Generate a ticket number from the creation time.
    ///
    /// The number is the last 8 digits of `now` in milliseconds since the Unix epoch, so two
    /// tickets created in the same millisecond collide. Callers that need uniqueness must detect
    /// the collision and retry with a later time.
    pub fn generate(now: DateTime<Utc>) -> Self {
        let millis = now.timestamp_millis().rem_euclid(100_000_000);
        Self(format!("TKT-{millis:08}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TicketNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if TICKET_NUMBER.is_match(s) {
            Ok(Self(s.to_ascii_uppercase()))
        } else {
            Err(Error::msg(format!("invalid ticket number {s:?}")))
        }
    }
}

impl TryFrom<String> for TicketNumber {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A location on the globe.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct GeoPoint {
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lng")]
    pub longitude: f64,
}

/// A freshly reported incident, before it has been assigned a number.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTicket {
    /// The incident category, like "Electrical Hazards".
    pub incident_name: String,
    /// The incident subcategory, like "Electric Shock".
    pub subcategory: String,
    pub priority: Option<Priority>,
    pub has_resolver_group: Option<bool>,
    pub category_id: Option<String>,
    /// Name of the resolver group which should handle this ticket.
    ///
    /// When absent, the group is chosen by [routing](crate::routing) on the subcategory.
    pub assigned_group: Option<String>,
    /// Phones to notify directly, bypassing resolver group lookup.
    #[serde(default)]
    pub assigned_group_phones: Vec<String>,
    pub created_by: Option<String>,
    pub location: Option<GeoPoint>,
    /// The time of the report according to the reporting device.
    pub reported_at: Option<DateTime<Utc>>,
}

impl NewTicket {
    pub fn new(incident_name: impl Into<String>, subcategory: impl Into<String>) -> Self {
        Self {
            incident_name: incident_name.into(),
            subcategory: subcategory.into(),
            ..Default::default()
        }
    }

    /// Check that this report can be filed.
    pub fn validate(&self) -> Result<(), Error> {
        if self.incident_name.trim().is_empty() {
            return Err(Error::msg("incident name is required"));
        }
        if self.subcategory.trim().is_empty() {
            return Err(Error::msg("subcategory is required"));
        }
        Ok(())
    }
}

/// A reported incident.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub ticket_number: TicketNumber,
    pub incident_name: String,
    pub subcategory: String,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub created_at_client: DateTime<Utc>,
    #[serde(default = "anonymous")]
    pub created_by: String,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default = "yes")]
    pub has_resolver_group: bool,
    #[serde(default)]
    pub assigned_group: Option<String>,
    #[serde(default)]
    pub assigned_group_phones: Vec<String>,
    /// Phone of the person currently working the ticket.
    #[serde(default)]
    pub assigned_to: Option<String>,
    /// Ordering key for listings, newest first.
    pub timestamp: DateTime<Utc>,
    pub category_title: String,
    pub category_slug: String,
    pub subcategory_slug: String,
    #[serde(default)]
    pub sla_deadline_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn anonymous() -> String {
    ANONYMOUS.into()
}

fn yes() -> bool {
    true
}

impl Ticket {
    /// File a new ticket from a report.
    pub fn new(
        input: NewTicket,
        number: TicketNumber,
        now: DateTime<Utc>,
        sla_deadline_at: Option<DateTime<Utc>>,
    ) -> Self {
        let category_slug = sanitize_id(&input.incident_name);
        let subcategory_slug = sanitize_id(&input.subcategory);
        Self {
            ticket_number: number,
            category_title: input.incident_name.clone(),
            incident_name: input.incident_name,
            subcategory: input.subcategory,
            category_id: input.category_id,
            priority: input.priority.unwrap_or_default(),
            status: Status::Open,
            created_at: now,
            created_at_client: input.reported_at.unwrap_or(now),
            created_by: input.created_by.unwrap_or_else(anonymous),
            location: input.location,
            has_resolver_group: input.has_resolver_group.unwrap_or(true),
            assigned_group: input.assigned_group,
            assigned_group_phones: input.assigned_group_phones,
            assigned_to: None,
            timestamp: now,
            category_slug,
            subcategory_slug,
            sla_deadline_at,
            updated_at: None,
        }
    }

    /// Where this ticket lives in the ticket hierarchy.
    pub fn path(&self) -> TicketPath {
        TicketPath {
            category: self.category_slug.clone(),
            subcategory: self.subcategory_slug.clone(),
            number: self.ticket_number.clone(),
        }
    }

    /// A short human-readable description, suitable for a chat message.
    pub fn summary(&self) -> String {
        [
            format!("Ticket: {}", self.ticket_number),
            format!("Incident: {}", self.incident_name),
            format!("Subcategory: {}", self.subcategory),
            format!("Priority: {}", self.priority),
        ]
        .join("\n")
    }

    /// Apply a partial update, stamping the time of the change.
    pub fn apply(&mut self, update: &TicketUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(assigned_to) = &update.assigned_to {
            self.assigned_to = assigned_to.clone();
        }
        if let Some(assigned_group) = &update.assigned_group {
            self.assigned_group = assigned_group.clone();
        }
        self.updated_at = Some(now);
    }
}

/// The location of a ticket in the hierarchy
/// `tickets/{category}/subcategories/{subcategory}/tickets/{number}`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TicketPath {
    pub category: String,
    pub subcategory: String,
    pub number: TicketNumber,
}

impl TicketPath {
    /// Locate a ticket by the titles of its category and subcategory.
    pub fn new(category: &str, subcategory: &str, number: TicketNumber) -> Self {
        Self {
            category: sanitize_id(category),
            subcategory: sanitize_id(subcategory),
            number,
        }
    }

    /// Parse a path relative to the document root.
    ///
    /// Returns [`None`] for any document which is not a ticket in the live hierarchy.
    pub fn parse(path: &str) -> Option<Self> {
        let segments = path.split('/').collect::<Vec<_>>();
        match segments.as_slice() {
            ["tickets", category, "subcategories", subcategory, "tickets", number] => Some(Self {
                category: category.to_string(),
                subcategory: subcategory.to_string(),
                number: number.parse().ok()?,
            }),
            _ => None,
        }
    }

    pub fn category_path(&self) -> String {
        format!("tickets/{}", self.category)
    }

    pub fn subcategory_path(&self) -> String {
        format!("{}/subcategories/{}", self.category_path(), self.subcategory)
    }
}

impl Display for TicketPath {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}/tickets/{}", self.subcategory_path(), self.number)
    }
}

/// A partial update of a ticket.
///
/// The assignment fields distinguish "leave unchanged" (outer [`None`]) from "clear" (inner
/// [`None`]). In JSON, an absent field leaves the value unchanged and `null` clears it.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub assigned_to: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub assigned_group: Option<Option<String>>,
}

fn present<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(d).map(Some)
}

impl TicketUpdate {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn assign_to(mut self, phone: impl Into<String>) -> Self {
        self.assigned_to = Some(Some(phone.into()));
        self
    }

    /// The stored fields this update touches, with their new values.
    pub fn fields(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(fields)) => fields,
            _ => Default::default(),
        }
    }
}

/// A named set of phone numbers notified about tickets in their area.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ResolverGroup {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phones: Vec<String>,
}

impl ResolverGroup {
    pub fn new(name: impl Into<String>, phones: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            phones: phones.into_iter().map(Into::into).collect(),
        }
    }

    /// The document ID under which this group is stored.
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }
}

/// Turn a title into a document ID by replacing path separators.
pub fn sanitize_id(s: &str) -> String {
    s.replace('/', "-")
}

static NON_SLUG: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Turn a name into a URL-safe slug, like `"EHS Machinery"` to `"ehs-machinery"`.
pub fn slugify(s: &str) -> String {
    NON_SLUG
        .replace_all(&s.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

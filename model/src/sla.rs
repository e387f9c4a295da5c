//! Service level agreements: deadlines for new tickets, and escalation of tickets which miss them.

use crate::{
    store::TicketStore,
    ticket::{Priority, Status, Ticket, TicketNumber, TicketUpdate},
    whatsapp::{broadcast, Messenger},
    workflow::Workflow,
};
use anyhow::Error;
use async_std::{sync::Arc, task::sleep};
use chrono::{DateTime, Duration, Utc};
use clap::Args;
use futures::future::join_all;

/// How long tickets of each priority may stay unresolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Policy {
    pub high: Duration,
    pub medium: Duration,
    pub low: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            high: Duration::hours(1),
            medium: Duration::hours(4),
            low: Duration::hours(24),
        }
    }
}

impl Policy {
    /// The time allowed to resolve a ticket of the given priority.
    pub fn window(&self, priority: Priority) -> Duration {
        match priority {
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }

    /// The deadline for a ticket of the given priority created at `created_at`.
    pub fn deadline(&self, priority: Priority, created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at + self.window(priority)
    }
}

/// Has `ticket` missed its deadline without yet being escalated?
pub fn is_overdue(ticket: &Ticket, now: DateTime<Utc>) -> bool {
    ticket.status.is_active()
        && ticket.status != Status::Escalated
        && matches!(ticket.sla_deadline_at, Some(deadline) if deadline < now)
}

/// Escalate every ticket which is overdue as of `now`.
///
/// Each overdue ticket is marked [`Escalated`](Status::Escalated) and all `managers` are notified.
/// Escalated tickets are not escalated again on later passes.
///
/// # Returns
///
/// The numbers of the escalated tickets.
pub async fn escalate_overdue(
    store: &dyn TicketStore,
    messenger: &dyn Messenger,
    managers: &[String],
    now: DateTime<Utc>,
) -> Result<Vec<TicketNumber>, Error> {
    let overdue = store
        .list_by_status(&Status::ACTIVE)
        .await?
        .into_iter()
        .filter(|ticket| is_overdue(ticket, now))
        .collect::<Vec<_>>();
    if overdue.is_empty() {
        tracing::debug!("no overdue tickets");
        return Ok(vec![]);
    }
    if managers.is_empty() {
        tracing::warn!(
            "{} tickets are overdue, but no managers are configured to hear about it",
            overdue.len()
        );
    }

    // One ticket failing to escalate must not hold back the others.
    let escalated = join_all(overdue.iter().map(|ticket| async move {
        let number = &ticket.ticket_number;
        match store
            .update(&ticket.path(), &TicketUpdate::status(Status::Escalated))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(ticket = %number, "overdue ticket disappeared before escalation");
                return None;
            }
            Err(err) => {
                tracing::error!(ticket = %number, "failed to escalate ticket: {err}");
                return None;
            }
        }
        tracing::warn!(
            ticket = %number,
            deadline = ?ticket.sla_deadline_at,
            "SLA expired, escalating"
        );
        let message = format!("SLA expired\n{}", ticket.summary());
        broadcast(messenger, managers, &message).await;
        Some(number.clone())
    }))
    .await;
    Ok(escalated.into_iter().flatten().collect())
}

/// Periodically escalates overdue tickets.
pub struct Monitor {
    workflow: Arc<Workflow>,
    interval: std::time::Duration,
}

impl Monitor {
    pub fn new(workflow: Arc<Workflow>, interval: std::time::Duration) -> Self {
        Self { workflow, interval }
    }

    /// Check for overdue tickets every interval, forever.
    pub async fn run(self) {
        tracing::info!("SLA monitor checking every {:?}", self.interval);
        loop {
            sleep(self.interval).await;
            self.tick(Utc::now()).await;
        }
    }

    /// Run a single pass.
    ///
    /// Failures are logged rather than returned, so that a transient error does not stop the
    /// monitor.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<TicketNumber> {
        match self.workflow.escalate_overdue(now).await {
            Ok(escalated) => {
                if !escalated.is_empty() {
                    tracing::info!("escalated {} overdue tickets", escalated.len());
                }
                escalated
            }
            Err(err) => {
                tracing::error!("SLA pass failed: {err:#}");
                vec![]
            }
        }
    }
}

/// SLA options.
#[derive(Clone, Debug, Args)]
#[group(skip)]
pub struct Options {
    /// Minutes allowed to resolve a high priority ticket.
    #[clap(long, env = "RELAY_SLA_HIGH_MINUTES", default_value = "60")]
    pub sla_high_minutes: u32,

    /// Minutes allowed to resolve a medium priority ticket.
    #[clap(long, env = "RELAY_SLA_MEDIUM_MINUTES", default_value = "240")]
    pub sla_medium_minutes: u32,

    /// Minutes allowed to resolve a low priority ticket.
    #[clap(long, env = "RELAY_SLA_LOW_MINUTES", default_value = "1440")]
    pub sla_low_minutes: u32,

    /// Seconds between checks for overdue tickets.
    #[clap(long, env = "RELAY_SLA_INTERVAL_SECS", default_value = "300")]
    pub sla_interval_secs: u64,
}

impl Options {
    pub fn policy(&self) -> Policy {
        Policy {
            high: Duration::minutes(self.sla_high_minutes.into()),
            medium: Duration::minutes(self.sla_medium_minutes.into()),
            low: Duration::minutes(self.sla_low_minutes.into()),
        }
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sla_interval_secs)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        store::{self, MemoryStore, PurgeReport},
        ticket::{NewTicket, ResolverGroup, TicketPath},
        whatsapp::RecordingMessenger,
    };
    use chrono::TimeZone;

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::minutes(minutes)
    }

    async fn file(store: &MemoryStore, number: &str, deadline: Option<i64>, status: Status) {
        let ticket = Ticket::new(
            NewTicket::new("Machinery", "Crushing"),
            number.parse().unwrap(),
            at(0),
            deadline.map(at),
        );
        store.create(&ticket).await.unwrap();
        if status != Status::Open {
            store
                .update(&ticket.path(), &TicketUpdate::status(status))
                .await
                .unwrap();
        }
    }

    async fn status(store: &MemoryStore, number: &str) -> Status {
        store
            .get(&TicketPath::new("Machinery", "Crushing", number.parse().unwrap()))
            .await
            .unwrap()
            .unwrap()
            .status
    }

    #[test]
    fn test_policy() {
        let policy = Policy::default();
        assert_eq!(policy.deadline(Priority::High, at(0)), at(60));
        assert_eq!(policy.deadline(Priority::Medium, at(0)), at(240));
        assert_eq!(policy.deadline(Priority::Low, at(0)), at(1440));
    }

    #[async_std::test]
    async fn test_escalate_overdue() {
        let store = MemoryStore::default();
        let messenger = RecordingMessenger::default();
        let managers = vec!["+15550009999".to_string()];

        file(&store, "TKT-1", Some(30), Status::Open).await;
        file(&store, "TKT-2", Some(30), Status::Assigned).await;
        file(&store, "TKT-3", Some(30), Status::QueueGeneric).await;
        file(&store, "TKT-4", Some(90), Status::Open).await;
        file(&store, "TKT-5", Some(30), Status::Resolved).await;
        file(&store, "TKT-6", None, Status::Open).await;
        file(&store, "TKT-7", Some(60), Status::Open).await;

        let mut escalated = escalate_overdue(&store, &messenger, &managers, at(60))
            .await
            .unwrap()
            .into_iter()
            .map(|number| number.to_string())
            .collect::<Vec<_>>();
        escalated.sort();
        assert_eq!(escalated, ["TKT-1", "TKT-2", "TKT-3"]);

        for number in ["TKT-1", "TKT-2", "TKT-3"] {
            assert_eq!(status(&store, number).await, Status::Escalated);
        }
        assert_eq!(status(&store, "TKT-4").await, Status::Open);
        assert_eq!(status(&store, "TKT-5").await, Status::Resolved);
        assert_eq!(status(&store, "TKT-6").await, Status::Open);
        // The deadline itself is not overdue.
        assert_eq!(status(&store, "TKT-7").await, Status::Open);

        let sent = messenger.sent_to("+15550009999").await;
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|body| body.starts_with("SLA expired\nTicket: TKT-")));

        // Escalated tickets are not escalated again.
        messenger.clear().await;
        let escalated = escalate_overdue(&store, &messenger, &managers, at(120))
            .await
            .unwrap();
        assert_eq!(escalated.len(), 2);
        assert_eq!(status(&store, "TKT-4").await, Status::Escalated);
        assert_eq!(messenger.sent().await.len(), 2);
    }

    /// A store which refuses to update one ticket.
    struct RejectsUpdate {
        inner: MemoryStore,
        rejected: TicketNumber,
    }

    #[async_trait::async_trait]
    impl TicketStore for RejectsUpdate {
        async fn create(&self, ticket: &Ticket) -> Result<(), store::Error> {
            self.inner.create(ticket).await
        }

        async fn find_by_number(
            &self,
            number: &TicketNumber,
        ) -> Result<Option<Ticket>, store::Error> {
            self.inner.find_by_number(number).await
        }

        async fn get(&self, path: &TicketPath) -> Result<Option<Ticket>, store::Error> {
            self.inner.get(path).await
        }

        async fn update(
            &self,
            path: &TicketPath,
            update: &TicketUpdate,
        ) -> Result<bool, store::Error> {
            if path.number == self.rejected {
                return Err(store::Error::backend("write rejected"));
            }
            self.inner.update(path, update).await
        }

        async fn list(
            &self,
            category: &str,
            subcategory: &str,
        ) -> Result<Vec<Ticket>, store::Error> {
            self.inner.list(category, subcategory).await
        }

        async fn list_by_status(&self, statuses: &[Status]) -> Result<Vec<Ticket>, store::Error> {
            self.inner.list_by_status(statuses).await
        }

        async fn resolver_group(
            &self,
            slug: &str,
        ) -> Result<Option<ResolverGroup>, store::Error> {
            self.inner.resolver_group(slug).await
        }

        async fn put_resolver_group(&self, group: &ResolverGroup) -> Result<(), store::Error> {
            self.inner.put_resolver_group(group).await
        }

        async fn purge_legacy(&self) -> Result<PurgeReport, store::Error> {
            self.inner.purge_legacy().await
        }
    }

    #[async_std::test]
    async fn test_escalation_failure_is_isolated() {
        let inner = MemoryStore::default();
        let messenger = RecordingMessenger::default();
        let managers = vec!["+15550009999".to_string()];
        file(&inner, "TKT-1", Some(30), Status::Open).await;
        file(&inner, "TKT-2", Some(30), Status::Open).await;
        file(&inner, "TKT-3", Some(30), Status::Open).await;

        let store = RejectsUpdate {
            inner: inner.clone(),
            rejected: "TKT-2".parse().unwrap(),
        };
        let mut escalated = escalate_overdue(&store, &messenger, &managers, at(60))
            .await
            .unwrap()
            .into_iter()
            .map(|number| number.to_string())
            .collect::<Vec<_>>();
        escalated.sort();
        assert_eq!(escalated, ["TKT-1", "TKT-3"]);

        assert_eq!(status(&inner, "TKT-1").await, Status::Escalated);
        assert_eq!(status(&inner, "TKT-2").await, Status::Open);
        assert_eq!(status(&inner, "TKT-3").await, Status::Escalated);
        assert_eq!(messenger.sent().await.len(), 2);

        // The ticket is retried on the next pass.
        escalate_overdue(&inner, &messenger, &managers, at(61))
            .await
            .unwrap();
        assert_eq!(status(&inner, "TKT-2").await, Status::Escalated);
    }

    #[async_std::test]
    async fn test_monitor_tick() {
        let store = MemoryStore::default();
        let messenger = RecordingMessenger::default();
        file(&store, "TKT-1", Some(30), Status::Open).await;

        let workflow = Workflow::new(Arc::new(store.clone()), Arc::new(messenger.clone()))
            .with_managers(vec!["+15550009999".into()]);
        let monitor = Monitor::new(Arc::new(workflow), std::time::Duration::from_secs(300));

        assert!(monitor.tick(at(10)).await.is_empty());
        assert_eq!(
            monitor.tick(at(31)).await,
            ["TKT-1".parse::<TicketNumber>().unwrap()]
        );
        assert_eq!(messenger.sent().await.len(), 1);
    }
}

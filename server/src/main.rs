use anyhow::Error;
use async_std::{sync::Arc, task::spawn};
use clap::Parser;
use model::{init_logging, routing, sla, store, whatsapp, Monitor, Workflow};

mod routes;
mod test_runner;

/// Start the incident ticket server.
#[derive(Clone, Debug, Parser)]
struct Options {
    /// The port where the app should be served.
    #[clap(short, long, env = "RELAY_PORT", default_value = "8080")]
    port: u16,

    #[clap(flatten)]
    store: store::Options,

    #[clap(flatten)]
    whatsapp: whatsapp::Options,

    #[clap(flatten)]
    sla: sla::Options,

    #[clap(flatten)]
    routing: routing::Options,
}

impl Options {
    /// Connect to the configured store and WhatsApp account and serve until the server fails.
    async fn serve(&self) -> Result<(), Error> {
        let workflow = Workflow::new(self.store.connect()?, Arc::new(self.whatsapp.client()));
        self.serve_workflow(workflow).await
    }

    async fn serve_workflow(&self, workflow: Workflow) -> Result<(), Error> {
        let workflow = Arc::new(
            workflow
                .with_managers(self.whatsapp.managers())
                .with_routing(self.routing.table()?)
                .with_sla(self.sla.policy()),
        );
        spawn(Monitor::new(workflow.clone(), self.sla.interval()).run());

        let app = routes::app(routes::State::new(workflow, self.whatsapp.verifier()));
        tracing::info!(port = self.port, "listening");
        app.listen(format!("0.0.0.0:{}", self.port)).await?;
        Ok(())
    }
}

#[async_std::main]
async fn main() -> Result<(), Error> {
    init_logging();
    Options::parse().serve().await
}

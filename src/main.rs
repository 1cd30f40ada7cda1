use std::{future::Future, sync::Arc};

use admiral::{
    cluster::KubeClusterClient,
    controller::{DeploymentController, LogHandler, ServiceController},
    k8s,
    labels::LabelSet,
};
use clap::Parser;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use tracing_subscriber::EnvFilter;

mod args;

use args::CliArgs;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    setup_tracing(args.log_pretty);

    if let Err(e) = run(args).await {
        tracing::error!(err = ?e, "exiting: {e}");
        std::process::exit(1);
    }
}

fn setup_tracing(log_pretty: bool) {
    let default_log_filter = "admiral=info"
        .parse()
        .expect("default log filter must be valid");
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_log_filter)
                .from_env_lossy(),
        )
        .with_target(true);

    if log_pretty {
        // don't use .pretty(), it's too pretty
        builder.init();
    } else {
        builder
            .json()
            .flatten_event(true)
            .with_span_list(false)
            .init();
    }
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    if let Some(metrics_addr) = &args.metrics_addr {
        admiral::metrics::install_prom(metrics_addr)?;
    }

    let client = KubeClusterClient::try_default().await?;
    let labels: Arc<LabelSet> = Arc::new(args.labels.into());
    let all_namespaces = args.namespace_args.all_namespaces;
    let namespace = args.namespace_args.namespace.as_deref();

    let deployments = Arc::new(DeploymentController::new(
        &args.cluster_name,
        client.clone(),
        LogHandler,
        labels.clone(),
    ));
    let services = Arc::new(ServiceController::new(
        &args.cluster_name,
        client.clone(),
        LogHandler,
        labels,
    ));

    tracing::info!(cluster = %args.cluster_name, all_namespaces, ?namespace, "starting watches");

    let run_deployment_watch = k8s::run_watch(
        kube_api::<Deployment>(client.client(), all_namespaces, namespace),
        deployments,
    );
    let run_service_watch = k8s::run_watch(
        kube_api::<Service>(client.client(), all_namespaces, namespace),
        services,
    );

    tokio::try_join!(
        spawn_watch(run_deployment_watch),
        spawn_watch(run_service_watch),
    )?;

    Ok(())
}

fn kube_api<K>(client: &kube::Client, all_namespaces: bool, namespace: Option<&str>) -> kube::Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match (all_namespaces, namespace) {
        (true, _) => kube::Api::all(client.clone()),
        (_, Some(namespace)) => kube::Api::namespaced(client.clone(), namespace),
        _ => kube::Api::default_namespaced(client.clone()),
    }
}

async fn spawn_watch<F>(watch: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(watch).await?;
    Ok(())
}

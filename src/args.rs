use admiral::labels::{LabelSet, DEFAULT_MTLS_PORT};
use clap::{Args, Parser};

/// keep a cache of mesh workloads
#[derive(Parser, Debug)]
#[command(version)]
pub(crate) struct CliArgs {
    /// Log in a pretty, human-readable format.
    #[arg(long)]
    pub log_pretty: bool,

    /// Serve Prometheus metrics on this address. Metrics are disabled if this
    /// isn't set.
    #[arg(long)]
    pub metrics_addr: Option<String>,

    /// The name of the cluster being watched. Only used in logs.
    #[arg(long, default_value = "local")]
    pub cluster_name: String,

    #[command(flatten)]
    pub namespace_args: NamespaceArgs,

    #[command(flatten)]
    pub labels: LabelArgs,
}

#[derive(Args, Debug)]
#[group(multiple = false)]
pub(crate) struct NamespaceArgs {
    /// Watch all namespaces. Defaults to false.
    ///
    /// It's an error to set both --all-namespaces and --namespace.
    #[arg(long)]
    pub all_namespaces: bool,

    /// The namespace to watch. If this option is not set explicitly, admiral
    /// will watch the the namespace set in the kubeconfig's current context,
    /// the namespace specified by the service account the server is running as,
    /// or the `default` namespace.
    ///
    /// It's an error to set both --all-namespaces and --namespace.
    #[arg(long)]
    pub namespace: Option<String>,
}

#[derive(Args, Debug)]
pub(crate) struct LabelArgs {
    /// The pod template label that holds a workload's identity.
    #[arg(long, default_value = "identity")]
    identity_label: String,

    /// The pod template label that holds a workload's environment.
    #[arg(long, default_value = "env")]
    env_label: String,

    /// The pod template label that excludes a workload when set to "true".
    #[arg(long, default_value = "admiral-ignore")]
    ignore_label: String,

    /// The annotation that excludes a resource or namespace when set to "true".
    #[arg(long, default_value = "admiral.io/ignore")]
    ignore_annotation: String,

    /// The pod template annotation that marks a workload as part of the mesh.
    #[arg(long, default_value = "sidecar.istio.io/inject")]
    sidecar_inject_annotation: String,

    /// Cache Deployments whether or not they have sidecar injection enabled.
    #[arg(long)]
    no_sidecar_injection_check: bool,

    /// The Service label matched when resolving load balancer addresses.
    #[arg(long, default_value = "app")]
    app_label: String,

    /// The port used for mesh traffic through a load balancer.
    #[arg(long, default_value_t = DEFAULT_MTLS_PORT)]
    mtls_port: u16,
}

impl From<LabelArgs> for LabelSet {
    fn from(args: LabelArgs) -> Self {
        let sidecar_inject_annotation =
            (!args.no_sidecar_injection_check).then_some(args.sidecar_inject_annotation);

        LabelSet {
            identity_key: args.identity_label,
            env_key: args.env_label,
            ignore_label: args.ignore_label,
            ignore_annotation: args.ignore_annotation,
            sidecar_inject_annotation,
            app_key: args.app_label,
            default_mtls_port: args.mtls_port,
        }
    }
}

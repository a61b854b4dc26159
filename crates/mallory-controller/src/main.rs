//! `mallory-operator`: runs the Event controller, or checks a single permission

use std::sync::Arc;

use anyhow::Context as _;
use clap::{value_parser, Arg, ArgMatches, Command};
use futures::StreamExt;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use mallory_controller::{
    config::DEFAULT_REPORTER, error_policy, reconcile, Context, KubeClientFactory, KubeEventSink,
    KubeEventStore, OperationDispatcher, OperatorConfig, VERSION,
};
use mallory_crd::{EventResource, Intruder};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("mallory-operator")
        .version(VERSION)
        .about("Declarative attack simulation against Kubernetes RBAC boundaries")
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .global(true)
                .default_value("info")
                .help("Log filter when RUST_LOG is unset"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .default_value("text")
                .value_parser(["text", "json"])
                .help("Log output format"),
        )
        .subcommand(
            Command::new("run")
                .about("Watch Event resources and reconcile them (default)")
                .args(run_args()),
        )
        .subcommand(
            Command::new("can-i")
                .about("Check whether the current identity may perform an action")
                .arg(
                    Arg::new("verb")
                        .long("verb")
                        .default_value("create")
                        .help("API verb to check"),
                )
                .arg(
                    Arg::new("resource")
                        .long("resource")
                        .default_value("pods")
                        .help("Resource plural to check"),
                )
                .arg(
                    Arg::new("namespace")
                        .long("namespace")
                        .default_value("default")
                        .help("Namespace to check in"),
                ),
        )
}

fn run_args() -> Vec<Arg> {
    vec![
        Arg::new("reporter")
            .long("reporter")
            .default_value(DEFAULT_REPORTER)
            .help("Controller name attached to published events"),
        Arg::new("namespace")
            .long("namespace")
            .help("Watch a single namespace instead of all"),
        Arg::new("error-requeue-secs")
            .long("error-requeue-secs")
            .default_value("30")
            .value_parser(value_parser!(u64))
            .help("Delay before retrying a failed pass"),
        Arg::new("stream-timeout-secs")
            .long("stream-timeout-secs")
            .default_value("300")
            .value_parser(value_parser!(u64))
            .help("Upper bound for one exec or log stream"),
        Arg::new("max-output-bytes")
            .long("max-output-bytes")
            .default_value("1048576")
            .value_parser(value_parser!(usize))
            .help("Bytes kept per captured stream"),
        Arg::new("log-tail-lines")
            .long("log-tail-lines")
            .default_value("10")
            .value_parser(value_parser!(i64))
            .help("Lines requested by the logs verb"),
    ]
}

fn init_tracing(matches: &ArgMatches) {
    let level = matches
        .get_one::<String>("log-level")
        .map_or("info", String::as_str);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if matches.get_one::<String>("log-format").map(String::as_str) == Some("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn operator_config(args: &ArgMatches) -> OperatorConfig {
    let mut config =
        OperatorConfig::new().with_watch_namespace(args.get_one::<String>("namespace").cloned());
    if let Some(reporter) = args.get_one::<String>("reporter") {
        config = config.with_reporter(reporter.clone());
    }
    if let Some(secs) = args.get_one::<u64>("error-requeue-secs") {
        config = config.with_error_requeue_secs(*secs);
    }
    if let Some(secs) = args.get_one::<u64>("stream-timeout-secs") {
        config = config.with_stream_timeout_secs(*secs);
    }
    if let Some(bytes) = args.get_one::<usize>("max-output-bytes") {
        config = config.with_max_output_bytes(*bytes);
    }
    if let Some(lines) = args.get_one::<i64>("log-tail-lines") {
        config = config.with_log_tail_lines(*lines);
    }
    config
}

async fn run(config: OperatorConfig) -> anyhow::Result<()> {
    config.validate()?;
    let base = kube::Config::infer()
        .await
        .context("failed to infer cluster configuration")?;
    let client = Client::try_from(base.clone()).context("failed to create controller client")?;

    let events: Api<EventResource> = match config.watch_namespace.as_deref() {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    // fail fast when the CRD is not installed
    events
        .list(&kube::api::ListParams::default().limit(1))
        .await
        .context("Event CRD is not queryable; is it installed?")?;

    let factory = KubeClientFactory::new(Arc::new(base), config.stream_limits());
    let ctx = Arc::new(Context::new(
        Arc::new(KubeEventStore::new(client.clone())),
        OperationDispatcher::new(Arc::new(factory), &config),
        Arc::new(KubeEventSink::new(client, config.reporter.clone())),
        config.clone(),
    ));

    info!(
        version = VERSION,
        namespace = config.watch_namespace.as_deref().unwrap_or("*"),
        "starting controller"
    );

    Controller::new(events, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => info!(event = %obj.name, namespace = ?obj.namespace, "reconciled"),
                Err(err) => warn!(error = %err, "reconcile failed"),
            }
        })
        .await;

    info!("controller stopped");
    Ok(())
}

async fn can_i(args: &ArgMatches) -> anyhow::Result<()> {
    let verb = args.get_one::<String>("verb").cloned().unwrap_or_default();
    let resource = args.get_one::<String>("resource").cloned().unwrap_or_default();
    let namespace = args.get_one::<String>("namespace").cloned().unwrap_or_default();

    let base = kube::Config::infer()
        .await
        .context("failed to infer cluster configuration")?;
    let config = OperatorConfig::default();
    let dispatcher = OperationDispatcher::new(
        Arc::new(KubeClientFactory::new(Arc::new(base), config.stream_limits())),
        &config,
    );
    let review = SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                verb: Some(verb.clone()),
                resource: Some(resource.clone()),
                namespace: Some(namespace.clone()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    };

    let status = dispatcher
        .access_review(&Intruder::default(), &namespace, review)
        .await
        .context("access review failed")?;
    if status.allowed {
        println!("yes: you can {verb} {resource} in namespace '{namespace}'");
    } else {
        println!("no: you cannot {verb} {resource} in namespace '{namespace}'");
        if let Some(reason) = status.reason.filter(|r| !r.is_empty()) {
            println!("reason: {reason}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().args(run_args()).get_matches();
    init_tracing(&matches);

    let result = match matches.subcommand() {
        Some(("can-i", args)) => can_i(args).await,
        Some(("run", args)) => run(operator_config(args)).await,
        _ => run(operator_config(&matches)).await,
    };
    if let Err(err) = &result {
        error!(error = %err, "fatal");
    }
    result
}

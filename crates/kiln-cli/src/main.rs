//! Kiln - declarative deploys for Kubernetes
//!
//! Usage:
//!   kiln deploy                 # render, apply, wait, record
//!   kiln render                 # print the rendered objects
//!   kiln history                # list recorded revisions
//!   kiln rollback [--to N]      # re-apply an earlier revision
//!   kiln preview up|down|list   # throwaway preview namespaces

mod output;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiln_core::author::resolve_author;
use kiln_core::cancel::{CancelSource, CancelToken};
use kiln_core::cluster::KubeCluster;
use kiln_core::context::AppContext;
use kiln_core::error::KilnError;
use kiln_core::model::{AppModel, load_model};
use kiln_core::pipeline::{DeployOptions, Pipeline};
use kiln_core::preview::PreviewManager;
use kiln_core::render::{RenderContext, render};
use kiln_core::report::{output_format, to_json_document};
use kiln_core::revision::RevisionStore;
use kiln_core::settings::LogFormat;

use crate::output::{Printer, confirm};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Deploy declarative apps to Kubernetes", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// App definition file
    #[arg(short = 'f', long, global = true, default_value = "kiln.yaml")]
    file: PathBuf,

    /// Target namespace (overrides the app definition)
    #[arg(short = 'n', long, global = true)]
    namespace: Option<String>,

    /// Environment overlay from the app definition
    #[arg(long = "env", global = true)]
    environment: Option<String>,

    /// Kube context (defaults to the current context)
    #[arg(long, global = true)]
    context: Option<String>,

    /// Machine-readable JSON output
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Args, Clone, Default)]
struct ReleaseArgs {
    /// Print what would be applied without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Delete objects the previous revision created and this one does not
    #[arg(long)]
    prune: bool,

    /// Rollout timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Objects applied in parallel within a stage
    #[arg(long)]
    concurrency: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Render, apply, wait for rollout and record a revision
    Deploy(ReleaseArgs),

    /// Print the rendered objects and their fingerprint
    Render,

    /// List recorded revisions
    History {
        /// App name (read from the app definition when omitted)
        #[arg(long)]
        app: Option<String>,
    },

    /// Re-apply a recorded revision
    Rollback {
        /// Revision index (defaults to the one before the latest)
        #[arg(long)]
        to: Option<u64>,

        /// App name (read from the app definition when omitted)
        #[arg(long)]
        app: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,

        #[command(flatten)]
        release: ReleaseArgs,
    },

    /// Manage preview namespaces
    Preview(PreviewArgs),
}

#[derive(Args)]
struct PreviewArgs {
    #[command(subcommand)]
    command: PreviewCommand,
}

#[derive(Subcommand)]
enum PreviewCommand {
    /// Create the preview namespace and deploy into it
    Up {
        /// Preview id, e.g. a pull request number
        id: String,

        #[command(flatten)]
        release: ReleaseArgs,
    },

    /// Delete a preview namespace and everything in it
    Down {
        id: String,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// List preview namespaces of the app
    List,
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), err);
            4
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let working_dir = std::env::current_dir().context("Failed to resolve working directory")?;
    let ctx = AppContext::load(working_dir)?;
    init_tracing(&ctx);

    let format = output_format(cli.global.json, ctx.settings().output.format, |key| {
        std::env::var(key).ok()
    });
    let printer = Printer::new(format);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async move {
        let cancel = cancel_on_ctrl_c();
        match dispatch(&ctx, &cli.global, cli.command, printer, cancel).await {
            Ok(code) => Ok(code),
            Err(err) => {
                printer.error(&err);
                Ok(err.exit_code())
            }
        }
    })
}

fn init_tracing(ctx: &AppContext) {
    let logging = &ctx.settings().logging;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("kiln={},warn", logging.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init(),
    }
}

/// Ctrl-C flips the returned token; pipeline stages stop at their next
/// batch or poll.
fn cancel_on_ctrl_c() -> CancelToken {
    let source = CancelSource::new();
    let token = source.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping after the current step");
            source.cancel();
        }
    });
    token
}

async fn dispatch(
    ctx: &AppContext,
    global: &GlobalArgs,
    command: Commands,
    printer: Printer,
    cancel: CancelToken,
) -> Result<i32, KilnError> {
    match command {
        Commands::Deploy(release) => {
            let model = load(ctx, global)?;
            let cluster = connect(global).await?;
            let mut options = deploy_options(ctx, &model_dir(ctx, global), &release);
            options.namespace = global.namespace.clone();
            let pipeline = Pipeline::new(&cluster, options).with_cancel(cancel);

            let report = pipeline.deploy(&model, &mut *plan_sink(printer)).await;
            printer.deploy_report(&report);
            Ok(report.exit_code())
        }

        Commands::Render => {
            let model = load(ctx, global)?;
            let mut render_ctx = RenderContext::new();
            if let Some(namespace) = &global.namespace {
                render_ctx = render_ctx.with_namespace(namespace.clone());
            }
            let bundle = render(&model, &render_ctx)?;
            if printer.is_json() {
                let document = serde_json::json!({
                    "app": bundle.app(),
                    "fingerprint": bundle.fingerprint(),
                    "objects": bundle.iter().map(|m| m.object_ref().to_string()).collect::<Vec<_>>(),
                    "yaml": bundle.to_yaml()?,
                });
                println!("{}", to_json_document(&document));
            } else {
                print!("{}", bundle.to_yaml()?);
                eprintln!("fingerprint: {}", bundle.fingerprint());
            }
            Ok(0)
        }

        Commands::History { app } => {
            let (app, namespace) = app_and_namespace(ctx, global, app)?;
            let cluster = connect(global).await?;
            let store = RevisionStore::new(&cluster, namespace, ctx.settings().revision_options());
            let revisions = store.list(&app).await?;
            printer.history(&app, &revisions);
            Ok(0)
        }

        Commands::Rollback {
            to,
            app,
            yes,
            release,
        } => {
            let (app, namespace) = app_and_namespace(ctx, global, app)?;
            let target = match to {
                Some(index) => format!("revision {}", index),
                None => "the previous revision".to_string(),
            };
            let prompt = format!("Roll {} in {} back to {}?", app, namespace, target);
            if !release.dry_run && !confirm(&prompt, yes || printer.is_json()).map_err(cli_error)? {
                return Ok(1);
            }

            let cluster = connect(global).await?;
            let options = deploy_options(ctx, &model_dir(ctx, global), &release);
            let pipeline = Pipeline::new(&cluster, options).with_cancel(cancel);
            let report = pipeline.rollback(&app, &namespace, to, &mut *plan_sink(printer)).await;
            printer.deploy_report(&report);
            Ok(report.exit_code())
        }

        Commands::Preview(args) => {
            let model = load(ctx, global)?;
            let cluster = connect(global).await?;
            let previews = PreviewManager::new(&cluster);

            match args.command {
                PreviewCommand::Up { id, release } => {
                    let namespace = previews.up(&model.name, &id).await?;
                    let mut options = deploy_options(ctx, &model_dir(ctx, global), &release);
                    options.namespace = Some(namespace.name);
                    let pipeline = Pipeline::new(&cluster, options).with_cancel(cancel);
                    let report = pipeline.deploy(&model, &mut *plan_sink(printer)).await;
                    printer.deploy_report(&report);
                    Ok(report.exit_code())
                }
                PreviewCommand::Down { id, yes } => {
                    let prompt = format!("Delete preview {} of {} and everything in it?", id, model.name);
                    if !confirm(&prompt, yes || printer.is_json()).map_err(cli_error)? {
                        return Ok(1);
                    }
                    if previews.down(&model.name, &id).await? {
                        printer.message(&format!("deleted preview {}", id));
                    } else {
                        printer.message(&format!("preview {} does not exist", id));
                    }
                    Ok(0)
                }
                PreviewCommand::List => {
                    let namespaces = previews.list(&model.name).await?;
                    printer.previews(&model.name, &namespaces);
                    Ok(0)
                }
            }
        }
    }
}

fn load(ctx: &AppContext, global: &GlobalArgs) -> Result<AppModel, KilnError> {
    let path = ctx.resolve(&global.file);
    load_model(&path, global.environment.as_deref())
}

fn model_dir(ctx: &AppContext, global: &GlobalArgs) -> PathBuf {
    ctx.resolve(&global.file)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| ctx.working_dir().to_path_buf())
}

/// App name and namespace from flags, falling back to the app definition.
fn app_and_namespace(
    ctx: &AppContext,
    global: &GlobalArgs,
    app: Option<String>,
) -> Result<(String, String), KilnError> {
    match (app, &global.namespace) {
        (Some(app), Some(namespace)) => Ok((app, namespace.clone())),
        (app, namespace) => {
            let model = load(ctx, global)?;
            Ok((
                app.unwrap_or(model.name),
                namespace.clone().unwrap_or(model.namespace),
            ))
        }
    }
}

async fn connect(global: &GlobalArgs) -> Result<KubeCluster, KilnError> {
    KubeCluster::connect(global.context.as_deref())
        .await
        .map_err(|e| KilnError::internal(format!("connect to cluster: {}", e)))
}

fn deploy_options(ctx: &AppContext, model_dir: &Path, release: &ReleaseArgs) -> DeployOptions {
    let mut options = ctx.deploy_options(resolve_author(model_dir));
    options.apply.dry_run = release.dry_run;
    options.apply.prune |= release.prune;
    if let Some(concurrency) = release.concurrency {
        options.apply = options.apply.with_concurrency(concurrency);
    }
    if let Some(timeout) = release.timeout {
        options.rollout = options.rollout.with_timeout(Duration::from_secs(timeout));
    }
    options
}

/// Where dry runs print rendered objects; stderr in JSON mode so stdout
/// carries only the report.
fn plan_sink(printer: Printer) -> Box<dyn io::Write> {
    if printer.is_json() {
        Box::new(io::stderr())
    } else {
        Box::new(io::stdout())
    }
}

fn cli_error(err: anyhow::Error) -> KilnError {
    KilnError::internal(format!("{:#}", err))
}

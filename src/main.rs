//! vdc-provisioner - operator CLI for the VM provisioning core

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use kube::{Client, CustomResourceExt};

use vdc_provisioner::catalog::{KubeTemplateStore, StaticTemplateStore, TemplateCatalog, TemplateStore};
use vdc_provisioner::config::{DriverKind, ProvisionerConfig, DEFAULT_TEMPLATE_NAMESPACE};
use vdc_provisioner::crd::VirtualDataCenter;
use vdc_provisioner::driver::build_driver;
use vdc_provisioner::kube_utils::create_client_with_timeout;
use vdc_provisioner::manifest::{ClusterObjectSink, ManifestBuilder, ObjectSink, RecordingSink};
use vdc_provisioner::provisioner::Provisioner;
use vdc_provisioner::quota::QuotaEnforcer;
use vdc_provisioner::telemetry::{init_tracing, LogFormat};
use vdc_provisioner::types::DeployRequest;

/// vdc-provisioner - deploy and inspect VMs inside tenant VDCs
#[derive(Parser, Debug)]
#[command(name = "vdc-provisioner", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Provisioning backend
    #[arg(long, global = true, env = "VDC_DRIVER", default_value_t = DriverKind::Cluster, value_enum)]
    driver: DriverKind,

    /// Path to a kubeconfig; inferred from the environment when unset
    #[arg(long, global = true, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Namespace templates are read from
    #[arg(long, global = true, env = "VDC_TEMPLATE_NAMESPACE", default_value = DEFAULT_TEMPLATE_NAMESPACE)]
    template_namespace: String,

    /// Web console base URL used for console links
    #[arg(long, global = true, env = "VDC_CONSOLE_URL")]
    console_url: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, global = true, env = "VDC_REQUEST_TIMEOUT_SECS", default_value = "30")]
    request_timeout_secs: u64,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

impl GlobalArgs {
    fn config(&self) -> anyhow::Result<ProvisionerConfig> {
        let config = ProvisionerConfig {
            driver: self.driver,
            kubeconfig: self.kubeconfig.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            template_namespace: self.template_namespace.clone(),
            console_base_url: self.console_url.clone(),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the VirtualDataCenter CRD manifest
    Crd,

    /// Check that the selected backend is reachable
    Check,

    /// List the normalized template catalog
    Templates {
        /// Read templates from a YAML file instead of the cluster
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,
    },

    /// Materialize a template offline and print the resulting objects
    Render(RenderArgs),

    /// Deploy a VM from a template into a VDC
    Deploy(DeployArgs),

    /// Print the normalized status of a VM
    Status {
        /// VM id
        id: String,

        /// Namespace the VM lives in
        #[arg(short = 'n', long)]
        namespace: String,
    },

    /// Apply a VDC's ResourceQuota and LimitRange to its workload namespace
    ApplyQuota {
        /// VirtualDataCenter YAML file
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RenderArgs {
    /// Template YAML file
    #[arg(short = 'f', long = "file")]
    file: PathBuf,

    /// Template id within the file
    #[arg(short = 't', long)]
    template: String,

    /// VM name
    #[arg(long)]
    name: String,

    /// Target namespace
    #[arg(short = 'n', long, default_value = "default")]
    namespace: String,

    /// Root disk size override
    #[arg(long)]
    disk_size: Option<String>,
}

#[derive(Args, Debug)]
struct DeployArgs {
    /// VirtualDataCenter YAML file the VM is deployed into
    #[arg(long = "vdc")]
    vdc_file: PathBuf,

    /// Template id
    #[arg(short = 't', long)]
    template: String,

    /// VM name
    #[arg(long)]
    name: String,

    /// Root disk size override
    #[arg(long)]
    disk_size: Option<String>,

    /// Read templates from a YAML file instead of the cluster
    #[arg(long = "templates")]
    templates_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(LogFormat::from_flag(cli.global.json_logs))?;

    match cli.command {
        Commands::Crd => {
            let crd = serde_yaml::to_string(&VirtualDataCenter::crd())
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("{crd}");
            Ok(())
        }
        Commands::Check => run_check(&cli.global).await,
        Commands::Templates { file } => run_templates(&cli.global, file.as_deref()).await,
        Commands::Render(args) => run_render(&cli.global, args).await,
        Commands::Deploy(args) => run_deploy(&cli.global, args).await,
        Commands::Status { id, namespace } => run_status(&cli.global, &id, &namespace).await,
        Commands::ApplyQuota { file } => run_apply_quota(&cli.global, &file).await,
    }
}

async fn client(config: &ProvisionerConfig) -> anyhow::Result<Client> {
    Ok(create_client_with_timeout(
        config.kubeconfig.as_deref(),
        config.connect_timeout,
        config.read_timeout,
    )
    .await?)
}

async fn read_file(path: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))
}

/// Template store from a file when given, else the cluster
async fn template_store(
    config: &ProvisionerConfig,
    file: Option<&Path>,
) -> anyhow::Result<Arc<dyn TemplateStore>> {
    match file {
        Some(path) => {
            let yaml = read_file(path).await?;
            Ok(Arc::new(StaticTemplateStore::from_yaml(
                config.template_namespace.clone(),
                &yaml,
            )?))
        }
        None => Ok(Arc::new(KubeTemplateStore::new(
            client(config).await?,
            config.template_namespace.clone(),
            config.request_timeout,
        ))),
    }
}

fn print_yaml<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(value)?);
    Ok(())
}

async fn run_check(global: &GlobalArgs) -> anyhow::Result<()> {
    let config = global.config()?;
    let driver = build_driver(&config).await?;
    driver.check_connection().await?;
    println!("{} backend reachable", driver.backend());
    Ok(())
}

async fn run_templates(global: &GlobalArgs, file: Option<&Path>) -> anyhow::Result<()> {
    let config = global.config()?;
    let catalog = TemplateCatalog::new(template_store(&config, file).await?);
    let templates = catalog.list_templates().await?;
    print_yaml(&templates)
}

async fn run_render(global: &GlobalArgs, args: RenderArgs) -> anyhow::Result<()> {
    let config = global.config()?;
    let catalog = TemplateCatalog::new(template_store(&config, Some(&args.file)).await?);
    let template = catalog.get_template(&args.template).await?;

    let request = DeployRequest {
        template_id: args.template,
        vm_name: args.name,
        namespace: args.namespace,
        disk_size: args.disk_size,
        vdc_id: String::new(),
    };
    let materialized = ManifestBuilder::new().materialize(&template, &request)?;
    for object in &materialized.objects {
        println!("---");
        print_yaml(&object.object)?;
    }
    Ok(())
}

async fn run_deploy(global: &GlobalArgs, args: DeployArgs) -> anyhow::Result<()> {
    let config = global.config()?;
    let vdc: VirtualDataCenter = serde_yaml::from_str(&read_file(&args.vdc_file).await?)
        .context("Failed to parse VirtualDataCenter")?;
    if let Some(bounds) = &vdc.spec.limit_range {
        bounds.validate()?;
    }

    let catalog = TemplateCatalog::new(template_store(&config, args.templates_file.as_deref()).await?);
    let driver = build_driver(&config).await?;
    let sink: Arc<dyn ObjectSink> = match config.driver {
        DriverKind::Cluster => Arc::new(ClusterObjectSink::new(
            client(&config).await?,
            config.request_timeout,
        )),
        DriverKind::Simulated => Arc::new(RecordingSink::new()),
    };

    let request = DeployRequest {
        template_id: args.template,
        vm_name: args.name,
        namespace: vdc.workload_namespace().to_string(),
        disk_size: args.disk_size,
        vdc_id: vdc.id(),
    };
    let deployment = Provisioner::new(catalog, driver.clone(), sink)
        .deploy(&request, &vdc)
        .await?;

    let status = driver
        .get_vm_status(&deployment.vm.id, &deployment.namespace)
        .await?;
    println!(
        "deployed {} into {} ({} companion objects)",
        deployment.vm.id,
        deployment.namespace,
        deployment.objects.len()
    );
    print_yaml(&status)
}

async fn run_status(global: &GlobalArgs, id: &str, namespace: &str) -> anyhow::Result<()> {
    let config = global.config()?;
    let driver = build_driver(&config).await?;
    let status = driver.get_vm_status(id, namespace).await?;
    print_yaml(&status)
}

async fn run_apply_quota(global: &GlobalArgs, file: &Path) -> anyhow::Result<()> {
    let config = global.config()?;
    if config.driver != DriverKind::Cluster {
        anyhow::bail!("apply-quota needs the cluster driver");
    }
    let vdc: VirtualDataCenter = serde_yaml::from_str(&read_file(file).await?)
        .context("Failed to parse VirtualDataCenter")?;

    let enforcer = QuotaEnforcer::new(
        client(&config).await?,
        config.field_manager.clone(),
        config.request_timeout,
    );
    enforcer.apply_vdc(&vdc).await?;
    println!(
        "applied quota for VDC {} to namespace {}",
        vdc.id(),
        vdc.workload_namespace()
    );
    Ok(())
}

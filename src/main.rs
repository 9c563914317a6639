use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use indicatif::HumanBytes;
use log::{debug, info, LevelFilter};
use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use layerpeek::registry::DEFAULT_INDEX;
use layerpeek::{
    assembler, ExtractOptions, Image, ImageName, MatchMode, Notifier, RegistryClient,
    RegistryConfig,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace). Also switches to text-based progress"
    )]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Download an image from a registry into <repo>_<tag>.tar.gz
    Pull {
        #[arg(help = "Image to pull (e.g., alpine:3.19)")]
        image: String,

        #[arg(short, long, default_value = ".", help = "Directory for the image tarball")]
        output: PathBuf,

        #[command(flatten)]
        registry: RegistryArgs,
    },
    /// List the tags of a repository
    Tags {
        #[arg(help = "Repository name (e.g., alpine)")]
        image: String,

        #[command(flatten)]
        registry: RegistryArgs,
    },
    /// Show the layers of an image tarball and the files each one adds
    Layers {
        #[arg(help = "Image tarball (docker save or pulled bundle)")]
        bundle: PathBuf,

        #[arg(long, help = "Only print the layer summary")]
        summary: bool,
    },
    /// Copy one file out of an image tarball
    Extract {
        #[arg(help = "Image tarball (docker save or pulled bundle)")]
        bundle: PathBuf,

        #[arg(help = "Path of the file inside the image (e.g., /etc/os-release)")]
        path: String,

        #[arg(
            short,
            long,
            default_value_t = 2,
            help = "Archive levels to search, the tarball itself included"
        )]
        depth: usize,

        #[arg(long, help = "Match any entry whose name is contained in PATH")]
        substring: bool,

        #[arg(short, long, default_value = ".", help = "Directory to write the file to")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct RegistryArgs {
    #[arg(long, env = "LAYERPEEK_INDEX", default_value = DEFAULT_INDEX, help = "Index endpoint")]
    index: String,

    #[arg(long, env = "LAYERPEEK_REGISTRY", help = "Override registry endpoint")]
    registry: Option<String>,

    #[arg(long, env = "LAYERPEEK_USERNAME", default_value = "", help = "Registry username")]
    username: String,

    #[arg(
        long,
        env = "LAYERPEEK_PASSWORD",
        default_value = "",
        hide_env_values = true,
        help = "Registry password"
    )]
    password: String,

    #[arg(long, env = "LAYERPEEK_PROXY", help = "HTTP/HTTPS proxy")]
    proxy: Option<String>,

    #[arg(long, help = "Do not verify TLS certificates")]
    insecure: bool,

    #[arg(long, default_value_t = 300, help = "Request timeout in seconds")]
    timeout: u64,
}

impl RegistryArgs {
    /// Resolves the image name and builds the client configuration for it.
    fn client_for(&self, image: &str) -> Result<(RegistryClient, ImageName)> {
        let mut name = ImageName::parse(image)?;
        if self.registry.is_none() && self.index.trim_end_matches('/') == DEFAULT_INDEX {
            name = name.with_library_prefix();
        }

        let config = RegistryConfig::new(&self.index, name.repository.clone())?
            .with_registry(self.registry.as_deref())?
            .with_proxy(self.proxy.clone())
            .with_insecure(self.insecure)
            .with_credentials(&self.username, &self.password)
            .with_timeout(Duration::from_secs(self.timeout));
        debug!("Registry endpoint: {}", config.base_url());

        let client = RegistryClient::new(config).context("Failed to create registry client")?;
        Ok((client, name))
    }
}

fn print_layers(image: &Image, summary: bool) {
    if let Some(tag) = image.tag() {
        println!("Image:          {}", tag);
    }
    println!(
        "Platform:       {}/{}",
        image.config().os,
        image.config().architecture
    );
    if let Some(version) = image.docker_version() {
        println!("Docker version: {}", version);
    }
    if let Some(created) = image.created() {
        println!("Created:        {}", created.to_rfc3339());
    }
    println!("Total size:     {}", HumanBytes(image.size()));
    println!();

    let nodes = image.nodes();
    for (layer, node) in image.layers().iter().zip(nodes) {
        println!("{}", layer);
        if summary {
            continue;
        }
        println!("  {}", node.label);
        for entry in node.entries {
            println!("    {}", entry);
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity level
    let log_level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(log_level)
        .init();

    let notifier = Notifier::new(cli.verbose);

    match cli.command {
        Command::Pull {
            image,
            output,
            registry,
        } => {
            info!("Pulling {}", image);
            let (mut client, name) = registry.client_for(&image)?;
            let pulled = assembler::pull(&mut client, &name, &output, &notifier)
                .with_context(|| format!("Failed to pull {}", name))?;
            println!(
                "{} ({} layers, {})",
                pulled.path.display(),
                pulled.manifest.layers.len(),
                HumanBytes(pulled.declared_size)
            );
        }
        Command::Tags { image, registry } => {
            let (mut client, name) = registry.client_for(&image)?;
            let tags = client
                .list_tags(&name.repository)
                .with_context(|| format!("Failed to list tags of {}", name.repository))?;
            for tag in tags.tags {
                println!("{}", tag);
            }
        }
        Command::Layers { bundle, summary } => {
            let file = File::open(&bundle)
                .with_context(|| format!("Failed to open {}", bundle.display()))?;
            let image = Image::parse(file)
                .with_context(|| format!("Failed to parse {}", bundle.display()))?;
            print_layers(&image, summary);
        }
        Command::Extract {
            bundle,
            path,
            depth,
            substring,
            output,
        } => {
            let options = ExtractOptions::new(output)
                .with_depth(depth)
                .with_match_mode(if substring {
                    MatchMode::Substring
                } else {
                    MatchMode::Exact
                });
            let file = File::open(&bundle)
                .with_context(|| format!("Failed to open {}", bundle.display()))?;
            let image = Image::parse(file)
                .with_context(|| format!("Failed to parse {}", bundle.display()))?;
            let file = File::open(&bundle)
                .with_context(|| format!("Failed to open {}", bundle.display()))?;
            let written = image
                .extract(file, &path, &options)
                .with_context(|| format!("Failed to extract {} from {}", path, bundle.display()))?;
            println!("{}", written.display());
        }
    }

    Ok(())
}

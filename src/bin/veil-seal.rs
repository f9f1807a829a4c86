use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::{debug, LevelFilter};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use veilconf::crypto::{DeviceFingerprint, Envelope, HostFingerprint, KeyPurpose};
use veilconf::platform::PcPlatform;
use veilconf::seal::{identity_hex, Sealer};

#[derive(Parser)]
#[command(
    name = "veil-seal",
    author,
    version,
    about = "Produce sealed manifests, payloads and bootstrap fragments for veilconf clients"
)]
struct Cli {
    #[arg(long, global = true)]
    debug: bool,
    /// Fleet identity (hex) the clients are configured with.
    #[arg(long, global = true, env = "VEIL_FLEET")]
    fleet: Option<String>,
    /// PBKDF2 rounds; must match the clients' `kdf.rounds`.
    #[arg(long, global = true, default_value_t = 10_000)]
    rounds: u32,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Layer {
    /// Bootstrap manifest listing real endpoints.
    Manifest,
    /// Main configuration payload.
    Payload,
}

impl From<Layer> for KeyPurpose {
    fn from(layer: Layer) -> Self {
        match layer {
            Layer::Manifest => KeyPurpose::Content,
            Layer::Payload => KeyPurpose::Main,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Seal a manifest (from --endpoint) or a payload (from --input).
    Seal {
        #[arg(long, value_enum)]
        layer: Layer,
        /// Real endpoint to list in a manifest; repeat for several.
        #[arg(long = "endpoint", value_name = "URL")]
        endpoints: Vec<String>,
        #[arg(long, value_name = "FILE")]
        input: Option<PathBuf>,
        #[arg(long, value_name = "SECS", default_value_t = 7 * 24 * 3600)]
        ttl: u64,
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Split a bootstrap URL into an encrypted fragment set (JSON).
    Fragment {
        #[arg(long)]
        url: String,
        #[arg(long, value_name = "N", default_value_t = 6)]
        pieces: usize,
    },
    /// Verify and decrypt an envelope.
    Open {
        #[arg(long, value_enum)]
        layer: Layer,
        #[arg(long, value_name = "FILE")]
        input: PathBuf,
    },
    /// Print this host's identity as hex, usable as a fleet identity.
    Fingerprint,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match cli.command {
        Commands::Fingerprint => {
            let source = HostFingerprint::new(Arc::new(PcPlatform::new()));
            let fingerprint = DeviceFingerprint::compute(&source).context("computing host fingerprint")?;
            println!("{}", identity_hex(&source).context("reading host identity")?);
            debug!("group label {}", fingerprint.group_label());
        }
        Commands::Seal { layer, endpoints, input, ttl, out } => {
            let sealer = sealer(cli.fleet.as_deref(), cli.rounds)?;
            let ttl = Duration::from_secs(ttl);
            let envelope = match layer {
                Layer::Manifest => {
                    if endpoints.is_empty() {
                        bail!("a manifest needs at least one --endpoint");
                    }
                    sealer.seal_manifest(&endpoints, ttl)?
                }
                Layer::Payload => {
                    let path = input.context("a payload needs --input")?;
                    let plaintext =
                        fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
                    sealer.seal_payload(&plaintext, ttl)?
                }
            };
            let json = envelope.to_json();
            match out {
                Some(path) => {
                    fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
                    debug!("sealed {:?} envelope to {}", layer, path.display());
                }
                None => println!("{}", json),
            }
        }
        Commands::Fragment { url, pieces } => {
            let sealer = sealer(cli.fleet.as_deref(), cli.rounds)?;
            let set = sealer.fragment(&url, pieces)?;
            println!("{}", serde_json::to_string_pretty(&set)?);
        }
        Commands::Open { layer, input } => {
            let sealer = sealer(cli.fleet.as_deref(), cli.rounds)?;
            let text = fs::read_to_string(&input).with_context(|| format!("reading {}", input.display()))?;
            let envelope = Envelope::from_json(&text).context("parsing envelope")?;
            let plaintext = sealer
                .open(layer.into(), &envelope)
                .context("envelope did not verify")?;
            println!("{}", String::from_utf8_lossy(&plaintext));
        }
    }
    Ok(())
}

fn sealer(fleet: Option<&str>, rounds: u32) -> Result<Sealer> {
    let Some(fleet) = fleet else {
        bail!("--fleet (or VEIL_FLEET) is required");
    };
    Sealer::for_fleet(fleet, rounds).context("fleet identity is not usable")
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(default));
    builder.format_timestamp(None);
    if debug {
        builder.filter_level(LevelFilter::Debug);
    }
    let _ = builder.try_init();
}
